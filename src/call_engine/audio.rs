//! Audio Capture - Mikrofon-Zugriff
//!
//! Verwendet cpal für Cross-Platform Audio I/O.
//! Der Koordinator sieht nur die Traits `MediaCapture` und `CaptureHandle`,
//! damit sich die Aufnahme in Tests ersetzen lässt.

use crate::config::AudioConstraints;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Frame-Dauer in Millisekunden (20ms wie bei Opus)
pub const FRAME_MS: u32 = 20;

/// Anzahl Frames im Ring-Buffer
const RING_BUFFER_FRAMES: usize = 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Audio input device not found: {0}")]
    InputDeviceNotFound(String),

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to enumerate audio devices: {0}")]
    Enumeration(String),

    #[error("No input signal detected within {0:?}")]
    NoSignal(Duration),
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// Zugriff auf ein Aufnahmegerät
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Öffnet das Mikrofon; schlägt fehl wenn Benutzer/OS den Zugriff verweigern
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Box<dyn CaptureHandle>, AudioError>;
}

/// Exklusiver Handle auf eine laufende Aufnahme
pub trait CaptureHandle: Send {
    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;

    /// RMS-Pegel des letzten Callbacks (0.0 - 1.0)
    fn input_level(&self) -> f32;

    /// Liest einen Frame aus dem Ring-Buffer, falls genug Samples vorliegen
    fn read_frame(&self) -> Option<Vec<f32>>;

    /// Gibt das Gerät frei. Mehrfacher Aufruf ist erlaubt.
    fn stop(&mut self);
}

/// RMS eines Frames, auf 1.0 begrenzt
pub fn frame_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
    rms.min(1.0)
}

// ============================================================================
// CPAL CAPTURE
// ============================================================================

/// `MediaCapture` über das Standard-Host-API von cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCapture;

#[async_trait]
impl MediaCapture for CpalCapture {
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Box<dyn CaptureHandle>, AudioError> {
        let handler = AudioHandler::open(constraints)?;
        Ok(Box::new(handler))
    }
}

/// Handler für den Audio Input
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct AudioHandler {
    // Stream wird in Option gehalten und bei stop() gedroppt
    input_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Mono PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    frame_size: usize,

    is_muted: Arc<Mutex<bool>>,

    input_level: Arc<Mutex<f32>>,
}

// AudioHandler ist nicht automatisch Send wegen Stream.
// Der Stream wird nur erzeugt und gedroppt, nie über Threads hinweg benutzt.
unsafe impl Send for AudioHandler {}

impl AudioHandler {
    /// Öffnet das Eingabegerät und startet die Aufnahme
    pub fn open(constraints: &AudioConstraints) -> Result<Self, AudioError> {
        let device = Self::select_input_device(constraints)?;

        let frame_size = frame_size(constraints.sample_rate);
        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(frame_size * RING_BUFFER_FRAMES)));

        let mut handler = Self {
            input_stream: None,
            capture_buffer,
            frame_size,
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
        };
        handler.start_capture(&device, constraints.sample_rate)?;

        Ok(handler)
    }

    fn select_input_device(constraints: &AudioConstraints) -> Result<Device, AudioError> {
        let host = cpal::default_host();

        match constraints.input_device.as_deref() {
            None => host.default_input_device().ok_or(AudioError::NoInputDevice),
            Some(wanted) => host
                .input_devices()
                .map_err(|e| AudioError::Enumeration(e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| AudioError::InputDeviceNotFound(wanted.to_string())),
        }
    }

    /// Startet Audio Capture (Mikrofon)
    fn start_capture(&mut self, device: &Device, target_sample_rate: u32) -> Result<(), AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect(), target_sample_rate)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels.max(1) as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Downmix auf Mono
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    *input_level.lock() = frame_level(&mono);

                    if *is_muted.lock() {
                        return;
                    }

                    let samples = resample_linear(&mono, source_sample_rate, target_sample_rate);

                    // Voller Buffer verwirft neue Samples
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }
}

impl CaptureHandle for AudioHandler {
    fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < self.frame_size {
            return None;
        }
        Some((0..self.frame_size).filter_map(|_| buffer.try_pop()).collect())
    }

    fn stop(&mut self) {
        if self.input_stream.take().is_some() {
            *self.input_level.lock() = 0.0;
            tracing::info!("Audio capture stopped");
        }
    }
}

impl Drop for AudioHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Samples pro Frame bei `sample_rate`, mindestens 1
fn frame_size(sample_rate: u32) -> usize {
    (u64::from(sample_rate) * u64::from(FRAME_MS) / 1000).max(1) as usize
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<StreamConfig, AudioError> {
    // Priorität: Ziel-Rate in F32 > F32 mit anderer Rate > erste verfügbare
    let target_rate = cpal::SampleRate(sample_rate);
    let supports_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(*c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|config| config.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}

// ============================================================================
// DEVICE ENUMERATION
// ============================================================================

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

/// Alle Ein- und Ausgabegeräte des Standard-Hosts
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioDevices {
    pub inputs: Vec<AudioDevice>,
    pub outputs: Vec<AudioDevice>,
}

/// Gibt alle verfügbaren Audio-Geräte zurück
pub fn list_devices() -> Result<AudioDevices, AudioError> {
    let host = cpal::default_host();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let collect = |devices: Vec<Device>, default: &Option<String>| -> Vec<AudioDevice> {
        devices
            .into_iter()
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default.as_ref(),
                    name,
                })
            })
            .collect()
    };

    let inputs: Vec<Device> = host
        .input_devices()
        .map_err(|e| AudioError::Enumeration(e.to_string()))?
        .collect();
    let outputs: Vec<Device> = host
        .output_devices()
        .map_err(|e| AudioError::Enumeration(e.to_string()))?
        .collect();

    Ok(AudioDevices {
        inputs: collect(inputs, &default_input),
        outputs: collect(outputs, &default_output),
    })
}

/// Prüft ob ein Ausgabegerät mit gültiger Konfiguration existiert
pub fn probe_output_device() -> Result<String, AudioError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    Ok(format!(
        "{} ({} Hz, {} channel(s))",
        name,
        config.sample_rate().0,
        config.channels()
    ))
}
