//! Diagnose - Capability-Checks vor einem Anruf
//!
//! Prüft nacheinander WebRTC-Unterstützung, Mikrofon-Zugriff und Audio-Ausgabe.
//! Ein fehlgeschlagener Check bricht den Lauf nicht ab.

use crate::call_engine::{
    build_api, frame_level, probe_output_device, AudioError, CpalCapture, MediaCapture,
};
use crate::config::{AudioConstraints, CallConfig};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Ab diesem Pegel gilt das Mikrofon als aktiv (5%)
pub const SIGNAL_THRESHOLD: f32 = 0.05;

const LEVEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// TYPES
// ============================================================================

#[async_trait]
pub trait DiagnosticCheck: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(detail)` wenn bestanden, sonst `Err(grund)`
    async fn run(&self) -> Result<String, String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticReport {
    pub results: Vec<CheckResult>,
}

impl DiagnosticReport {
    pub fn all_passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.outcome, CheckOutcome::Passed(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, CheckOutcome::Failed(_)))
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Führt alle Checks der Reihe nach aus, mit einer Pause dazwischen
pub async fn run_diagnostics(
    checks: &[Box<dyn DiagnosticCheck>],
    pacing: Duration,
) -> DiagnosticReport {
    let mut report = DiagnosticReport::default();

    for (index, check) in checks.iter().enumerate() {
        if index > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }

        let outcome = match check.run().await {
            Ok(detail) => {
                tracing::info!("Diagnostic '{}' passed: {}", check.name(), detail);
                CheckOutcome::Passed(detail)
            }
            Err(reason) => {
                tracing::warn!("Diagnostic '{}' failed: {}", check.name(), reason);
                CheckOutcome::Failed(reason)
            }
        };

        report.results.push(CheckResult {
            name: check.name().to_string(),
            outcome,
        });
    }

    report
}

/// Standard-Checks für die aktuelle Konfiguration
pub fn default_checks(config: &CallConfig) -> Vec<Box<dyn DiagnosticCheck>> {
    vec![
        Box::new(WebRtcSupportCheck),
        Box::new(MicrophoneAccessCheck {
            capture: Arc::new(CpalCapture),
            constraints: config.audio.clone(),
        }),
        Box::new(AudioOutputCheck),
    ]
}

// ============================================================================
// CHECKS
// ============================================================================

pub struct WebRtcSupportCheck;

#[async_trait]
impl DiagnosticCheck for WebRtcSupportCheck {
    fn name(&self) -> &str {
        "WebRTC support"
    }

    async fn run(&self) -> Result<String, String> {
        build_api()
            .map(|_| "supported".to_string())
            .map_err(|e| format!("not supported: {e}"))
    }
}

/// Öffnet das Mikrofon und gibt es sofort wieder frei
pub struct MicrophoneAccessCheck {
    pub capture: Arc<dyn MediaCapture>,
    pub constraints: AudioConstraints,
}

#[async_trait]
impl DiagnosticCheck for MicrophoneAccessCheck {
    fn name(&self) -> &str {
        "Microphone"
    }

    async fn run(&self) -> Result<String, String> {
        let mut handle = self
            .capture
            .acquire(&self.constraints)
            .await
            .map_err(|e| format!("access denied: {e}"))?;
        handle.stop();
        Ok("access granted".to_string())
    }
}

pub struct AudioOutputCheck;

#[async_trait]
impl DiagnosticCheck for AudioOutputCheck {
    fn name(&self) -> &str {
        "Audio output"
    }

    async fn run(&self) -> Result<String, String> {
        probe_output_device().map_err(|e| e.to_string())
    }
}

// ============================================================================
// MICROPHONE LEVEL TEST
// ============================================================================

/// Misst den Mikrofon-Pegel bis Sprache erkannt wird oder `timeout` abläuft
///
/// `on_level` bekommt alle 100ms den aktuellen Pegel (0.0 - 1.0).
pub async fn microphone_level_test<F>(
    capture: &dyn MediaCapture,
    constraints: &AudioConstraints,
    timeout: Duration,
    mut on_level: F,
) -> Result<f32, AudioError>
where
    F: FnMut(f32) + Send,
{
    let mut handle = capture.acquire(constraints).await?;
    let deadline = Instant::now() + timeout;
    let mut interval = tokio::time::interval(LEVEL_POLL_INTERVAL);

    let result = loop {
        interval.tick().await;

        let mut level = handle.input_level();
        while let Some(frame) = handle.read_frame() {
            level = level.max(frame_level(&frame));
        }
        on_level(level);

        if level > SIGNAL_THRESHOLD {
            break Ok(level);
        }
        if Instant::now() >= deadline {
            break Err(AudioError::NoSignal(timeout));
        }
    };

    handle.stop();
    result
}
