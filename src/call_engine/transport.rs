//! Peer Transport - WebRTC Peer Connection
//!
//! ICE, DTLS und Codec-Verhandlung erledigt der `webrtc` Crate.
//! Der Koordinator sieht nur `PeerTransport` und bekommt Zustandsänderungen
//! über genau einen registrierten `TransportObserver`.
//!
//! Da es beim manuellen Signaling kein Trickle-ICE gibt, wartet der Transport
//! bis das ICE Gathering abgeschlossen ist und gibt erst dann die SDP heraus.

use crate::config::CallConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Opus läuft in SDP immer mit 48kHz Clock Rate
const OPUS_CLOCK_RATE: u32 = 48000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No local description available")]
    NoLocalDescription,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Zustand des darunterliegenden Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Beschreibung des Remote-Audio-Tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    RemoteTrack(RemoteStream),
}

/// Einziger Empfänger der Events eines Transports
pub trait TransportObserver: Send + Sync {
    fn on_event(&self, event: TransportEvent);
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// Erzeugt pro Session einen neuen Transport
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Offer/Answer-Verhandlung auf einem Transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Erzeugt das lokale Offer und gibt die fertige SDP zurück
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Setzt das Remote-Offer und gibt die SDP des lokalen Answers zurück
    async fn accept_offer(&self, offer_sdp: String) -> Result<String, TransportError>;

    /// Setzt das Remote-Answer (nur Caller)
    async fn apply_answer(&self, answer_sdp: String) -> Result<(), TransportError>;

    async fn close(&self);
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

/// Baut eine webrtc API mit Standard-Codecs und Interceptors
pub fn build_api() -> Result<API, TransportError> {
    // Media Engine mit Opus konfigurieren
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| TransportError::WebRTC(e.to_string()))?;

    // Interceptors für RTCP, NACK etc.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| TransportError::WebRTC(e.to_string()))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &CallConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::new(config, observer).await?;
        Ok(Arc::new(transport))
    }
}

/// `PeerTransport` über eine `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticRTP>,
    gather_timeout: Duration,
}

impl WebRtcTransport {
    pub async fn new(
        config: &CallConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Result<Self, TransportError> {
        let api = build_api()?;

        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::WebRTC(e.to_string()))?,
        );

        Self::register_handlers(&pc, observer);

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: config.audio.channels,
                ..Default::default()
            },
            "audio".to_string(),
            "pastecall".to_string(),
        ));

        Ok(Self {
            pc,
            audio_track,
            gather_timeout: config.ice_gather_timeout(),
        })
    }

    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(pc: &Arc<RTCPeerConnection>, observer: Arc<dyn TransportObserver>) {
        // Connection State Handler
        let state_observer = Arc::clone(&observer);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            state_observer.on_event(TransportEvent::StateChanged(s.into()));
            Box::pin(async {})
        }));

        // Track Handler (für eingehendes Audio)
        pc.on_track(Box::new(move |track, _, _| {
            let observer = Arc::clone(&observer);
            Box::pin(async move {
                let codec = track.codec();
                tracing::info!("Received track: {}", codec.capability.mime_type);

                observer.on_event(TransportEvent::RemoteTrack(RemoteStream {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    mime_type: codec.capability.mime_type.clone(),
                }));

                // RTP lesen damit die Interceptors weiterlaufen
                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    tracing::debug!("Remote track ended after {} RTP packets", packets);
                });
            })
        }));
    }

    async fn add_audio_track(&self) -> Result<(), TransportError> {
        self.pc
            .add_track(Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;
        Ok(())
    }

    /// Setzt die lokale Description und wartet auf das Ende des ICE Gatherings
    async fn set_local_and_gather(
        &self,
        description: RTCSessionDescription,
    ) -> Result<String, TransportError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        if tokio::time::timeout(self.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            tracing::warn!(
                "ICE gathering not complete after {:?}, exporting partial candidates",
                self.gather_timeout
            );
        }

        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or(TransportError::NoLocalDescription)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.add_audio_track().await?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        self.set_local_and_gather(offer).await
    }

    async fn accept_offer(&self, offer_sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.add_audio_track().await?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        self.set_local_and_gather(answer).await
    }

    async fn apply_answer(&self, answer_sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}
