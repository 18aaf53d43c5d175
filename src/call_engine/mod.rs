//! Call Engine Module - Verbindungsaufbau und Audio
//!
//! Dieses Modul verwaltet:
//! - den Call Setup Koordinator (State Machine)
//! - WebRTC Peer Connections hinter `PeerTransport`
//! - Audio Capture (Mikrofon) hinter `MediaCapture`

mod audio;
mod engine;
mod transport;

pub use audio::{
    frame_level, list_devices, probe_output_device, AudioDevice, AudioDevices, AudioError,
    AudioHandler, CaptureHandle, CpalCapture, MediaCapture, FRAME_MS,
};
pub use engine::{CallError, CallEvent, CallSetupCoordinator, ConnectionState};
pub use transport::{
    build_api, PeerTransport, RemoteStream, TransportError, TransportEvent, TransportFactory,
    TransportObserver, TransportState, WebRtcTransport, WebRtcTransportFactory,
};
