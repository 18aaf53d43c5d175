//! pastecall - P2P Voice Calls ohne Server
//!
//! Eine serverlose P2P Voice-Call-Bibliothek mit:
//! - manuellem Signaling (Offer/Answer per Copy & Paste)
//! - WebRTC für P2P Audio-Kommunikation
//! - cpal für den Mikrofon-Zugriff
//! - Diagnose-Checks für WebRTC, Mikrofon und Audio-Ausgabe
//!
//! ## Ablauf
//! ```no_run
//! # async fn demo() -> Result<(), pastecall::CallError> {
//! use pastecall::{CallConfig, CallSetupCoordinator};
//!
//! let (caller, _events) = CallSetupCoordinator::with_webrtc(CallConfig::default());
//! let offer = caller.start_as_caller().await?;
//! println!("{}", offer.to_json()); // an den Peer schicken
//!
//! // ... Answer vom Peer einfügen
//! # let answer_text = String::new();
//! caller.apply_remote_answer(&answer_text).await?;
//! # Ok(())
//! # }
//! ```

pub mod call_engine;
pub mod config;
pub mod diagnostics;
pub mod signaling;

pub use call_engine::{CallError, CallEvent, CallSetupCoordinator, ConnectionState};
pub use config::{CallConfig, ConfigError};
pub use signaling::{CallRole, DescriptorKind, SessionDescriptor};
