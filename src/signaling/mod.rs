//! Signaling Module - manueller Austausch von Offer/Answer
//!
//! Es gibt keinen Signaling-Server: der Benutzer kopiert den Text
//! selbst zum Gegenüber (Chat, E-Mail, ...).

mod descriptor;

pub use descriptor::{CallRole, DescriptorError, DescriptorKind, SessionDescriptor};
