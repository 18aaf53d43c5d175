//! Session Descriptor - Text-Format für manuelles Signaling
//!
//! Wire-Format:
//! `{ "type": "offer"|"answer", "sdp": "...", "caller": bool }`
//!
//! Zusätzlich gibt es eine Base64-"armored" Variante, die sich als
//! einzelne Zeile besser kopieren lässt. Beim Parsen werden beide Formen akzeptiert.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Malformed session descriptor: {0}")]
    Malformed(String),

    #[error("Role mismatch: {0}")]
    RoleMismatch(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Rolle innerhalb einer Session, wird einmal pro Session gesetzt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallRole::Caller => f.write_str("caller"),
            CallRole::Callee => f.write_str("callee"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl DescriptorKind {
    /// Die Rolle, die Descriptors dieser Art erzeugt
    pub fn producer_role(self) -> CallRole {
        match self {
            DescriptorKind::Offer => CallRole::Caller,
            DescriptorKind::Answer => CallRole::Callee,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorKind::Offer => "offer",
            DescriptorKind::Answer => "answer",
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offer oder Answer mit der opaken SDP des Transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub kind: DescriptorKind,
    pub sdp: String,
    pub role: CallRole,
}

/// JSON-Form wie sie zwischen den Peers kopiert wird
#[derive(Debug, Serialize, Deserialize)]
struct WireDescriptor {
    #[serde(rename = "type")]
    kind: DescriptorKind,
    sdp: String,
    caller: bool,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            sdp: sdp.into(),
            role: CallRole::Caller,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            sdp: sdp.into(),
            role: CallRole::Callee,
        }
    }

    /// Kanonische JSON-Form
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "type": self.kind.as_str(),
            "sdp": self.sdp,
            "caller": self.role == CallRole::Caller,
        })
        .to_string()
    }

    /// Base64 der JSON-Form (eine Zeile, ohne Sonderzeichen)
    pub fn to_armored(&self) -> String {
        BASE64.encode(self.to_json())
    }

    pub fn encode(&self, armored: bool) -> String {
        if armored {
            self.to_armored()
        } else {
            self.to_json()
        }
    }

    /// Parst einen eingefügten Descriptor und erwartet eine bestimmte Art
    pub fn parse(text: &str, expected: DescriptorKind) -> Result<Self, DescriptorError> {
        let descriptor = Self::parse_any(text)?;
        if descriptor.kind != expected {
            return Err(DescriptorError::Malformed(format!(
                "expected {expected}, got {}",
                descriptor.kind
            )));
        }
        Ok(descriptor)
    }

    /// Parst einen Descriptor beliebiger Art
    pub fn parse_any(text: &str) -> Result<Self, DescriptorError> {
        let json = Self::unarmor(text.trim())?;

        let wire: WireDescriptor = serde_json::from_str(&json)
            .map_err(|e| DescriptorError::Malformed(e.to_string()))?;

        if wire.sdp.trim().is_empty() {
            return Err(DescriptorError::Malformed("empty sdp".to_string()));
        }

        let role = if wire.caller {
            CallRole::Caller
        } else {
            CallRole::Callee
        };

        if role != wire.kind.producer_role() {
            return Err(DescriptorError::RoleMismatch(format!(
                "{} descriptor marked as produced by {}",
                wire.kind, role
            )));
        }

        Ok(Self {
            kind: wire.kind,
            sdp: wire.sdp,
            role,
        })
    }

    fn unarmor(text: &str) -> Result<String, DescriptorError> {
        if text.is_empty() {
            return Err(DescriptorError::Malformed("empty input".to_string()));
        }
        if text.starts_with('{') {
            return Ok(text.to_string());
        }

        let bytes = BASE64
            .decode(text)
            .map_err(|e| DescriptorError::Malformed(format!("neither JSON nor base64: {e}")))?;

        String::from_utf8(bytes)
            .map_err(|_| DescriptorError::Malformed("armored payload is not UTF-8".to_string()))
    }
}
