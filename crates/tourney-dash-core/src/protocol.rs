// Wire protocol: JSON text frames exchanged between the relay and its clients.
//
// Every inbound frame passes through `parse_envelope`, which is the only place
// untrusted network text turns into typed values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::settings::SettingsState;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("frame does not match the settings schema: {0}")]
    Schema(#[source] serde_json::Error),

    #[error("settings violate the pick/ban invariant: {0}")]
    Invariant(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A message on the wire, discriminated by its `kind` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    /// Full settings snapshot. Replaces the receiver's state wholesale.
    Settings { state: SettingsState },
    /// Handshake / version probe carrying the sender's build identifier.
    Hello {
        #[serde(rename = "buildId", default, skip_serializing_if = "Option::is_none")]
        build_id: Option<String>,
    },
}

impl Envelope {
    pub fn settings(state: SettingsState) -> Self {
        Envelope::Settings { state }
    }

    pub fn hello(build_id: impl Into<String>) -> Self {
        Envelope::Hello {
            build_id: Some(build_id.into()),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Parse and validate one inbound text frame.
///
/// All-or-nothing: a settings payload that is missing a required field, has a
/// wrong primitive type, names an unknown screen, or breaks the pick/ban
/// invariant is rejected as a whole.
pub fn parse_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Json)?;
    let envelope: Envelope = serde_json::from_value(value).map_err(ProtocolError::Schema)?;

    if let Envelope::Settings { state } = &envelope {
        state.check_invariants()?;
    }

    Ok(envelope)
}

/// Validate a bare settings object (without the envelope around it).
pub fn validate(raw: Value) -> Result<SettingsState, ProtocolError> {
    let state: SettingsState = serde_json::from_value(raw).map_err(ProtocolError::Schema)?;
    state.check_invariants()?;
    Ok(state)
}
