//! Outbound control commands for the session coordinator.
//!
//! These are opaque to the core: it serializes and sends them, performing
//! no validation beyond shape.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

/// Command sent from the dashboard to the remote coordinator.
///
/// Encoded with proto-JSON field names (camelCase), matching what the
/// coordinator's request decoder expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlCommand {
    /// Ask the coordinator to re-evaluate the workspace.
    ReloadWorkspace(bool),
    /// Switch the session to a different workspace/environment.
    SetWorkspace(SetWorkspace),
    /// Terminal input bytes (base64 encoded).
    Stdin(String),
    /// Terminal window resize.
    Resize(Resize),
}

impl ControlCommand {
    /// The reload command; carries no payload beyond its marker.
    #[must_use]
    pub const fn reload_workspace() -> Self {
        Self::ReloadWorkspace(true)
    }

    /// Create a stdin command from raw bytes.
    #[must_use]
    pub fn stdin(data: &[u8]) -> Self {
        Self::Stdin(BASE64.encode(data))
    }

    /// Decode stdin bytes from base64.
    #[must_use]
    pub fn decode_stdin(&self) -> Option<Vec<u8>> {
        if let Self::Stdin(data) = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetWorkspace {
    #[serde(default)]
    pub abs_root: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub env_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}
