//! Site descriptors: what a caller asks for and what gets written to disk.

use serde::{Deserialize, Serialize};

/// Port used when the caller gives none, or one outside `1..=65535`.
pub const DEFAULT_PORT: u16 = 80;

/// Checkbox values treated as "on".
const CHECKED_VALUES: [&str; 6] = ["true", "checked", "on", "yes", "y", "1"];

/// A validated backend mapping, ready to render.
///
/// `ext_host` stays empty until the allocator reserves a label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteDescriptor {
    pub ext_host: String,
    pub int_host: String,
    pub int_ip: String,
    pub int_port: u16,
    pub encrypted: bool,
    pub strip_headers: Vec<String>,
}

/// A backend mapping as submitted, before validation.
///
/// Field names match the JSON provisioning body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDescriptor {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, rename = "blockedHeaders")]
    pub blocked_headers: Vec<String>,
}

impl RawDescriptor {
    /// The requested port if it is a usable TCP port, else [`DEFAULT_PORT`].
    pub fn port_or_default(&self) -> u16 {
        self.port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|&p| p > 0)
            .unwrap_or(DEFAULT_PORT)
    }
}

/// Interpret an HTML checkbox value.
pub fn parse_checkbox(value: &str) -> bool {
    CHECKED_VALUES.contains(&value)
}
