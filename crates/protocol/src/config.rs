use serde::{Deserialize, Serialize};

/// Top-level configuration for the streaming core, loaded from TOML at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the signaling WebSocket listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port base. The signaling WebSocket listens on `port_base + 2`, matching
    /// the convention of reserving the base and base+1 for sibling HTTP/admin
    /// listeners that are out of scope for this core.
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    /// Serve the signaling WebSocket over TLS.
    #[serde(default)]
    pub signaling_ssl: bool,
    /// Path to TLS certificate (self-signed cert generated if absent and `signaling_ssl` is set).
    pub tls_cert: Option<String>,
    /// Path to TLS private key.
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn ws_port(&self) -> u16 {
        self.port_base + 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Inclusive UDP port range offered to the ICE agent for host candidates.
    #[serde(default = "default_ice_port_min")]
    pub ice_port_min: u16,
    #[serde(default = "default_ice_port_max")]
    pub ice_port_max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Maximum simultaneous player slots (1..=4).
    #[serde(default = "default_max_players")]
    pub max_players: u8,
    /// Guests default to no keyboard/mouse access until promoted or granted by the host.
    #[serde(default)]
    pub default_guest_keyboard: bool,
    #[serde(default)]
    pub default_guest_mouse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_bitrate")]
    pub default_bitrate_kbps: u32,
    #[serde(default = "default_framerate")]
    pub default_framerate: u32,
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port_base: default_port_base(),
            signaling_ssl: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            ice_port_min: default_ice_port_min(),
            ice_port_max: default_ice_port_max(),
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: default_max_players(),
            default_guest_keyboard: false,
            default_guest_mouse: false,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            default_bitrate_kbps: default_bitrate(),
            default_framerate: default_framerate(),
            default_width: default_width(),
            default_height: default_height(),
        }
    }
}

impl CoreConfig {
    /// Validate the configuration, returning `ERROR:`/`WARNING:`-prefixed issues.
    /// An `ERROR:` issue means the core should refuse to start.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                }
            }
            (Some(_), None) => issues.push(
                "WARNING: tls_cert is set but tls_key is not; both are required for custom TLS."
                    .to_string(),
            ),
            (None, Some(_)) => issues.push(
                "WARNING: tls_key is set but tls_cert is not; both are required for custom TLS."
                    .to_string(),
            ),
            (None, None) => {}
        }

        if self.server.port_base == 0 || self.server.port_base > u16::MAX - 2 {
            issues.push(format!(
                "ERROR: server.port_base must leave room for base+2, got {}.",
                self.server.port_base
            ));
        }

        if !(1..=4).contains(&self.room.max_players) {
            issues.push(format!(
                "ERROR: room.max_players must be between 1 and 4, got {}.",
                self.room.max_players
            ));
        }

        if self.ice.ice_port_min > self.ice.ice_port_max {
            issues.push(format!(
                "ERROR: ice.ice_port_min ({}) must be <= ice.ice_port_max ({}).",
                self.ice.ice_port_min, self.ice.ice_port_max
            ));
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'."
                ));
            }
        }

        if let Some(url) = &self.ice.turn_url
            && !url.starts_with("turn:")
            && !url.starts_with("turns:")
        {
            issues.push(format!(
                "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'."
            ));
        }

        if self.video.default_framerate == 0 || self.video.default_framerate > 240 {
            issues.push(format!(
                "ERROR: video.default_framerate must be between 1 and 240, got {}.",
                self.video.default_framerate
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port_base() -> u16 {
    47984
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_ice_port_min() -> u16 {
    50000
}
fn default_ice_port_max() -> u16 {
    60000
}
fn default_max_players() -> u8 {
    4
}
fn default_bitrate() -> u32 {
    20000
}
fn default_framerate() -> u32 {
    60
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
