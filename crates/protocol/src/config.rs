use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
}

/// Transport settings handed to the peer connection layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// Master switch for the browser streaming gateway.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower bound of the UDP port range (0 = OS-assigned).
    #[serde(default)]
    pub port_range_min: u16,
    /// Upper bound of the UDP port range (0 = OS-assigned).
    #[serde(default)]
    pub port_range_max: u16,
    /// STUN server URLs.
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// TURN server URL (e.g., "turn:turn.example.com:3478").
    pub turn_server: Option<String>,
    /// TURN username (long-term credential mechanism).
    pub turn_username: Option<String>,
    /// TURN credential/password.
    pub turn_password: Option<String>,
    /// Maximum number of players holding slots (1..=4).
    #[serde(default = "default_max_players")]
    pub max_players: u8,
}

/// Video stream parameters advertised to peers. The encoder itself is
/// owned by the host process; these only shape RTP emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Codec the encoder produces.
    #[serde(default)]
    pub codec: VideoCodec,
    /// RTP payload type for video.
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,
    /// Target bitrate in kbps (informational, surfaced in stats).
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Target framerate.
    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Av1,
}

/// Room admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Maximum spectators per room.
    #[serde(default = "default_max_spectators")]
    pub max_spectators: usize,
    /// Keyboard access granted to newly admitted guests.
    #[serde(default)]
    pub default_guest_keyboard: bool,
    /// Mouse access granted to newly admitted guests.
    #[serde(default)]
    pub default_guest_mouse: bool,
    /// Seconds a disconnected peer may reconnect before being closed.
    #[serde(default = "default_reconnect_window")]
    pub reconnect_window_secs: u64,
    /// Seconds allowed for ICE gathering before the peer is failed.
    #[serde(default = "default_ice_deadline")]
    pub ice_gathering_deadline_secs: u64,
    /// Seconds allowed for the DTLS handshake before the peer is failed.
    #[serde(default = "default_dtls_deadline")]
    pub dtls_deadline_secs: u64,
}

/// Per-peer outbound queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Video queue depth in packets.
    #[serde(default = "default_queue_depth")]
    pub video_queue_depth: usize,
    /// Audio queue depth in packets.
    #[serde(default = "default_queue_depth")]
    pub audio_queue_depth: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_range_min: 0,
            port_range_max: 0,
            stun_servers: default_stun_servers(),
            turn_server: None,
            turn_username: None,
            turn_password: None,
            max_players: default_max_players(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            payload_type: default_payload_type(),
            bitrate: default_bitrate(),
            framerate: default_framerate(),
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_spectators: default_max_spectators(),
            default_guest_keyboard: false,
            default_guest_mouse: false,
            reconnect_window_secs: default_reconnect_window(),
            ice_gathering_deadline_secs: default_ice_deadline(),
            dtls_deadline_secs: default_dtls_deadline(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            video_queue_depth: default_queue_depth(),
            audio_queue_depth: default_queue_depth(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration, returning all issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Port range ---
        match (self.webrtc.port_range_min, self.webrtc.port_range_max) {
            (0, 0) => {} // OS-assigned
            (0, _) | (_, 0) => {
                issues.push(
                    "ERROR: webrtc.port_range_min and webrtc.port_range_max must both be set \
                     or both be 0 (OS-assigned)."
                        .to_string(),
                );
            }
            (min, max) if min > max => {
                issues.push(format!(
                    "ERROR: webrtc.port_range_min ({min}) is greater than \
                     webrtc.port_range_max ({max})."
                ));
            }
            _ => {}
        }

        // --- Max players ---
        if !(1..=4).contains(&self.webrtc.max_players) {
            issues.push(format!(
                "ERROR: webrtc.max_players must be between 1 and 4, got {}.",
                self.webrtc.max_players
            ));
        }

        // --- STUN URLs ---
        for url in &self.webrtc.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302"
                ));
            }
        }

        // --- TURN URL ---
        if let Some(url) = &self.webrtc.turn_server {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478"
                ));
            }
            if self.webrtc.turn_username.is_none() || self.webrtc.turn_password.is_none() {
                issues.push(
                    "WARNING: turn_server is set without turn_username/turn_password. \
                     Most TURN deployments require long-term credentials."
                        .to_string(),
                );
            }
        }

        // --- Video ---
        if self.video.framerate == 0 || self.video.framerate > 240 {
            issues.push(format!(
                "ERROR: video.framerate must be between 1 and 240, got {}.",
                self.video.framerate
            ));
        }
        if !(96..=127).contains(&self.video.payload_type) {
            issues.push(format!(
                "ERROR: video.payload_type must be in the dynamic range 96..=127, got {}.",
                self.video.payload_type
            ));
        }

        // --- Fanout queues ---
        if self.fanout.video_queue_depth < 16 {
            issues.push(format!(
                "WARNING: fanout.video_queue_depth is {} — values under 16 drop packets \
                 even on brief scheduling hiccups. Default is 256.",
                self.fanout.video_queue_depth
            ));
        }

        // --- Timeouts ---
        if self.room.reconnect_window_secs == 0 {
            issues.push(
                "WARNING: room.reconnect_window_secs is 0 — any transport blip will \
                 immediately close the peer."
                    .to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_true() -> bool {
    true
}
fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_max_players() -> u8 {
    4
}
fn default_payload_type() -> u8 {
    96
}
fn default_bitrate() -> u32 {
    10000
}
fn default_framerate() -> u32 {
    60
}
fn default_max_spectators() -> usize {
    8
}
fn default_reconnect_window() -> u64 {
    30
}
fn default_ice_deadline() -> u64 {
    10
}
fn default_dtls_deadline() -> u64 {
    20
}
fn default_queue_depth() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: GatewayConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert!(config.webrtc.enabled);
        assert_eq!(config.webrtc.port_range_min, 0);
        assert_eq!(config.webrtc.port_range_max, 0);
        assert_eq!(config.webrtc.stun_servers.len(), 2);
        assert!(config.webrtc.turn_server.is_none());
        assert_eq!(config.webrtc.max_players, 4);

        assert_eq!(config.video.codec, VideoCodec::H264);
        assert_eq!(config.video.payload_type, 96);
        assert_eq!(config.video.bitrate, 10000);
        assert_eq!(config.video.framerate, 60);

        assert_eq!(config.room.max_spectators, 8);
        assert!(!config.room.default_guest_keyboard);
        assert!(!config.room.default_guest_mouse);
        assert_eq!(config.room.reconnect_window_secs, 30);
        assert_eq!(config.room.ice_gathering_deadline_secs, 10);
        assert_eq!(config.room.dtls_deadline_secs, 20);

        assert_eq!(config.fanout.video_queue_depth, 256);
        assert_eq!(config.fanout.audio_queue_depth, 256);
    }

    #[test]
    fn default_trait_matches_toml_path() {
        let from_toml: GatewayConfig = toml::from_str("").unwrap();
        let from_default = GatewayConfig::default();
        assert_eq!(from_default.webrtc.max_players, from_toml.webrtc.max_players);
        assert_eq!(from_default.webrtc.stun_servers, from_toml.webrtc.stun_servers);
        assert_eq!(from_default.video.payload_type, from_toml.video.payload_type);
        assert_eq!(
            from_default.room.reconnect_window_secs,
            from_toml.room.reconnect_window_secs
        );
        assert_eq!(
            from_default.fanout.video_queue_depth,
            from_toml.fanout.video_queue_depth
        );
    }

    #[test]
    fn partial_config_overrides() {
        let toml_str = r#"
[webrtc]
max_players = 2
port_range_min = 47998
port_range_max = 48010

[video]
codec = "av1"
framerate = 120
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.webrtc.max_players, 2);
        assert_eq!(config.webrtc.port_range_min, 47998);
        assert_eq!(config.webrtc.port_range_max, 48010);
        assert_eq!(config.video.codec, VideoCodec::Av1);
        assert_eq!(config.video.framerate, 120);
        // untouched sections keep defaults
        assert_eq!(config.video.payload_type, 96);
        assert_eq!(config.room.max_spectators, 8);
    }

    #[test]
    fn codec_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&VideoCodec::H264).unwrap(),
            "\"h264\""
        );
        assert_eq!(
            serde_json::to_string(&VideoCodec::Hevc).unwrap(),
            "\"hevc\""
        );
        assert_eq!(serde_json::to_string(&VideoCodec::Av1).unwrap(), "\"av1\"");
    }

    fn valid_config() -> GatewayConfig {
        toml::from_str("").unwrap()
    }

    fn validate_issues(config: &GatewayConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_inverted_port_range_is_error() {
        let mut config = valid_config();
        config.webrtc.port_range_min = 48010;
        config.webrtc.port_range_max = 47998;
        assert!(has_error(&validate_issues(&config), "port_range_min"));
    }

    #[test]
    fn validate_half_open_port_range_is_error() {
        let mut config = valid_config();
        config.webrtc.port_range_min = 47998;
        config.webrtc.port_range_max = 0;
        assert!(has_error(&validate_issues(&config), "port_range"));
    }

    #[test]
    fn validate_max_players_bounds() {
        let mut config = valid_config();
        config.webrtc.max_players = 0;
        assert!(has_error(&validate_issues(&config), "max_players"));
        config.webrtc.max_players = 5;
        assert!(has_error(&validate_issues(&config), "max_players"));
        config.webrtc.max_players = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_stun_url_prefix() {
        let mut config = valid_config();
        config.webrtc.stun_servers = vec!["http://stun.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_without_credentials_warns() {
        let mut config = valid_config();
        config.webrtc.turn_server = Some("turn:turn.example.com:3478".to_string());
        let issues = validate_issues(&config);
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("WARNING:") && i.contains("turn_username"))
        );
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_turn_bad_prefix_is_error() {
        let mut config = valid_config();
        config.webrtc.turn_server = Some("udp://turn.example.com".to_string());
        assert!(has_error(&validate_issues(&config), "TURN URL"));
    }

    #[test]
    fn validate_framerate_bounds() {
        let mut config = valid_config();
        config.video.framerate = 0;
        assert!(has_error(&validate_issues(&config), "framerate"));
        config.video.framerate = 241;
        assert!(has_error(&validate_issues(&config), "framerate"));
        config.video.framerate = 240;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_payload_type_outside_dynamic_range() {
        let mut config = valid_config();
        config.video.payload_type = 95;
        assert!(has_error(&validate_issues(&config), "payload_type"));
        config.video.payload_type = 127;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_tiny_queue_warns() {
        let mut config = valid_config();
        config.fanout.video_queue_depth = 8;
        let issues = validate_issues(&config);
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("WARNING:") && i.contains("video_queue_depth"))
        );
    }
}
