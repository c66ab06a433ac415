//! Centralized configuration for the session engine.
//!
//! Tunable defaults live here as constants so they can be reviewed in one
//! place; [`EngineConfig`] carries the per-engine values and can be loaded
//! from TOML.

use crate::core::types::{CameraConstraints, FacingMode};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Data Channels ────────────────────────────────────────────────────────────

/// Label of the per-peer reliable control channel.
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Prefix of dedicated file-transfer channels (`file-<uuid>`).
pub const FILE_CHANNEL_PREFIX: &str = "file-";

/// Default file chunk size (16 KiB). Small enough for every SCTP
/// implementation's default receive window.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for a data channel's send buffer (bytes).
/// A chunk is queued only if `buffered + chunk <= DC_BUFFERED_AMOUNT_HIGH`.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// First backpressure poll interval; doubles up to [`BACKPRESSURE_POLL_MAX`].
pub const BACKPRESSURE_POLL_MIN: Duration = Duration::from_millis(5);

pub const BACKPRESSURE_POLL_MAX: Duration = Duration::from_millis(50);

/// Chunks prefetched from the source ahead of the send loop.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 16;

/// Explicit SCTP max message size advertised by the webrtc adapter (256 KiB).
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 256 * 1024;

// ── Media ────────────────────────────────────────────────────────────────────

pub const DEFAULT_CAMERA_WIDTH: u32 = 1280;
pub const DEFAULT_CAMERA_HEIGHT: u32 = 720;

/// Settle time between stopping one camera and opening the other on switch.
pub const CAMERA_SWITCH_DELAY: Duration = Duration::from_millis(300);

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Consecutive ICE restarts without reaching "connected" before the session
/// is considered dead.
pub const ICE_RESTART_LIMIT: u32 = 3;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ── Engine config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Per-engine settings. Every field has a default, so a TOML file only needs
/// to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub chunk_size: usize,
    pub high_water_mark: usize,
    pub camera_switch_delay_ms: u64,
    pub ice_restart_limit: u32,
    pub default_camera: CameraConstraints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![DEFAULT_STUN_SERVER.into()],
                username: String::new(),
                credential: String::new(),
            }],
            chunk_size: CHUNK_SIZE,
            high_water_mark: DC_BUFFERED_AMOUNT_HIGH,
            camera_switch_delay_ms: CAMERA_SWITCH_DELAY.as_millis() as u64,
            ice_restart_limit: ICE_RESTART_LIMIT,
            default_camera: CameraConstraints {
                width: DEFAULT_CAMERA_WIDTH,
                height: DEFAULT_CAMERA_HEIGHT,
                facing: FacingMode::User,
            },
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// A chunk must fit under the high water mark, or the sender would wait forever.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than zero"));
        }
        if self.chunk_size > self.high_water_mark {
            return Err(anyhow!(
                "chunk_size ({}) exceeds high_water_mark ({})",
                self.chunk_size,
                self.high_water_mark
            ));
        }
        Ok(())
    }

    pub fn camera_switch_delay(&self) -> Duration {
        Duration::from_millis(self.camera_switch_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.camera_switch_delay(), CAMERA_SWITCH_DELAY);
    }

    #[test]
    fn chunk_larger_than_high_water_is_rejected() {
        let config = EngineConfig {
            chunk_size: 2 * 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str("chunk_size = 10240\n").unwrap();
        assert_eq!(config.chunk_size, 10240);
        assert_eq!(config.high_water_mark, DC_BUFFERED_AMOUNT_HIGH);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn loads_from_file() {
        let dir = std::env::temp_dir().join("peermesh_test").join("config");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("engine.toml");
        std::fs::write(
            &path,
            "high_water_mark = 65536\nchunk_size = 4096\n\n[default_camera]\nwidth = 640\nheight = 480\nfacing = \"environment\"\n",
        )
        .unwrap();

        let config = EngineConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.high_water_mark, 65536);
        assert_eq!(config.default_camera.facing, FacingMode::Environment);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
