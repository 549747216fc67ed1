//! Configuration storage
//!
//! Persistent stream defaults live in a TOML file under the platform config
//! directory. Command-line flags override whatever the file provides.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device node
    pub device: String,
    /// Capture width in pixels
    pub width: u32,
    /// Capture height in pixels
    pub height: u32,
    /// Capture pixel format ("yuyv" or "yuv420")
    pub pixfmt: String,
    /// Target frame rate
    pub fps: u32,
    /// Encoder bitrate in kbit/s
    pub bitrate: u32,
    /// Group-of-pictures length in frames
    pub gop: u32,
    /// Maximum RTP payload size in bytes (must stay below the Ethernet MTU)
    pub max_pkt_len: usize,
    /// Pipeline stage mask (0 capture, 1 +convert, 3 +encode, 7 +pack, 15 +network)
    pub stage: u8,
    /// Transport protocol ("udp" or "tcp")
    pub proto: String,
    /// Destination IP address for the network stage
    pub addr: Option<String>,
    /// Destination port for the network stage
    pub port: Option<u16>,
    /// Fixed RTP SSRC; generated per run when unset
    pub ssrc: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            pixfmt: "yuyv".to_string(),
            fps: 15,
            bitrate: 1000,
            gop: 12,
            max_pkt_len: 1400,
            stage: 3,
            proto: "udp".to_string(),
            addr: None,
            port: None,
            ssrc: None,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "camstream", "camstream")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        Ok(())
    }
}
