use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::control::DEFAULT_MAX_SYNTHESIS_WINDOW_SECS;
use crate::multiplexer::DEFAULT_SESSION_BUFFER;

const DEFAULT_CONFIG_FILE: &str = "/etc/gadgetd/config";
const DEFAULT_BYTECODE_PATH: &str = "/usr/lib/gadgetd/gadgetd.bpf.o";
const DEFAULT_SOCKET_PATH: &str = "/run/gadgetd/gadgetd.sock";
const DEFAULT_CHANNEL_CAPACITY: usize = 8192;
const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// Remote interface configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Upper bound a client may ask `synthesize_policy` to collect for.
    #[serde(default = "default_max_synthesis_window_secs")]
    pub max_synthesis_window_secs: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_synthesis_window_secs: default_max_synthesis_window_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MultiplexerSettings {
    /// Events buffered per session before the oldest is dropped.
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,
    /// Raw events in flight between the ring buffer reader and the drain loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            session_buffer: default_session_buffer(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    /// Consecutive failed attaches after which a session is flagged degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub node_name: Option<String>,
    #[serde(default = "default_bytecode_path")]
    pub bytecode_path: PathBuf,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub multiplexer: MultiplexerSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
    pub otel_exporter_otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: None,
            bytecode_path: default_bytecode_path(),
            control: ControlSettings::default(),
            multiplexer: MultiplexerSettings::default(),
            sessions: SessionSettings::default(),
            otel_exporter_otlp_endpoint: None,
        }
    }
}

impl Settings {
    /// Layered load: optional config file (`GADGETD_CONFIG`, any format the
    /// `config` crate detects by extension), then `GADGETD_*` environment
    /// variables with `__` between nested keys.
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = std::env::var("GADGETD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());

        let s = Config::builder()
            .add_source(File::with_name(&file).required(false))
            .add_source(
                Environment::with_prefix("GADGETD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        if settings.node_name.is_none() {
            // Downward API convention for DaemonSets.
            settings.node_name = std::env::var("NODE_NAME").ok().filter(|n| !n.is_empty());
        }
        Ok(settings)
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_max_synthesis_window_secs() -> u64 {
    DEFAULT_MAX_SYNTHESIS_WINDOW_SECS
}

fn default_bytecode_path() -> PathBuf {
    PathBuf::from(DEFAULT_BYTECODE_PATH)
}

fn default_session_buffer() -> usize {
    DEFAULT_SESSION_BUFFER
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_degraded_after() -> u32 {
    DEFAULT_DEGRADED_AFTER
}
