//! Engine configuration
//!
//! Settings come from three places, later ones overriding earlier ones:
//! compiled-in defaults, an optional TOML file, and `CALLTRACE_*`
//! environment variables. Invalid values are configuration errors and fail
//! loudly at setup.

use crate::classifier::HashStrategy;
use crate::error::{Result, TraceError};
use crate::ring_buffer::DEFAULT_RING_CAPACITY;
use crate::sink::{
    SinkConfig, DEFAULT_HOST, DEFAULT_MULTICAST_HOST, DEFAULT_PORT, DEFAULT_RECEIVE_BUFFER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Verbosity of the engine's own logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    #[default]
    None = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Verbose = 5,
    Debug = 6,
    Everything = 7,
    /// Debug logging plus every classification decision
    Blacklist = 8,
}

impl LogLevel {
    /// Filter to install for this level
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::None => LevelFilter::OFF,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Verbose | LogLevel::Debug | LogLevel::Blacklist => LevelFilter::DEBUG,
            LogLevel::Everything => LevelFilter::TRACE,
        }
    }

    pub fn logs_decisions(self) -> bool {
        self == LogLevel::Blacklist
    }
}

impl FromStr for LogLevel {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "None" => LogLevel::None,
            "Info" => LogLevel::Info,
            "Warning" => LogLevel::Warning,
            "Error" => LogLevel::Error,
            "Verbose" => LogLevel::Verbose,
            "Debug" => LogLevel::Debug,
            "Everything" => LogLevel::Everything,
            "Blacklist" => LogLevel::Blacklist,
            other => {
                return Err(TraceError::InvalidConfig {
                    key: "log_level".into(),
                    value: other.into(),
                })
            }
        })
    }
}

/// Deployment environment of the monitored application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Code may be reloaded; methods are cached by name
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn hash_strategy(self) -> HashStrategy {
        match self {
            Environment::Development => HashStrategy::Name,
            Environment::Production => HashStrategy::Identity,
        }
    }
}

impl FromStr for Environment {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            _ => Err(TraceError::InvalidConfig {
                key: "environment".into(),
                value: s.into(),
            }),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => f.write_str("development"),
            Environment::Production => f.write_str("production"),
        }
    }
}

/// Network transport selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkMode {
    #[default]
    Udp,
    Tcp,
}

impl FromStr for NetworkMode {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Udp" | "udp" => Ok(NetworkMode::Udp),
            "Tcp" | "tcp" => Ok(NetworkMode::Tcp),
            _ => Err(TraceError::InvalidConfig {
                key: "network_mode".into(),
                value: s.into(),
            }),
        }
    }
}

/// Collector endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub udp_host: String,
    pub udp_port: u16,
    pub tcp_host: String,
    pub tcp_port: u16,
    /// Send UDP to the collector's multicast group instead of `udp_host`
    pub use_multicast: bool,
    pub receive_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Udp,
            udp_host: DEFAULT_HOST.to_string(),
            udp_port: DEFAULT_PORT,
            tcp_host: DEFAULT_HOST.to_string(),
            tcp_port: DEFAULT_PORT,
            use_multicast: false,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Sink for the configured mode
    pub fn sink(&self) -> SinkConfig {
        match self.mode {
            NetworkMode::Udp => SinkConfig::Udp {
                host: if self.use_multicast {
                    DEFAULT_MULTICAST_HOST.to_string()
                } else {
                    self.udp_host.clone()
                },
                port: self.udp_port,
                receive_buffer_size: self.receive_buffer_size,
            },
            NetworkMode::Tcp => SinkConfig::Tcp {
                host: self.tcp_host.clone(),
                port: self.tcp_port,
                receive_buffer_size: self.receive_buffer_size,
            },
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_key: String,

    #[serde(default = "default_technology_type")]
    pub technology_type: String,

    #[serde(default = "default_process_type")]
    pub process_type: String,

    pub environment: Environment,

    pub log_level: LogLevel,

    /// Disable all emission
    pub noop: bool,

    /// Ring buffer capacity in bytes
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Timer interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Timer ticks between collector resyncs
    #[serde(default = "default_resync_ticks")]
    pub resync_ticks: u32,

    /// Dispatch idle interval in milliseconds
    #[serde(default = "default_dispatch_tick_ms")]
    pub dispatch_tick_ms: u64,

    /// Shutdown grace period in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Rules file applied at startup
    pub rules_file: Option<PathBuf>,

    pub network: NetworkConfig,
}

fn default_technology_type() -> String {
    "Ruby".to_string()
}

fn default_process_type() -> String {
    "Default".to_string()
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_resync_ticks() -> u32 {
    30
}

fn default_dispatch_tick_ms() -> u64 {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            technology_type: default_technology_type(),
            process_type: default_process_type(),
            environment: Environment::default(),
            log_level: LogLevel::default(),
            noop: false,
            ring_capacity: default_ring_capacity(),
            tick_ms: default_tick_ms(),
            resync_ticks: default_resync_ticks(),
            dispatch_tick_ms: default_dispatch_tick_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            rules_file: None,
            network: NetworkConfig::default(),
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| TraceError::InvalidConfig {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "True" | "TRUE" | "1")
}

impl EngineConfig {
    /// Create config from environment variables
    ///
    /// Looks for:
    /// - CALLTRACE_API_KEY
    /// - CALLTRACE_LOGLEVEL
    /// - CALLTRACE_ENV
    /// - CALLTRACE_NETWORK_MODE
    /// - CALLTRACE_UDP_HOST, CALLTRACE_UDP_PORT
    /// - CALLTRACE_TCP_HOST, CALLTRACE_TCP_PORT
    /// - CALLTRACE_USE_MULTICAST
    /// - CALLTRACE_RULES_FILE
    pub fn from_env() -> Result<Self> {
        Self::default().merge_lookup(|key| std::env::var(key).ok())
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `CALLTRACE_*` variables resolved through `lookup`
    pub fn merge_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CALLTRACE_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = lookup("CALLTRACE_LOGLEVEL") {
            self.log_level = v.parse()?;
        }
        if let Some(v) = lookup("CALLTRACE_ENV") {
            self.environment = v.parse()?;
        }
        if let Some(v) = lookup("CALLTRACE_NETWORK_MODE") {
            self.network.mode = v.parse()?;
        }
        if let Some(v) = lookup("CALLTRACE_UDP_HOST") {
            self.network.udp_host = v;
        }
        if let Some(v) = lookup("CALLTRACE_UDP_PORT") {
            self.network.udp_port = parse_number("CALLTRACE_UDP_PORT", &v)?;
        }
        if let Some(v) = lookup("CALLTRACE_TCP_HOST") {
            self.network.tcp_host = v;
        }
        if let Some(v) = lookup("CALLTRACE_TCP_PORT") {
            self.network.tcp_port = parse_number("CALLTRACE_TCP_PORT", &v)?;
        }
        if let Some(v) = lookup("CALLTRACE_USE_MULTICAST") {
            self.network.use_multicast = parse_bool(&v);
        }
        if let Some(v) = lookup("CALLTRACE_RULES_FILE") {
            self.rules_file = Some(PathBuf::from(v));
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(TraceError::ZeroCapacity);
        }
        for (key, value) in [
            ("tick_ms", self.tick_ms),
            ("dispatch_tick_ms", self.dispatch_tick_ms),
        ] {
            if value == 0 {
                return Err(TraceError::InvalidConfig {
                    key: key.into(),
                    value: "0".into(),
                });
            }
        }
        Ok(())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_process_type(mut self, process_type: impl Into<String>) -> Self {
        self.process_type = process_type.into();
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn with_noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    pub fn with_ring_capacity(mut self, bytes: usize) -> Self {
        self.ring_capacity = bytes;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis() as u64;
        self
    }

    pub fn with_resync_ticks(mut self, ticks: u32) -> Self {
        self.resync_ticks = ticks;
        self
    }

    pub fn with_dispatch_tick(mut self, tick: Duration) -> Self {
        self.dispatch_tick_ms = tick.as_millis() as u64;
        self
    }

    pub fn with_rules_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_file = Some(path.into());
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
