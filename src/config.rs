use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectOptions;
use crate::marker::MarkerOptions;
use crate::session::SessionConfig;
use crate::transport::{BufferCapacity, SyntheticConfig, SyntheticTransport, Transport, TransportKind};

/// Relay configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address (0.0.0.0 for LAN, 127.0.0.1 for localhost)
    pub bind_addr: String,
    /// Port to listen on
    pub port: u16,
    /// Signal bus backend
    pub transport: TransportKind,
    /// Inlet buffer in samples; the data loop runs every `buffer_size / rate`
    pub buffer_size: usize,
    /// Length of each forwarded window in seconds
    pub window_seconds: f64,
    pub retry_interval: Duration,
    pub marker_timeout: Duration,
    pub marker_poll: Duration,
    pub discovery_timeout: Duration,
    /// Outbound queue depth per session
    pub outbound_queue: usize,
    /// CORS allowed origins (comma-separated in env var, `*` for any)
    pub cors_origins: Vec<String>,
    pub synthetic: SyntheticConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8765,
            transport: TransportKind::default(),
            buffer_size: 20,
            window_seconds: 1.0,
            retry_interval: Duration::from_millis(2000),
            marker_timeout: Duration::from_millis(5000),
            marker_poll: Duration::from_millis(10),
            discovery_timeout: Duration::from_millis(1000),
            outbound_queue: 64,
            cors_origins: vec!["*".to_string()],
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("RELAY_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let transport = match lookup("RELAY_TRANSPORT") {
            Some(raw) => TransportKind::from_str(&raw).map_err(ConfigError::InvalidValue)?,
            None => defaults.transport,
        };

        let window_seconds: f64 = parse_or(&lookup, "RELAY_WINDOW_SECONDS", defaults.window_seconds)?;
        if !(window_seconds > 0.0) {
            return Err(ConfigError::InvalidValue(
                "RELAY_WINDOW_SECONDS must be positive".to_string(),
            ));
        }

        let synthetic_rate: f64 =
            parse_or(&lookup, "SYNTHETIC_RATE", defaults.synthetic.sampling_rate)?;
        if !(synthetic_rate > 0.0) {
            return Err(ConfigError::InvalidValue(
                "SYNTHETIC_RATE must be positive".to_string(),
            ));
        }

        // 0 disables the synthetic marker source
        let marker_period_ms: u64 = parse_or(&lookup, "SYNTHETIC_MARKER_PERIOD_MS", 2000)?;

        let synthetic = SyntheticConfig {
            channels: parse_or(&lookup, "SYNTHETIC_CHANNELS", defaults.synthetic.channels)?,
            sampling_rate: synthetic_rate,
            marker_period: (marker_period_ms > 0).then(|| Duration::from_millis(marker_period_ms)),
            ..defaults.synthetic
        };

        Ok(Self {
            bind_addr: lookup("RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port,
            transport,
            buffer_size: parse_or(&lookup, "RELAY_BUFFER_SIZE", defaults.buffer_size)?,
            window_seconds,
            retry_interval: millis_or(&lookup, "RELAY_RETRY_INTERVAL_MS", defaults.retry_interval)?,
            marker_timeout: millis_or(&lookup, "RELAY_MARKER_TIMEOUT_MS", defaults.marker_timeout)?,
            marker_poll: millis_or(&lookup, "RELAY_MARKER_POLL_MS", defaults.marker_poll)?,
            discovery_timeout: millis_or(
                &lookup,
                "RELAY_DISCOVERY_TIMEOUT_MS",
                defaults.discovery_timeout,
            )?,
            outbound_queue: parse_or(&lookup, "RELAY_OUTBOUND_QUEUE", defaults.outbound_queue)?,
            cors_origins: lookup("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            synthetic,
        })
    }

    /// Get the full bind address (addr:port)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Whether any origin may connect
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }

    /// Per-session tunables derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect: ConnectOptions {
                buffer: BufferCapacity::Samples(self.buffer_size.max(1)),
                retry_interval: self.retry_interval,
                ..ConnectOptions::default()
            },
            marker: MarkerOptions {
                resolve_timeout: self.marker_timeout,
                poll_interval: self.marker_poll,
                ..MarkerOptions::default()
            },
            window_seconds: self.window_seconds,
            discovery_timeout: self.discovery_timeout,
            outbound_queue: self.outbound_queue,
        }
    }

    /// Instantiate the configured transport backend
    pub fn build_transport(&self) -> Result<Arc<dyn Transport>, ConfigError> {
        match self.transport {
            TransportKind::Synthetic => Ok(Arc::new(SyntheticTransport::new(self.synthetic.clone()))),
            #[cfg(feature = "lsl-support")]
            TransportKind::Lsl => Ok(Arc::new(crate::transport::LslTransport::new())),
            #[cfg(not(feature = "lsl-support"))]
            TransportKind::Lsl => Err(ConfigError::InvalidValue(
                "the lsl transport needs a build with the `lsl-support` feature".to_string(),
            )),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, raw))),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
