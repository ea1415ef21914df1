use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid value: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Fixed properties of the emulated instrument and its listening socket.
#[derive(Clone, Debug, PartialEq)]
pub struct DaqConfig {
    pub host: String,
    pub port: u16,
    /// Identifies the acquisition run; a real device hands out one per task.
    pub task_handle: u32,
    pub nchannels: u16,
    /// Samples per second, per channel.
    pub sample_rate: f32,
    /// Largest single read from a client socket.
    pub recv_buffer_size: usize,
    /// How long one data chunk may take to drain into the socket before the
    /// session is aborted for backpressure.
    pub send_timeout: Duration,
    /// `SO_SNDBUF` for accepted sockets; `None` keeps the OS default.
    pub send_buffer_size: Option<u32>,
    /// Prefix every streamed chunk with a `DATA_CHUNK` header.
    pub frame_chunks: bool,
    /// Upper bound on declared trigger and error string lengths.
    pub max_trigger_length: usize,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 12345,
            task_handle: 1,
            nchannels: 64,
            sample_rate: 10_000.0,
            recv_buffer_size: 4096,
            send_timeout: Duration::from_secs(1),
            send_buffer_size: None,
            frame_chunks: false,
            max_trigger_length: 1024,
        }
    }
}

impl DaqConfig {
    /// Defaults overridden by any `FAKEDAQ_*` variables set in the process
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup("FAKEDAQ_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "FAKEDAQ_PORT")? {
            config.port = port;
        }
        if let Some(nchannels) = parse::<u16, _>(&lookup, "FAKEDAQ_CHANNELS")? {
            if nchannels == 0 {
                return Err(invalid("FAKEDAQ_CHANNELS", "0", "must be positive"));
            }
            config.nchannels = nchannels;
        }
        if let Some(rate) = parse::<f32, _>(&lookup, "FAKEDAQ_SAMPLE_RATE")? {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(invalid(
                    "FAKEDAQ_SAMPLE_RATE",
                    &rate.to_string(),
                    "must be a positive number",
                ));
            }
            config.sample_rate = rate;
        }
        if let Some(ms) = parse(&lookup, "FAKEDAQ_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse(&lookup, "FAKEDAQ_SEND_BUFFER")? {
            config.send_buffer_size = Some(size);
        }
        if let Some(framed) = parse(&lookup, "FAKEDAQ_FRAME_CHUNKS")? {
            config.frame_chunks = framed;
        }
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
