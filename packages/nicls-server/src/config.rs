use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

/// Standard deviations of Gaussian envelope kept on each side of a Morlet wavelet
pub const WAVELET_SUPPORT_SIGMAS: f64 = 3.5;

/// Highest accepted amplifier sample rate in Hz
pub const MAX_SAMPLERATE: f64 = 100_000.0;

/// Longest accepted analysis window in seconds
pub const MAX_BUFFER_SECONDS: f64 = 60.0;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the task server binds to
    pub host: String,
    /// Port the task server listens on
    pub port: u16,
    /// Optional experiment configuration file (JSON)
    pub experiment_config: Option<PathBuf>,
    /// Append-only JSON-lines activity log
    pub data_log: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: env::var("NICLS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("NICLS_PORT")
                .unwrap_or_else(|_| "8889".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            experiment_config: env::var("NICLS_CONFIG").ok().map(PathBuf::from),
            data_log: env::var("NICLS_DATA_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("nicls-activity.jsonl")),
        })
    }

    /// Get the full bind address (addr:port)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load the base experiment configuration, falling back to defaults
    pub fn load_experiment(&self) -> Result<ExperimentConfig, ConfigError> {
        match &self.experiment_config {
            Some(path) => ExperimentConfig::load(path),
            None => Ok(ExperimentConfig::default()),
        }
    }
}

/// Byte order of samples inside one acquisition packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireLayout {
    /// All channels of sample 0, then all channels of sample 1, ...
    SampleMajor,
    /// All samples of channel 0, then all samples of channel 1, ...
    ChannelMajor,
}

/// Experiment configuration shared by the acquisition reader and the classifier.
///
/// The task sends a partial object with CONFIGURE; it is overlaid on the
/// server's base configuration with [`ExperimentConfig::with_overrides`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Acquisition device host
    pub biosemi_host: String,
    /// Acquisition device port
    pub biosemi_port: u16,
    /// Number of channels in each packet
    pub channels: usize,
    /// Samples per channel in each packet
    pub datarate: usize,
    /// Sample packing order on the wire
    pub wire_layout: WireLayout,
    /// Sampling rate in Hz
    pub samplerate: f64,
    /// Length of the analysis window in seconds
    pub buffer_seconds: f64,
    /// Classifications per second
    pub classifyfreq: f64,
    /// Size of the shared worker pool
    pub workers: usize,
    /// Lowest analyzed frequency (Hz)
    pub freq_low: f64,
    /// Highest analyzed frequency (Hz)
    pub freq_high: f64,
    /// Number of log-spaced analysis frequencies
    pub freq_count: usize,
    /// Morlet wavelet width in cycles
    pub wavelet_width: f64,
    /// Lower edge of the line-noise stop band (Hz)
    pub line_noise_low: f64,
    /// Upper edge of the line-noise stop band (Hz)
    pub line_noise_high: f64,
    /// High-pass cutoff for drift removal (Hz)
    pub highpass_cutoff: f64,
    /// Path to the serialized logistic model parameters
    pub model_path: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            biosemi_host: "127.0.0.1".to_string(),
            biosemi_port: 8888,
            channels: 128,
            datarate: 8,
            wire_layout: WireLayout::SampleMajor,
            samplerate: 2048.0,
            buffer_seconds: 2.0,
            classifyfreq: 1.0,
            workers: 1,
            freq_low: 6.0,
            freq_high: 180.0,
            freq_count: 8,
            wavelet_width: 5.0,
            line_noise_low: 58.0,
            line_noise_high: 62.0,
            highpass_cutoff: 0.5,
            model_path: None,
        }
    }
}

impl ExperimentConfig {
    /// Load a configuration file (JSON)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Overlay the keys of a CONFIGURE payload on this configuration
    pub fn with_overrides(&self, overrides: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut merged = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut merged {
            for (key, value) in overrides {
                fields.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Check that every parameter is usable by the reader and the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nyquist = self.samplerate / 2.0;

        if !(1..=256).contains(&self.channels) {
            return Err(ConfigError::InvalidValue(format!(
                "channels must be within 1..=256, got {}",
                self.channels
            )));
        }
        if !(1..=1024).contains(&self.datarate) {
            return Err(ConfigError::InvalidValue(format!(
                "datarate must be within 1..=1024, got {}",
                self.datarate
            )));
        }
        for (name, value) in [
            ("samplerate", self.samplerate),
            ("buffer_seconds", self.buffer_seconds),
            ("classifyfreq", self.classifyfreq),
            ("wavelet_width", self.wavelet_width),
            ("highpass_cutoff", self.highpass_cutoff),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.samplerate > MAX_SAMPLERATE {
            return Err(ConfigError::InvalidValue(format!(
                "samplerate must be at most {} Hz, got {}",
                MAX_SAMPLERATE, self.samplerate
            )));
        }
        if self.buffer_seconds > MAX_BUFFER_SECONDS {
            return Err(ConfigError::InvalidValue(format!(
                "buffer_seconds must be at most {}, got {}",
                MAX_BUFFER_SECONDS, self.buffer_seconds
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.freq_count == 0 {
            return Err(ConfigError::InvalidValue(
                "freq_count must be at least 1".to_string(),
            ));
        }
        if !(self.freq_low > 0.0 && self.freq_low <= self.freq_high && self.freq_high < nyquist) {
            return Err(ConfigError::InvalidValue(format!(
                "frequency range {}..{} Hz must lie inside (0, {}) Hz",
                self.freq_low, self.freq_high, nyquist
            )));
        }
        if !(self.line_noise_low > 0.0
            && self.line_noise_low < self.line_noise_high
            && self.line_noise_high < nyquist)
        {
            return Err(ConfigError::InvalidValue(format!(
                "line-noise band {}..{} Hz must be ordered and below {} Hz",
                self.line_noise_low, self.line_noise_high, nyquist
            )));
        }
        if self.highpass_cutoff >= nyquist {
            return Err(ConfigError::InvalidValue(format!(
                "highpass_cutoff ({} Hz) must be less than Nyquist ({} Hz)",
                self.highpass_cutoff, nyquist
            )));
        }

        let window = self
            .buffer_capacity()
            .checked_mul(self.datarate)
            .ok_or_else(|| ConfigError::InvalidValue("analysis window is too large".to_string()))?;
        let edge = self.edge_samples();
        let needed = edge
            .checked_mul(2)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| ConfigError::InvalidValue(format!("{} edge samples per side", edge)))?;
        if window < needed {
            return Err(ConfigError::InvalidValue(format!(
                "a {} sample window cannot absorb {} edge samples per side; \
                 raise buffer_seconds or freq_low",
                window, edge
            )));
        }

        if self.model_path.is_none() {
            return Err(ConfigError::MissingValue("model_path"));
        }

        Ok(())
    }

    /// Bytes in one acquisition packet (3 bytes per sample)
    pub fn packet_bytes(&self) -> usize {
        self.channels * self.datarate * 3
    }

    /// Ring buffer capacity in frames. Float to integer casts saturate, so
    /// out-of-range values stay finite until `validate` rejects them.
    pub fn buffer_capacity(&self) -> usize {
        ((self.buffer_seconds * self.samplerate / self.datarate as f64).ceil() as usize).max(1)
    }

    /// Samples per channel in a full analysis window
    pub fn window_samples(&self) -> usize {
        self.buffer_capacity().saturating_mul(self.datarate)
    }

    /// Frames between classification attempts once the buffer is full
    pub fn classify_interval(&self) -> usize {
        let frames = self.samplerate / self.datarate as f64 / self.classifyfreq / self.workers as f64;
        (frames.ceil() as usize).max(1)
    }

    /// Samples discarded at each end of the window after wavelet convolution
    pub fn edge_samples(&self) -> usize {
        let sigma_t = self.wavelet_width / (2.0 * PI * self.freq_low);
        (WAVELET_SUPPORT_SIGMAS * sigma_t * self.samplerate).ceil() as usize
    }

    /// Length of the classifier feature vector
    pub fn feature_count(&self) -> usize {
        self.freq_count * self.channels
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Missing required configuration value: {0}")]
    MissingValue(&'static str),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Worker pool already initialized")]
    PoolAlreadyInitialized,
    #[error("Connection already configured")]
    AlreadyConfigured,
}
