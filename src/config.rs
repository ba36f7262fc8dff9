use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub serial: SerialConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// The controller board reboots when the port is opened.
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_reset_delay_ms() -> u64 {
    2000
}

fn default_stop_settle_ms() -> u64 {
    100
}

impl SerialConfig {
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn get_reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn get_stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: i32,
    /// GStreamer pipeline, takes precedence over `device_index` when set.
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default = "default_frame_width")]
    pub width: u32,
    #[serde(default = "default_frame_height")]
    pub height: u32,
}

fn default_frame_width() -> u32 {
    640
}

fn default_frame_height() -> u32 {
    480
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            pipeline: None,
            width: default_frame_width(),
            height: default_frame_height(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_topology_file")]
    pub topology_file: String,
    #[serde(default = "default_weights_file")]
    pub weights_file: String,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_mean")]
    pub mean: [f64; 3],
    #[serde(default)]
    pub swap_rb: bool,
    #[serde(default = "default_target_class")]
    pub target_class: i32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_topology_file() -> String {
    "deploy.prototxt".to_string()
}

fn default_weights_file() -> String {
    "MobileNetSSD_deploy.caffemodel".to_string()
}

fn default_input_size() -> u32 {
    300
}

fn default_scale_factor() -> f64 {
    0.007843
}

fn default_mean() -> [f64; 3] {
    [127.5, 127.5, 127.5]
}

fn default_target_class() -> i32 {
    15
}

fn default_confidence_threshold() -> f32 {
    0.30
}

impl ModelConfig {
    pub fn get_topology_path(&self) -> PathBuf {
        self.model_dir.join(&self.topology_file)
    }

    pub fn get_weights_path(&self) -> PathBuf {
        self.model_dir.join(&self.weights_file)
    }

    /// Checks the constants only; missing model files are reported when the detector loads.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "Confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err("Model input size must be non-zero".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct ControlConfig {
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_cycle_delay_ms() -> u64 {
    100
}

fn default_max_consecutive_failures() -> u32 {
    1
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle_delay_ms: default_cycle_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl ControlConfig {
    pub fn get_cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct DisplayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_window_name")]
    pub window_name: String,
    #[serde(default = "default_quit_key")]
    pub quit_key: char,
}

fn default_window_name() -> String {
    "Camera Feed".to_string()
}

fn default_quit_key() -> char {
    'q'
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_name: default_window_name(),
            quit_key: default_quit_key(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err("Camera resolution must be non-zero".to_string());
        }
        if self.serial.baud_rate == 0 {
            return Err("Serial baud rate must be non-zero".to_string());
        }
        if self.control.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use `trace`, `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No working directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("PF")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
