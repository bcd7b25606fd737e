// Runtime configuration: loop rate, input shaping, safety, robot link, recording, server
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Control loop frequency
pub const LOOP_HZ: f64 = 60.0;

// Stick shaping
pub const DEADZONE: f32 = 0.08;
pub const EXPO: f32 = 0.3;
pub const SLEW_RATE: f32 = 2.5; // stick units per second, full scale in 0.4s

// Mixing
pub const TURNING_SENSITIVITY: f32 = 0.7;
pub const SPEED_MULTIPLIER: f32 = 0.7;
pub const PURE_ROTATION_SPEED: u8 = 30;

// Watchdog: no stick sample for this long while connected forces an estop
pub const CMD_TIMEOUT_SEC: f64 = 2.0;

// toio discovery
pub const NAME_PREFIX: &str = "toio Core Cube";
pub const SCAN_TIMEOUT_SEC: f64 = 10.0;
pub const SCAN_RETRY: u32 = 3;
pub const COLLISION_THRESHOLD: u8 = 3; // 1-10, lower = more sensitive
pub const RECONNECT_DELAY_SEC: f64 = 1.0;

// Recording
pub const OUTPUT_DIR: &str = "./datasets";
pub const DATASET_NAME: &str = "toio_dataset";
pub const TASK: &str = "toio_teleoperation";

// Transport bridge
pub const BIND_PORT: u16 = 8765;
pub const PING_INTERVAL_SEC: f64 = 1.0;
pub const STATUS_EVERY_TICKS: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub control: ControlConfig,
    pub safety: SafetyConfig,
    pub robot: RobotConfig,
    pub recording: RecordingConfig,
    pub server: ServerConfig,
}

/// Stick shaping and mixing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub rate_hz: f64,
    pub deadzone: f32,
    pub expo: f32,
    pub slew_rate: f32,
    pub turning_sensitivity: f32,
    pub speed_multiplier: f32,
    /// Fixed wheel speed for in-place turns when only X is deflected. `None` mixes normally.
    pub pure_rotation_speed: Option<u8>,
    pub invert_x: bool,
    pub invert_y: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rate_hz: LOOP_HZ,
            deadzone: DEADZONE,
            expo: EXPO,
            slew_rate: SLEW_RATE,
            turning_sensitivity: TURNING_SENSITIVITY,
            speed_multiplier: SPEED_MULTIPLIER,
            pure_rotation_speed: Some(PURE_ROTATION_SPEED),
            invert_x: false,
            invert_y: false,
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Motor hold time sent with every command: three periods, at least 30ms.
    /// The cube stops on its own once commands stop arriving.
    pub fn motor_duration(&self) -> Duration {
        (self.period() * 3).max(Duration::from_millis(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    pub timeout_sec: f64,
    pub estop_on_controller_disconnect: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            timeout_sec: CMD_TIMEOUT_SEC,
            estop_on_controller_disconnect: true,
        }
    }
}

impl SafetyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RobotConfig {
    /// Connect to this address directly instead of matching by name
    pub address: Option<String>,
    pub name_prefix: String,
    pub scan_timeout_sec: f64,
    pub scan_retry: u32,
    pub collision_threshold: u8,
    pub motor_speed_feedback: bool,
    pub reconnect_delay_sec: f64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            address: None,
            name_prefix: NAME_PREFIX.to_string(),
            scan_timeout_sec: SCAN_TIMEOUT_SEC,
            scan_retry: SCAN_RETRY,
            collision_threshold: COLLISION_THRESHOLD,
            motor_speed_feedback: false,
            reconnect_delay_sec: RECONNECT_DELAY_SEC,
        }
    }
}

impl RobotConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_timeout_sec)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub dataset_name: String,
    pub task: String,
    /// Seed for the rotation direction picked when a collision happens with a centered stick
    pub seed: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from(OUTPUT_DIR),
            dataset_name: DATASET_NAME.to_string(),
            task: TASK.to_string(),
            seed: 0,
        }
    }
}

impl RecordingConfig {
    pub fn dataset_dir(&self) -> PathBuf {
        self.output_dir.join(&self.dataset_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub ping_interval_sec: f64,
    pub status_every_ticks: u32,
    /// Directory with the browser controller, served at `/`
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], BIND_PORT)),
            ping_interval_sec: PING_INTERVAL_SEC,
            status_every_ticks: STATUS_EVERY_TICKS,
            static_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval_sec)
    }
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.control;
        check(c.rate_hz.is_finite() && c.rate_hz > 0.0, "control.rate_hz", "must be > 0")?;
        check((0.0..1.0).contains(&c.deadzone), "control.deadzone", "must be in [0, 1)")?;
        check((0.0..=1.0).contains(&c.expo), "control.expo", "must be in [0, 1]")?;
        check(c.slew_rate > 0.0, "control.slew_rate", "must be > 0")?;
        check(
            c.turning_sensitivity >= 0.0,
            "control.turning_sensitivity",
            "must be >= 0",
        )?;
        check(
            c.speed_multiplier > 0.0 && c.speed_multiplier <= 1.0,
            "control.speed_multiplier",
            "must be in (0, 1]",
        )?;
        if let Some(speed) = c.pure_rotation_speed {
            check(
                (1..=100).contains(&speed),
                "control.pure_rotation_speed",
                "must be in 1..=100",
            )?;
        }

        check(self.safety.timeout_sec > 0.0, "safety.timeout_sec", "must be > 0")?;

        let r = &self.robot;
        check(r.scan_timeout_sec > 0.0, "robot.scan_timeout_sec", "must be > 0")?;
        check(r.scan_retry >= 1, "robot.scan_retry", "must be >= 1")?;
        check(
            (1..=10).contains(&r.collision_threshold),
            "robot.collision_threshold",
            "must be in 1..=10",
        )?;
        check(r.reconnect_delay_sec >= 0.0, "robot.reconnect_delay_sec", "must be >= 0")?;

        check(
            !self.recording.dataset_name.is_empty(),
            "recording.dataset_name",
            "must not be empty",
        )?;
        check(
            self.server.ping_interval_sec > 0.0,
            "server.ping_interval_sec",
            "must be > 0",
        )?;
        check(
            self.server.status_every_ticks >= 1,
            "server.status_every_ticks",
            "must be >= 1",
        )?;
        Ok(())
    }
}

fn check(ok: bool, field: &'static str, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        })
    }
}
