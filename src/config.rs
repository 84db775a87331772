//! Configuration using Figment
//!
//! Strongly-typed configuration for the controller and the session orchestrator.
//! Configuration is layered:
//! 1. Built-in defaults (the values used on the reference hardware)
//! 2. A TOML file (default `config/stepper_tunnel.toml`)
//! 3. Environment variables prefixed with `STEPPER_TUNNEL_`, nested keys
//!    separated by a double underscore
//!    (e.g. `STEPPER_TUNNEL_CALIBRATION__SPEED=150`)
//!
//! # Example
//! ```no_run
//! use stepper_tunnel::config::StepperConfig;
//!
//! let config = StepperConfig::load()?;
//! config.validate()?;
//! println!("Calibration speed: {}", config.calibration.speed);
//! # Ok::<(), stepper_tunnel::error::TunnelError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, TunnelError};
use crate::hardware::homing::ZeroReference;
use crate::hardware::motion::DirectionEncoding;
use crate::protocol::{registers, ChecksumMode, Frame, FrameSpec};
use crate::tracing_setup::OutputFormat;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/stepper_tunnel.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "STEPPER_TUNNEL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial tunnel settings
    pub tunnel: TunnelConfig,
    /// Wire protocol settings
    pub protocol: ProtocolConfig,
    /// Normal operating motion settings
    pub motion: MotionConfig,
    /// Homing/calibration settings
    pub calibration: CalibrationConfig,
    /// Safety interlock settings
    pub safety: SafetyConfig,
    /// Session orchestrator settings
    pub session: SessionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Stepper Tunnel".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Serial tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Transmit buffer size requested from the camera
    pub frame_size: u32,
    /// Settling delay between write and read, in milliseconds
    pub settle_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            frame_size: 128,
            settle_ms: 200,
        }
    }
}

impl TunnelConfig {
    /// Settling delay as a `Duration`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Wire protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Checksum formula for computed frames
    pub checksum: ChecksumMode,
    /// How a signed step delta becomes a move command
    pub direction: DirectionEncoding,
    /// Opcode used to read back the position
    pub position_read_opcode: u8,
    /// Opcode used to read the driver status (stall flag)
    pub stall_status_opcode: u8,
    /// Hand-authored stop frame
    pub stop_frame: String,
    /// Hand-authored zero-reference frame
    pub zero_frame: String,
    /// Frames sent by the session init step
    pub init_sequence: Vec<FrameSpec>,
    /// Frames sent by the session reset step
    pub reset_sequence: Vec<FrameSpec>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            checksum: ChecksumMode::default(),
            direction: DirectionEncoding::default(),
            position_read_opcode: registers::POSITION_READ,
            stall_status_opcode: registers::DRIVER_STATUS,
            stop_frame: registers::STOP_FRAME.to_string(),
            zero_frame: registers::ZERO_FRAME.to_string(),
            init_sequence: registers::INIT_SEQUENCE.iter().map(|&s| FrameSpec::from(s)).collect(),
            reset_sequence: registers::RESET_SEQUENCE.iter().map(|&s| FrameSpec::from(s)).collect(),
        }
    }
}

impl ProtocolConfig {
    /// Parsed stop frame.
    pub fn stop_frame(&self) -> AppResult<Frame> {
        Ok(Frame::from_hex(&self.stop_frame)?)
    }

    /// Parsed zero-reference frame.
    pub fn zero_frame(&self) -> AppResult<Frame> {
        Ok(Frame::from_hex(&self.zero_frame)?)
    }

    /// Parsed init sequence.
    pub fn init_frames(&self) -> AppResult<Vec<Frame>> {
        parse_sequence(&self.init_sequence, self.checksum)
    }

    /// Parsed reset sequence.
    pub fn reset_frames(&self) -> AppResult<Vec<Frame>> {
        parse_sequence(&self.reset_sequence, self.checksum)
    }
}

fn parse_sequence(specs: &[FrameSpec], checksum: ChecksumMode) -> AppResult<Vec<Frame>> {
    specs
        .iter()
        .map(|spec| spec.to_frame(checksum).map_err(TunnelError::from))
        .collect()
}

/// Normal (non-calibration) motion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Speed register value restored after calibration
    pub normal_speed: i32,
    /// Acceleration register value restored after calibration
    pub normal_acceleration: i32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            normal_speed: 1000,
            normal_acceleration: 50_000,
        }
    }
}

/// Homing/calibration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Reduced speed used while seeking the limits
    pub speed: i32,
    /// Reduced acceleration used while seeking the limits
    pub acceleration: i32,
    /// Stall detection threshold
    pub stall_threshold: u8,
    /// Interval between stall polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum stall polls per seek before giving up
    pub max_polls: u32,
    /// Step magnitude commanded toward each limit
    pub seek_steps: i32,
    /// Position reads attempted at each limit
    pub position_read_attempts: u32,
    /// Which limit becomes the zero reference
    pub zero_reference: ZeroReference,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            speed: 200,
            acceleration: 100,
            stall_threshold: 50,
            poll_interval_ms: 50,
            max_polls: 1200,
            seek_steps: 100_000,
            position_read_attempts: 3,
            zero_reference: ZeroReference::default(),
        }
    }
}

impl CalibrationConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Safety interlock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Camera digital-input feature names probed for the optical sensor
    pub sensor_candidates: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sensor_candidates: ["DigitalIOInput", "DigitalIO", "Line0", "GpioInput"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Session orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Steps commanded by the forward/backward scenarios
    pub travel_steps: i32,
    /// Wait after a scenario move before reading back, in milliseconds
    pub move_wait_ms: u64,
    /// Steps per jog
    pub jog_steps: i32,
    /// Summary CSV path
    pub summary_csv: PathBuf,
    /// Stall-guard out-and-back test settings
    pub stall_test: StallTestConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            travel_steps: 100_000,
            move_wait_ms: 1000,
            jog_steps: 200,
            summary_csv: PathBuf::from("logs/session_summary.csv"),
            stall_test: StallTestConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Move wait as a `Duration`.
    pub fn move_wait(&self) -> Duration {
        Duration::from_millis(self.move_wait_ms)
    }
}

/// Stall-guard out-and-back test configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallTestConfig {
    /// Test speed
    pub speed: i32,
    /// Test acceleration
    pub acceleration: i32,
    /// Stall threshold used by the test
    pub stall_threshold: u8,
    /// Maximum polls before the outbound leg stops
    pub max_polls: u32,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Wait after the return move in milliseconds
    pub return_wait_ms: u64,
    /// Maximum allowed return error in steps
    pub tolerance_steps: u32,
}

impl Default for StallTestConfig {
    fn default() -> Self {
        Self {
            speed: 50,
            acceleration: 50,
            stall_threshold: 150,
            max_polls: 200,
            poll_interval_ms: 100,
            return_wait_ms: 3000,
            tolerance_steps: 5,
        }
    }
}

impl StepperConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(StepperConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| TunnelError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(TunnelError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if (self.tunnel.frame_size as usize) < crate::protocol::FRAME_LEN {
            return invalid(format!(
                "tunnel.frame_size {} is smaller than one frame",
                self.tunnel.frame_size
            ));
        }

        if self.motion.normal_speed <= 0 || self.motion.normal_acceleration <= 0 {
            return invalid("motion speed and acceleration must be positive".to_string());
        }

        let cal = &self.calibration;
        if cal.speed <= 0 || cal.acceleration <= 0 {
            return invalid("calibration speed and acceleration must be positive".to_string());
        }
        if cal.max_polls == 0 {
            return invalid("calibration.max_polls must be at least 1".to_string());
        }
        if cal.position_read_attempts == 0 {
            return invalid("calibration.position_read_attempts must be at least 1".to_string());
        }
        if cal.seek_steps <= 0 {
            return invalid("calibration.seek_steps must be positive".to_string());
        }

        if self.safety.sensor_candidates.iter().any(|s| s.trim().is_empty()) {
            return invalid("safety.sensor_candidates contains an empty name".to_string());
        }

        if self.session.stall_test.max_polls == 0 {
            return invalid("session.stall_test.max_polls must be at least 1".to_string());
        }

        self.protocol.stop_frame()?;
        self.protocol.zero_frame()?;
        self.protocol.init_frames()?;
        self.protocol.reset_frames()?;

        Ok(())
    }
}
