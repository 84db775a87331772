//! Session orchestration: named test scenarios and the summary log.
//!
//! A session runs scenarios against a [`FocusController`], one at a time.
//! Each scenario ends with one row appended to the summary CSV, whether it
//! passed, failed or errored.
//!
//! | Scenario | Steps |
//! |---|---|
//! | `full` | init, forward, reset, backward, reset |
//! | `forward` / `backward` | init, one travel move, reset |
//! | `reset` | stop and zero |
//! | `calibrate` | homing run |
//! | `stall-return` | stall-guard out-and-back repeatability check |
//! | `jog-in` / `jog-out` | one jog-sized move |

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{SessionConfig, StepperConfig};
use crate::error::{AppResult, TunnelError};
use crate::hardware::controller::FocusController;
use crate::protocol::Frame;

/// Direction of a jog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Positive steps
    In,
    /// Negative steps
    Out,
}

/// A named test scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Init, forward, reset, backward, reset
    Full,
    /// Init, forward, reset
    Forward,
    /// Init, backward, reset
    Backward,
    /// Stop and zero
    Reset,
    /// Homing run
    Calibrate,
    /// Stall-guard out-and-back test
    StallReturn,
    /// Single jog
    Jog(JogDirection),
}

impl Scenario {
    /// Name used on the command line and in the summary log.
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Full => "full",
            Scenario::Forward => "forward",
            Scenario::Backward => "backward",
            Scenario::Reset => "reset",
            Scenario::Calibrate => "calibrate",
            Scenario::StallReturn => "stall-return",
            Scenario::Jog(JogDirection::In) => "jog-in",
            Scenario::Jog(JogDirection::Out) => "jog-out",
        }
    }

    /// Every scenario, in menu order.
    pub fn all() -> [Scenario; 8] {
        [
            Scenario::Full,
            Scenario::Forward,
            Scenario::Backward,
            Scenario::Reset,
            Scenario::Calibrate,
            Scenario::StallReturn,
            Scenario::Jog(JogDirection::In),
            Scenario::Jog(JogDirection::Out),
        ]
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Scenario::all()
            .into_iter()
            .find(|scenario| scenario.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Scenario::all().iter().map(|s| s.name()).collect();
                format!("unknown scenario '{}'; expected one of: {}", s, names.join(", "))
            })
    }
}

/// How a scenario ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOutcome {
    /// Scenario that ran
    pub scenario: Scenario,
    /// Whether it passed
    pub success: bool,
    /// Wall-clock duration
    pub duration: Duration,
    /// Extra information (envelope, return error, failure cause)
    pub detail: Option<String>,
}

/// One row of the summary CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Local time the scenario finished, RFC 3339
    pub timestamp: String,
    /// Scenario name
    pub test: String,
    /// Pass/fail
    pub success: bool,
    /// Operator notes, `(none)` when empty
    pub notes: String,
    /// Duration in seconds, two decimals
    pub duration_s: f64,
}

impl SummaryRecord {
    /// Row for `outcome` stamped with the current local time.
    pub fn from_outcome(outcome: &ScenarioOutcome, notes: &str) -> Self {
        let notes = notes.trim();
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            test: outcome.scenario.name().to_string(),
            success: outcome.success,
            notes: if notes.is_empty() {
                "(none)".to_string()
            } else {
                notes.to_string()
            },
            duration_s: (outcome.duration.as_secs_f64() * 100.0).round() / 100.0,
        }
    }
}

/// Append-only CSV of scenario results.
#[derive(Debug, Clone)]
pub struct SummaryLog {
    path: PathBuf,
}

impl SummaryLog {
    /// Log at `path`; parent directories are created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header if the file is new or empty.
    pub fn append(&self, record: &SummaryRecord) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    /// Read every row back.
    pub fn read_all(&self) -> AppResult<Vec<SummaryRecord>> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row?);
        }
        Ok(records)
    }
}

/// Runs scenarios against one controller.
pub struct SessionRunner {
    controller: Arc<FocusController>,
    config: SessionConfig,
    init_frames: Vec<Frame>,
    reset_frames: Vec<Frame>,
    calibration_speed: Option<i32>,
    summary: Option<SummaryLog>,
}

impl SessionRunner {
    /// Runner using the session and protocol settings of `config`.
    ///
    /// The summary log is off until [`with_summary`](Self::with_summary).
    pub fn new(controller: Arc<FocusController>, config: &StepperConfig) -> AppResult<Self> {
        Ok(Self {
            controller,
            config: config.session.clone(),
            init_frames: config.protocol.init_frames()?,
            reset_frames: config.protocol.reset_frames()?,
            calibration_speed: None,
            summary: None,
        })
    }

    /// Append a row per scenario to `log`.
    pub fn with_summary(mut self, log: SummaryLog) -> Self {
        self.summary = Some(log);
        self
    }

    /// Override the calibration speed.
    pub fn with_calibration_speed(mut self, speed: Option<i32>) -> Self {
        self.calibration_speed = speed;
        self
    }

    /// Controller in use.
    pub fn controller(&self) -> &Arc<FocusController> {
        &self.controller
    }

    /// Run one scenario and record it.
    ///
    /// Device errors fail the scenario instead of propagating; only a summary
    /// write failure is returned as an error.
    pub async fn run(&self, scenario: Scenario, notes: &str) -> AppResult<ScenarioOutcome> {
        info!(%scenario, "Scenario started");
        let started = Instant::now();

        let (success, detail) = match self.execute(scenario).await {
            Ok(result) => result,
            Err(e) => {
                error!(%scenario, error = %e, "Scenario aborted");
                (false, Some(e.to_string()))
            }
        };

        let outcome = ScenarioOutcome {
            scenario,
            success,
            duration: started.elapsed(),
            detail,
        };
        info!(
            %scenario,
            success,
            duration_s = outcome.duration.as_secs_f64(),
            detail = outcome.detail.as_deref().unwrap_or(""),
            "Scenario complete"
        );

        if let Some(log) = &self.summary {
            log.append(&SummaryRecord::from_outcome(&outcome, notes))?;
        }
        Ok(outcome)
    }

    async fn execute(&self, scenario: Scenario) -> AppResult<(bool, Option<String>)> {
        let travel = self.config.travel_steps;
        match scenario {
            Scenario::Full => {
                self.init().await?;
                let forward = self.travel(travel).await?;
                self.reset().await?;
                info!("Returning");
                let backward = self.travel(-travel).await?;
                self.reset().await?;
                Ok((forward && backward, None))
            }
            Scenario::Forward | Scenario::Backward => {
                let steps = if scenario == Scenario::Forward {
                    travel
                } else {
                    -travel
                };
                self.init().await?;
                let moved = self.travel(steps).await?;
                self.reset().await?;
                Ok((moved, None))
            }
            Scenario::Reset => {
                self.reset().await?;
                Ok((true, None))
            }
            Scenario::Calibrate => match self.controller.calibrate(self.calibration_speed).await {
                Ok(envelope) => Ok((
                    true,
                    Some(format!("envelope [{}, {}]", envelope.min, envelope.max)),
                )),
                Err(e) => Ok((false, Some(e.to_string()))),
            },
            Scenario::StallReturn => self.stall_return().await,
            Scenario::Jog(direction) => {
                let steps = match direction {
                    JogDirection::In => self.config.jog_steps,
                    JogDirection::Out => -self.config.jog_steps,
                };
                Ok((self.travel_with_wait(steps, Duration::ZERO).await?, None))
            }
        }
    }

    async fn init(&self) -> AppResult<()> {
        info!(frames = self.init_frames.len(), "Initializing motor");
        self.controller.run_sequence(&self.init_frames).await?;
        Ok(())
    }

    async fn reset(&self) -> AppResult<()> {
        info!("Resetting motor");
        self.controller.run_sequence(&self.reset_frames).await?;
        Ok(())
    }

    async fn travel(&self, steps: i32) -> AppResult<bool> {
        self.travel_with_wait(steps, self.config.move_wait()).await
    }

    /// One interlocked move; a refusal fails the step without aborting.
    async fn travel_with_wait(&self, steps: i32, wait: Duration) -> AppResult<bool> {
        match self.controller.move_relative(steps).await {
            Ok(report) => info!(steps, travel = report.travel, calibrated = report.calibrated, "Moving"),
            Err(TunnelError::MotionBlocked(reason)) => {
                warn!(steps, %reason, "Movement aborted");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(wait).await;
        let position = self.controller.read_position().await;
        info!(?position, "Motor position");
        Ok(true)
    }

    async fn stall_return(&self) -> AppResult<(bool, Option<String>)> {
        let result = self.stall_return_legs().await;

        let normal = self.controller.motion_config();
        let registers = self.controller.registers();
        registers.write_speed(normal.normal_speed).await?;
        registers.write_acceleration(normal.normal_acceleration).await?;

        result
    }

    async fn stall_return_legs(&self) -> AppResult<(bool, Option<String>)> {
        let test = &self.config.stall_test;
        let registers = self.controller.registers();

        registers.enable_stall_guard().await?;
        registers.write_stall_threshold(test.stall_threshold).await?;
        registers.commit_stall_guard().await?;
        registers.write_speed(test.speed).await?;
        registers.write_acceleration(test.acceleration).await?;

        let Some(start) = self.controller.read_position().await else {
            return Ok((false, Some("start position unavailable".to_string())));
        };

        let seek = match self
            .controller
            .drive_to_stall(
                self.config.travel_steps,
                test.max_polls,
                Duration::from_millis(test.poll_interval_ms),
            )
            .await
        {
            Ok(seek) => seek,
            Err(TunnelError::MotionBlocked(reason)) => {
                return Ok((false, Some(format!("blocked: {}", reason))));
            }
            Err(e) => return Err(e),
        };

        let Some(stall_position) = self.controller.read_position().await else {
            return Ok((false, Some("stall position unavailable".to_string())));
        };
        let displacement = stall_position.saturating_sub(start);
        info!(
            polls = seek.polls,
            stalled = seek.stalled,
            displacement,
            "Outbound leg finished"
        );
        if displacement == 0 {
            return Ok((false, Some("no movement".to_string())));
        }

        if let Err(e) = self.controller.move_relative(-displacement).await {
            return match e {
                TunnelError::MotionBlocked(reason) => {
                    Ok((false, Some(format!("return blocked: {}", reason))))
                }
                other => Err(other),
            };
        }
        tokio::time::sleep(Duration::from_millis(test.return_wait_ms)).await;

        let Some(end) = self.controller.read_position().await else {
            return Ok((false, Some("final position unavailable".to_string())));
        };
        let error = (i64::from(end) - i64::from(start)).unsigned_abs();
        let passed = error <= u64::from(test.tolerance_steps);
        info!(start, end, error, passed, "Stall-return result");
        Ok((
            passed,
            Some(format!("moved {} out and back, error {} steps", displacement, error)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in Scenario::all() {
            assert_eq!(scenario.name().parse::<Scenario>(), Ok(scenario));
        }
        assert_eq!("STALL_RETURN".parse::<Scenario>(), Ok(Scenario::StallReturn));
        assert!("sideways".parse::<Scenario>().is_err());
    }

    #[test]
    fn test_record_defaults_empty_notes() {
        let outcome = ScenarioOutcome {
            scenario: Scenario::Reset,
            success: true,
            duration: Duration::from_millis(1234),
            detail: None,
        };
        let record = SummaryRecord::from_outcome(&outcome, "  ");
        assert_eq!(record.notes, "(none)");
        assert_eq!(record.test, "reset");
        assert!((record.duration_s - 1.23).abs() < 1e-9);
    }

    #[test]
    fn test_summary_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = SummaryLog::new(dir.path().join("logs").join("summary.csv"));
        let outcome = ScenarioOutcome {
            scenario: Scenario::Full,
            success: false,
            duration: Duration::from_secs(2),
            detail: None,
        };

        log.append(&SummaryRecord::from_outcome(&outcome, "first")).unwrap();
        log.append(&SummaryRecord::from_outcome(&outcome, "second, with comma")).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.matches("timestamp,test,success,notes,duration_s").count(), 1);

        let rows = log.read_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].notes, "second, with comma");
        assert!(!rows[0].success);
    }
}
