//! Safety interlock: optical break-beam and travel envelope.
//!
//! Every relative move is checked here before a frame goes out. The sensor
//! check is live; the envelope check is pure and uses the position supplied
//! by the caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BlockReason;
use crate::hardware::capabilities::CameraFeatures;

/// Inclusive bounds on absolute position, in zero-referenced steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelEnvelope {
    /// Lowest allowed position
    pub min: i32,
    /// Highest allowed position
    pub max: i32,
}

impl TravelEnvelope {
    /// Envelope spanning `a` and `b` in either order.
    pub fn spanning(a: i32, b: i32) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Whether `target` lies within `[min, max]`.
    pub fn contains(&self, target: i64) -> bool {
        (i64::from(self.min)..=i64::from(self.max)).contains(&target)
    }

    /// Usable travel in steps.
    pub fn span(&self) -> i64 {
        i64::from(self.max) - i64::from(self.min)
    }
}

/// Refuses unsafe moves.
pub struct SafetyInterlock {
    camera: Arc<dyn CameraFeatures>,
    sensor: Option<String>,
}

impl SafetyInterlock {
    /// Bind the first readable sensor feature among `candidates`.
    ///
    /// With no readable candidate the sensor check is disabled.
    pub async fn discover(camera: Arc<dyn CameraFeatures>, candidates: &[String]) -> Self {
        for name in candidates {
            if let Some(state) = camera.read_digital_input(name).await {
                info!(sensor = %name, blocked = state, "Optical sensor found");
                return Self {
                    camera,
                    sensor: Some(name.clone()),
                };
            }
            debug!(sensor = %name, "Sensor feature not available");
        }
        info!("No optical sensor feature found; sensor interlock disabled");
        Self {
            camera,
            sensor: None,
        }
    }

    /// Name of the bound sensor feature.
    pub fn sensor_name(&self) -> Option<&str> {
        self.sensor.as_deref()
    }

    /// Live sensor state. A failed read counts as clear.
    pub async fn sensor_blocked(&self) -> bool {
        let Some(name) = self.sensor.as_deref() else {
            return false;
        };
        match self.camera.read_digital_input(name).await {
            Some(blocked) => blocked,
            None => {
                warn!(sensor = name, "Optical sensor read failed; treating as clear");
                false
            }
        }
    }

    /// Check the optical sensor.
    pub async fn check_sensor(&self) -> Result<(), BlockReason> {
        if self.sensor_blocked().await {
            warn!("Motion blocked by optical sensor");
            return Err(BlockReason::OpticalSensor);
        }
        Ok(())
    }

    /// Check a relative move of `delta` steps against `envelope`.
    ///
    /// Returns the absolute target when an envelope applies, `None` when the
    /// actuator is uncalibrated.
    pub fn check_envelope(
        envelope: Option<TravelEnvelope>,
        current: Option<i32>,
        delta: i64,
    ) -> Result<Option<i64>, BlockReason> {
        let Some(envelope) = envelope else {
            return Ok(None);
        };
        let current = current.ok_or(BlockReason::PositionUnknown)?;
        let target = i64::from(current).saturating_add(delta);
        if !envelope.contains(target) {
            return Err(BlockReason::OutsideEnvelope {
                target,
                min: envelope.min,
                max: envelope.max,
            });
        }
        Ok(Some(target))
    }
}
