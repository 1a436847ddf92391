//! Auto-gain: bounded proportional steps on the R/G/B gain registers.
//!
//! The bridge accumulates frame luminance in hardware. A timer feeds that
//! sample to [`GainController::tick`], which moves every channel one
//! bounded step toward the target and returns the register writes as a
//! small program. The only state kept between ticks is the last gain
//! written.

use crate::program::{BringUpProgram, RegisterOp};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GainError {
    #[error("gain range is empty: min {min} > max {max}")]
    EmptyRange { min: u8, max: u8 },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("sharpness table is empty")]
    EmptySharpness,
}

fn default_deadband() -> u32 {
    4
}

fn default_divisor() -> u32 {
    8
}

/// Per-sensor gain loop parameters (`[gain]` in a sensor profile).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GainConfig {
    pub min: u8,
    pub max: u8,
    /// Largest change applied in one tick.
    pub step: u8,
    /// Luminance the loop steers toward.
    pub target: u32,
    #[serde(default = "default_deadband")]
    pub deadband: u32,
    /// Luminance error per unit of gain change.
    #[serde(default = "default_divisor")]
    pub divisor: u32,
    /// Gain registers, red, green, blue.
    pub registers: [u16; 3],
    pub initial: u8,
}

impl GainConfig {
    pub fn validate(&self) -> Result<(), GainError> {
        if self.min > self.max {
            return Err(GainError::EmptyRange {
                min: self.min,
                max: self.max,
            });
        }
        if self.step == 0 {
            return Err(GainError::Zero("step"));
        }
        if self.divisor == 0 {
            return Err(GainError::Zero("divisor"));
        }
        Ok(())
    }

    pub fn clamp(&self, gain: i32) -> u8 {
        gain.clamp(self.min as i32, self.max as i32) as u8
    }
}

/// Sharpness register value per gain level (`[sharpness]` in a profile).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SharpnessTable {
    pub register: u16,
    pub values: Vec<u8>,
}

impl SharpnessTable {
    /// Pick the entry for `gain`, spreading the table over `[min, max]`.
    pub fn lookup(&self, gain: u8, min: u8, max: u8) -> u8 {
        let span = (max - min) as usize + 1;
        let level = (gain.saturating_sub(min)) as usize;
        let idx = (level * self.values.len() / span).min(self.values.len() - 1);
        self.values[idx]
    }
}

pub struct GainController {
    config: GainConfig,
    sharpness: Option<SharpnessTable>,
    gains: [u8; 3],
    enabled: bool,
}

impl GainController {
    pub fn new(config: GainConfig, sharpness: Option<SharpnessTable>) -> Result<Self, GainError> {
        config.validate()?;
        if sharpness.as_ref().is_some_and(|s| s.values.is_empty()) {
            return Err(GainError::EmptySharpness);
        }
        let initial = config.clamp(config.initial as i32);
        Ok(Self {
            config,
            sharpness,
            gains: [initial; 3],
            enabled: true,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Current R/G/B gains.
    pub fn gains(&self) -> [u8; 3] {
        self.gains
    }

    pub fn config(&self) -> &GainConfig {
        &self.config
    }

    /// One control step. `None` means nothing needs writing.
    pub fn tick(&mut self, luminance: u32) -> Option<BringUpProgram> {
        if !self.enabled {
            return None;
        }

        let error = self.config.target as i64 - luminance as i64;
        if error.unsigned_abs() <= self.config.deadband as u64 {
            return None;
        }

        let step = self.config.step as i64;
        let mut delta = error / self.config.divisor as i64;
        if delta == 0 {
            delta = error.signum();
        }
        let delta = delta.clamp(-step, step) as i32;

        let next = self.gains.map(|g| self.config.clamp(g as i32 + delta));
        if next == self.gains {
            return None;
        }

        tracing::debug!(luminance, ?next, prev = ?self.gains, "adjusting gain");
        self.gains = next;
        Some(self.writes())
    }

    /// Register writes for the current gains.
    pub fn writes(&self) -> BringUpProgram {
        let mut ops: Vec<RegisterOp> = self
            .config
            .registers
            .iter()
            .zip(self.gains.iter())
            .map(|(&index, &value)| RegisterOp::DirectWrite { value, index })
            .collect();

        if let Some(table) = &self.sharpness {
            let value = table.lookup(self.gains[1], self.config.min, self.config.max);
            ops.push(RegisterOp::DirectWrite {
                value,
                index: table.register,
            });
        }
        BringUpProgram::new("gain", ops)
    }
}
