//! Server configuration for lag compensation and command smoothing
//!
//! `ServerConfig` is built from command-line arguments in the server binary
//! and read by the game loop, the historical trace orchestrator and the
//! antiwarp drain. The antiwarp tuning values are operator constants and are
//! independent of the tick rate.
//!
//! A config can also be dumped to and loaded from a bincode file, the same
//! encoding the wire protocol uses.

use serde::{Deserialize, Serialize};
use shared::DEFAULT_SV_FPS;
use std::fs;
use std::path::Path;

/// Fallback spacing for synthetic history markers when the tick rate is unusable.
pub const FALLBACK_FRAME_MSEC: i32 = 50;

/// Tuning constants for the command backlog smoother
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AntiwarpTuning {
    /// Movement-time budget (ms of full-speed movement) consumable per tick
    pub max_delta: f32,
    /// Commands lagging the newest queued command by this much are dropped
    pub max_drop_threshold: i32,
    /// Drop threshold used for the rest of a drain once anything was dropped
    pub min_drop_threshold: i32,
    /// Divisor applied to every command cost
    pub decay: f32,
    /// Longest slice of a single command processed in one go (ms)
    pub max_command_msec: i32,
    /// Stopped players still moving faster than this are charged full speed
    pub speed_threshold: f32,
    /// Split remainders at or below this cost end the drain
    pub split_epsilon: f32,
    /// Freshly connected clients are not smoothed for this long (ms)
    pub warmup_msec: i32,
}

impl Default for AntiwarpTuning {
    fn default() -> Self {
        Self {
            max_delta: 75.0,
            max_drop_threshold: 800,
            min_drop_threshold: 600,
            decay: 1.02,
            max_command_msec: 50,
            speed_threshold: 90.0,
            split_epsilon: 0.1,
            warmup_msec: 5000,
        }
    }
}

/// Global toggles and tick settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Simulation ticks per second
    pub sv_fps: u32,
    pub max_clients: usize,
    /// Trace shots against historical positions
    pub antilag: bool,
    /// Smooth bursty command streams
    pub antiwarp: bool,
    /// Send each client its antiwarp delay after every drain
    pub antiwarp_debug: bool,
    /// Build head and legs boxes from skeleton tags when available
    pub real_head: bool,
    /// Round command times up to `pmove_msec`
    pub pmove_fixed: bool,
    pub pmove_msec: i32,
    pub antiwarp_tuning: AntiwarpTuning,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sv_fps: DEFAULT_SV_FPS,
            max_clients: 32,
            antilag: true,
            antiwarp: true,
            antiwarp_debug: false,
            real_head: true,
            pmove_fixed: false,
            pmove_msec: 8,
            antiwarp_tuning: AntiwarpTuning::default(),
        }
    }
}

impl ServerConfig {
    /// Milliseconds between simulation ticks
    pub fn frame_msec(&self) -> i32 {
        if self.sv_fps == 0 {
            FALLBACK_FRAME_MSEC
        } else {
            (1000 / self.sv_fps).max(1) as i32
        }
    }

    /// Fixed movement step, if command times should be snapped to one
    pub fn fixed_step(&self) -> Option<i32> {
        if self.pmove_fixed && self.pmove_msec > 0 {
            Some(self.pmove_msec)
        } else {
            None
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Writes this config to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(&data)?)
    }
}
