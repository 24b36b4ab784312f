//! Configuration types for Fortress Lockstep.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `DisconnectConfig` | Stall, keepalive, player and packet-router timeouts | `lan()`, `internet()` |
//! | `ArchiveConfig` | Resend retention window | |
//! | `AssemblyConfig` | Limits for chunked command reassembly | |
//! | `CommandIdConfig` | Command id seed and outstanding-ack window | |
//! | `GameLoopConfig` | Fixed-timestep rate, elapsed cap and speed | |
//! | `LockstepConfig` | All of the above | `lan()`, `internet()` |
//!
//! # Forward Compatibility
//!
//! New fields may be added to these structs. Always construct them with the
//! `..Default::default()` pattern.
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::{DisconnectConfig, LockstepConfig};
//! use web_time::Duration;
//!
//! let config = LockstepConfig {
//!     disconnect: DisconnectConfig {
//!         stall_timeout: Duration::from_secs(3),
//!         ..DisconnectConfig::default()
//!     },
//!     ..LockstepConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::{LockstepError, FRAMES_TO_KEEP, MAX_SLOTS};

/// Timing for the disconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "DisconnectConfig has no effect unless passed to DeterministicFrameState"]
pub struct DisconnectConfig {
    /// Number of player slots in the match.
    ///
    /// Default: [`MAX_SLOTS`]
    pub num_slots: usize,

    /// How long the local peer may wait for a frame's commands before the stall
    /// indicator (the disconnect screen) turns on.
    ///
    /// Default: 5s
    pub stall_timeout: Duration,

    /// Interval between disconnect keepalives while the stall indicator is on.
    ///
    /// Default: 500ms
    pub keepalive_interval: Duration,

    /// How long a stalled peer may stay silent before it is considered timed out.
    ///
    /// Default: 60s
    pub player_timeout: Duration,

    /// How long to wait for the packet router before electing the next one.
    ///
    /// Default: 10s
    pub packet_router_timeout: Duration,
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        Self {
            num_slots: MAX_SLOTS,
            stall_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(500),
            player_timeout: Duration::from_secs(60),
            packet_router_timeout: Duration::from_secs(10),
        }
    }
}

impl DisconnectConfig {
    /// Creates a new `DisconnectConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for LAN play: stalls are noticed quickly.
    pub fn lan() -> Self {
        Self {
            stall_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(250),
            player_timeout: Duration::from_secs(20),
            packet_router_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Configuration preset for play over the internet with occasional hiccups.
    pub fn internet() -> Self {
        Self {
            stall_timeout: Duration::from_secs(8),
            keepalive_interval: Duration::from_millis(500),
            player_timeout: Duration::from_secs(90),
            packet_router_timeout: Duration::from_secs(15),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LockstepError> {
        if self.num_slots == 0 || self.num_slots > MAX_SLOTS {
            return Err(LockstepError::InvalidConfig {
                field: "num_slots",
                info: format!("must be in 1..={}, got {}", MAX_SLOTS, self.num_slots),
            });
        }
        if self.keepalive_interval.is_zero() {
            return Err(LockstepError::InvalidConfig {
                field: "keepalive_interval",
                info: "must be greater than zero".to_owned(),
            });
        }
        if self.player_timeout < self.stall_timeout {
            return Err(LockstepError::InvalidConfig {
                field: "player_timeout",
                info: format!(
                    "must not be shorter than stall_timeout ({:?} < {:?})",
                    self.player_timeout, self.stall_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Retention window of the resend archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// How many frames of commands are kept behind the current frame.
    ///
    /// Default: [`FRAMES_TO_KEEP`] (65)
    pub frames_to_keep: i32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            frames_to_keep: FRAMES_TO_KEEP,
        }
    }
}

impl ArchiveConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LockstepError> {
        if self.frames_to_keep <= 0 {
            return Err(LockstepError::InvalidConfig {
                field: "frames_to_keep",
                info: format!("must be positive, got {}", self.frames_to_keep),
            });
        }
        Ok(())
    }
}

/// Limits for wrapped-command reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyConfig {
    /// Largest total payload a wrapped command may announce.
    ///
    /// Default: 1 MiB
    pub max_total_length: u32,

    /// Most assemblies that may be in flight at once.
    ///
    /// Default: 64
    pub max_pending: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            max_total_length: 1024 * 1024,
            max_pending: 64,
        }
    }
}

impl AssemblyConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LockstepError> {
        if self.max_total_length == 0 {
            return Err(LockstepError::InvalidConfig {
                field: "max_total_length",
                info: "must be greater than zero".to_owned(),
            });
        }
        if self.max_pending == 0 {
            return Err(LockstepError::InvalidConfig {
                field: "max_pending",
                info: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }
}

/// Command id issuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandIdConfig {
    /// The id after which issuing starts. The first issued id is `seed + 1`.
    ///
    /// Default: 64000, so that wraparound is exercised early in every match.
    pub seed: u16,

    /// Maximum number of issued ids that may await an acknowledgement.
    ///
    /// Must stay below half the id space so wrapping comparison remains unambiguous.
    ///
    /// Default: 4096
    pub max_outstanding: usize,
}

impl Default for CommandIdConfig {
    fn default() -> Self {
        Self {
            seed: 64000,
            max_outstanding: 4096,
        }
    }
}

impl CommandIdConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LockstepError> {
        if self.max_outstanding == 0 || self.max_outstanding >= 32768 {
            return Err(LockstepError::InvalidConfig {
                field: "max_outstanding",
                info: format!("must be in 1..32768, got {}", self.max_outstanding),
            });
        }
        Ok(())
    }
}

/// Fixed-timestep scheduling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameLoopConfig {
    /// Simulation steps per second. One step lasts `1 / simulation_hz` seconds.
    ///
    /// Default: 30
    pub simulation_hz: u32,

    /// Largest elapsed time a single tick may account for. Protects against a
    /// spiral of death after the host was suspended.
    ///
    /// Default: 250ms
    pub max_elapsed: Duration,

    /// Multiplier applied to elapsed time (1.0 = real time).
    ///
    /// Default: 1.0
    pub speed: f64,
}

impl Default for GameLoopConfig {
    fn default() -> Self {
        Self {
            simulation_hz: 30,
            max_elapsed: Duration::from_millis(250),
            speed: 1.0,
        }
    }
}

impl GameLoopConfig {
    /// The duration of one simulation step.
    #[must_use]
    pub fn simulation_dt(&self) -> Duration {
        Duration::from_secs(1) / self.simulation_hz.max(1)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LockstepError> {
        if self.simulation_hz == 0 {
            return Err(LockstepError::InvalidConfig {
                field: "simulation_hz",
                info: "must be greater than zero".to_owned(),
            });
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(LockstepError::InvalidConfig {
                field: "speed",
                info: format!("must be a finite, non-negative factor, got {}", self.speed),
            });
        }
        Ok(())
    }
}

/// Every knob of the lockstep core in one place.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LockstepConfig {
    /// Disconnect state machine timing.
    pub disconnect: DisconnectConfig,
    /// Resend archive retention.
    pub archive: ArchiveConfig,
    /// Wrapped-command reassembly limits.
    pub assembly: AssemblyConfig,
    /// Command id issuing.
    pub command_ids: CommandIdConfig,
    /// Fixed-timestep scheduling.
    pub game_loop: GameLoopConfig,
}

impl LockstepConfig {
    /// Creates a new `LockstepConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for LAN play.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            disconnect: DisconnectConfig::lan(),
            ..Self::default()
        }
    }

    /// Preset for internet play.
    #[must_use]
    pub fn internet() -> Self {
        Self {
            disconnect: DisconnectConfig::internet(),
            ..Self::default()
        }
    }

    /// Validates every section, returning the first error.
    pub fn validate(&self) -> Result<(), LockstepError> {
        self.disconnect.validate()?;
        self.archive.validate()?;
        self.assembly.validate()?;
        self.command_ids.validate()?;
        self.game_loop.validate()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(LockstepConfig::default().validate().is_ok());
        assert!(LockstepConfig::lan().validate().is_ok());
        assert!(LockstepConfig::internet().validate().is_ok());
    }

    #[test]
    fn lan_notices_stalls_sooner_than_internet() {
        assert!(DisconnectConfig::lan().stall_timeout < DisconnectConfig::internet().stall_timeout);
    }

    #[test]
    fn rejects_slot_count_out_of_range() {
        let config = DisconnectConfig {
            num_slots: MAX_SLOTS + 1,
            ..DisconnectConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LockstepError::InvalidConfig {
                field: "num_slots",
                ..
            })
        ));
    }

    #[test]
    fn rejects_player_timeout_shorter_than_stall() {
        let config = DisconnectConfig {
            stall_timeout: Duration::from_secs(10),
            player_timeout: Duration::from_secs(5),
            ..DisconnectConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_ack_window_beyond_half_id_space() {
        let config = CommandIdConfig {
            max_outstanding: 40000,
            ..CommandIdConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn simulation_dt_follows_rate() {
        let config = GameLoopConfig {
            simulation_hz: 10,
            ..GameLoopConfig::default()
        };
        assert_eq!(config.simulation_dt(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_negative_speed() {
        let config = GameLoopConfig {
            speed: -1.0,
            ..GameLoopConfig::default()
        };
        assert!(config.validate().is_err());
        let lockstep = LockstepConfig {
            game_loop: config,
            ..LockstepConfig::default()
        };
        assert!(lockstep.validate().is_err());
    }
}
