use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, ObjectId, PlayerId};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), LockstepError>`].
///
/// Network conditions (lost packets, desyncs, stalled peers) are never reported through this
/// type. They surface as queryable state and events. A `LockstepError` always means the caller
/// asked for something that cannot be done locally.
///
/// [`Result<(), LockstepError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LockstepError {
    /// An invalid frame number was provided. Frames must be non-negative.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: &'static str,
    },
    /// A player id outside the slot range of the match was provided.
    InvalidPlayer {
        /// The player id that was invalid.
        player: PlayerId,
        /// The number of slots in the match.
        num_slots: usize,
    },
    /// The object id space is used up. This is unrecoverable for the running match.
    ObjectIdsExhausted {
        /// The id the allocator was asked to hand out.
        next: ObjectId,
    },
    /// A GameLogic CRC was requested with the module-factory section, but no writer for it was supplied.
    MissingSectionWriter {
        /// The marker of the section without a writer.
        section: &'static str,
    },
    /// Too many issued command ids are still waiting for an acknowledgement.
    CommandIdWindowFull {
        /// The number of outstanding ids.
        outstanding: usize,
    },
    /// A configuration value failed validation.
    InvalidConfig {
        /// The configuration field that was rejected.
        field: &'static str,
        /// Further specifies why the value was rejected.
        info: String,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
}

impl Display for LockstepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockstepError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            }
            LockstepError::InvalidPlayer { player, num_slots } => {
                write!(
                    f,
                    "Invalid player {}: the match only has {} slots",
                    player, num_slots
                )
            }
            LockstepError::ObjectIdsExhausted { next } => {
                write!(f, "Object id space exhausted at {}", next)
            }
            LockstepError::MissingSectionWriter { section } => {
                write!(
                    f,
                    "GameLogic CRC section {} was requested without a writer",
                    section
                )
            }
            LockstepError::CommandIdWindowFull { outstanding } => {
                write!(
                    f,
                    "Cannot issue a command id: {} ids are still awaiting acknowledgement",
                    outstanding
                )
            }
            LockstepError::InvalidConfig { field, info } => {
                write!(f, "Invalid configuration for {}: {}", field, info)
            }
            LockstepError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
        }
    }
}

impl Error for LockstepError {}

/// Returns an error unless `frame` is a valid (non-negative) frame.
pub(crate) fn ensure_valid_frame(frame: Frame) -> Result<(), LockstepError> {
    if frame.is_valid() {
        Ok(())
    } else {
        Err(LockstepError::InvalidFrame {
            frame,
            reason: "frame must be non-negative",
        })
    }
}

/// Returns an error unless `player` addresses one of `num_slots` slots.
pub(crate) fn ensure_valid_player(player: PlayerId, num_slots: usize) -> Result<(), LockstepError> {
    if player.as_usize() < num_slots {
        Ok(())
    } else {
        Err(LockstepError::InvalidPlayer { player, num_slots })
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
    fn display_mentions_offending_values() {
        let err = LockstepError::InvalidFrame {
            frame: Frame::new(-3),
            reason: "frame must be non-negative",
        };
        assert!(err.to_string().contains("-3"));

        let err = LockstepError::InvalidPlayer {
            player: PlayerId::new(9),
            num_slots: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains('8'));

        let err = LockstepError::MissingSectionWriter {
            section: "MARKER:TheModuleFactory",
        };
        assert!(err.to_string().contains("TheModuleFactory"));
    }

    #[test]
    fn frame_validation() {
        assert!(ensure_valid_frame(Frame::new(0)).is_ok());
        assert!(ensure_valid_frame(Frame::new(100)).is_ok());
        assert!(matches!(
            ensure_valid_frame(Frame::NULL),
            Err(LockstepError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn player_validation() {
        assert!(ensure_valid_player(PlayerId::new(0), 2).is_ok());
        assert!(ensure_valid_player(PlayerId::new(1), 2).is_ok());
        assert_eq!(
            ensure_valid_player(PlayerId::new(2), 2),
            Err(LockstepError::InvalidPlayer {
                player: PlayerId::new(2),
                num_slots: 2
            })
        );
    }
}
