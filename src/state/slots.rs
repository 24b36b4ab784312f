//! Translated slots: indices into "every slot except mine".
//!
//! Per-peer bookkeeping that never needs an entry for the local player is indexed by translated
//! slot. Slots below the local slot keep their index, slots above it move down by one, and the
//! local slot itself has no translated index.
//!
//! ```
//! use fortress_lockstep::{from_translated_slot, to_translated_slot, PlayerId};
//!
//! let local = PlayerId::new(2);
//! assert_eq!(to_translated_slot(PlayerId::new(1), local), Some(1));
//! assert_eq!(to_translated_slot(PlayerId::new(2), local), None);
//! assert_eq!(to_translated_slot(PlayerId::new(3), local), Some(2));
//! assert_eq!(from_translated_slot(2, local), Some(PlayerId::new(3)));
//! ```

use crate::PlayerId;

/// Maps an absolute slot to its index among all slots except `local`.
#[inline]
#[must_use]
pub fn to_translated_slot(slot: PlayerId, local: PlayerId) -> Option<u8> {
    use std::cmp::Ordering;

    match slot.cmp(&local) {
        Ordering::Less => Some(slot.as_u8()),
        Ordering::Equal => None,
        Ordering::Greater => Some(slot.as_u8() - 1),
    }
}

/// Inverse of [`to_translated_slot`]. `None` only if the slot would not fit in a byte.
#[inline]
#[must_use]
pub fn from_translated_slot(translated: u8, local: PlayerId) -> Option<PlayerId> {
    if translated < local.as_u8() {
        Some(PlayerId::new(translated))
    } else {
        translated.checked_add(1).map(PlayerId::new)
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
    use crate::MAX_SLOTS;

    #[test]
    fn mapping_round_trips_for_every_pair() {
        for local in 0..MAX_SLOTS as u8 {
            let local = PlayerId::new(local);
            let mut translated = Vec::new();
            for slot in 0..MAX_SLOTS as u8 {
                let slot = PlayerId::new(slot);
                match to_translated_slot(slot, local) {
                    Some(index) => {
                        assert_eq!(from_translated_slot(index, local), Some(slot));
                        translated.push(index);
                    },
                    None => assert_eq!(slot, local),
                }
            }
            // translated indices are dense
            assert_eq!(translated, (0..MAX_SLOTS as u8 - 1).collect::<Vec<_>>());
        }
    }

    #[test]
    fn first_and_last_local_slot() {
        assert_eq!(to_translated_slot(PlayerId::new(1), PlayerId::new(0)), Some(0));
        assert_eq!(to_translated_slot(PlayerId::new(6), PlayerId::new(7)), Some(6));
        assert_eq!(from_translated_slot(0, PlayerId::new(0)), Some(PlayerId::new(1)));
        assert_eq!(from_translated_slot(u8::MAX, PlayerId::new(0)), None);
    }
}
