//! Monotonic object id allocation.

use tracing::trace;

use crate::{LockstepError, ObjectId, FIRST_OBJECT_ID, MAX_OBJECT_ID};

/// Hands out object ids from [`FIRST_OBJECT_ID`] upward. Ids are never reused within a session.
///
/// [`MAX_OBJECT_ID`] itself is never handed out; asking for it is
/// [`LockstepError::ObjectIdsExhausted`], and the allocator stays exhausted.
///
/// # Example
///
/// ```
/// use fortress_lockstep::__internal::ObjectIdAllocator;
/// use fortress_lockstep::FIRST_OBJECT_ID;
///
/// let mut ids = ObjectIdAllocator::new();
/// assert_eq!(ids.allocate().unwrap(), FIRST_OBJECT_ID);
/// assert!(ids.allocate().unwrap() > FIRST_OBJECT_ID);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdAllocator {
    next: u32,
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectIdAllocator {
    /// Creates an allocator whose first id is [`FIRST_OBJECT_ID`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: FIRST_OBJECT_ID.as_u32(),
        }
    }

    /// The id the next call to [`allocate`](Self::allocate) returns.
    #[must_use]
    pub const fn peek_next(&self) -> ObjectId {
        ObjectId::new(self.next)
    }

    /// Allocates the next id.
    pub fn allocate(&mut self) -> Result<ObjectId, LockstepError> {
        if self.next >= MAX_OBJECT_ID.as_u32() {
            return Err(LockstepError::ObjectIdsExhausted {
                next: ObjectId::new(self.next),
            });
        }
        let id = ObjectId::new(self.next);
        self.next += 1;
        trace!("Allocated object id {}", id);
        Ok(id)
    }

    /// Moves the counter forward, e.g. when restoring a saved match.
    ///
    /// Setting the current value again is a no-op. Moving backwards would hand out ids twice
    /// and is rejected, as are values outside `FIRST_OBJECT_ID..=MAX_OBJECT_ID`.
    pub fn set_next(&mut self, next: ObjectId) -> Result<(), LockstepError> {
        if next < FIRST_OBJECT_ID || next > MAX_OBJECT_ID {
            return Err(LockstepError::InvalidRequest {
                info: format!(
                    "next object id {} is outside {}..={}",
                    next, FIRST_OBJECT_ID, MAX_OBJECT_ID
                ),
            });
        }
        if next.as_u32() < self.next {
            return Err(LockstepError::InvalidRequest {
                info: format!(
                    "next object id {} would move the allocator back from {}",
                    next, self.next
                ),
            });
        }
        self.next = next.as_u32();
        Ok(())
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
    fn allocation_is_strictly_increasing() {
        let mut ids = ObjectIdAllocator::new();
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        let c = ids.allocate().unwrap();
        assert_eq!(a, FIRST_OBJECT_ID);
        assert!(a < b && b < c);
        assert_eq!(ids.peek_next(), ObjectId::new(4));
    }

    #[test]
    fn allocation_at_max_fails_and_stays_failed() {
        let mut ids = ObjectIdAllocator::new();
        ids.set_next(ObjectId::new(MAX_OBJECT_ID.as_u32() - 1)).unwrap();
        assert_eq!(ids.allocate().unwrap().as_u32(), MAX_OBJECT_ID.as_u32() - 1);
        assert_eq!(
            ids.allocate(),
            Err(LockstepError::ObjectIdsExhausted {
                next: MAX_OBJECT_ID
            })
        );
        assert!(ids.allocate().is_err());
    }

    #[test]
    fn set_next_never_regresses() {
        let mut ids = ObjectIdAllocator::new();
        ids.set_next(ObjectId::new(100)).unwrap();
        ids.set_next(ObjectId::new(100)).unwrap();
        assert!(ids.set_next(ObjectId::new(99)).is_err());
        assert!(ids.set_next(ObjectId::new(0)).is_err());
        assert_eq!(ids.allocate().unwrap(), ObjectId::new(100));
    }
}
