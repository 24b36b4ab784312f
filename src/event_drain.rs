//! Draining iterator over a component's queued events.

use std::collections::vec_deque::Drain;
use std::fmt;
use std::iter::FusedIterator;

/// Drains the events a component queued since the last call.
///
/// Returned by [`DeterministicStateKernel::events()`] and [`DeterministicFrameState::events()`].
/// Events come out oldest first. Dropping the drain before it is exhausted still discards the
/// rest of the queue.
///
/// ```
/// use fortress_lockstep::{DeterministicStateKernel, Frame, KernelEvent, PlayerId};
///
/// let mut kernel = DeterministicStateKernel::new();
/// kernel.record_remote_frame_hash(Frame::new(2), PlayerId::new(1), 7).unwrap();
/// kernel.record_local_frame_hash(Frame::new(2), 8).unwrap();
///
/// for event in kernel.events() {
///     match event {
///         KernelEvent::FrameHashMismatch { frame } => assert_eq!(frame, Frame::new(2)),
///         other => panic!("unexpected {other:?}"),
///     }
/// }
/// ```
///
/// [`DeterministicStateKernel::events()`]: crate::DeterministicStateKernel::events
/// [`DeterministicFrameState::events()`]: crate::DeterministicFrameState::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a, E>(Drain<'a, E>);

impl<'a, E> EventDrain<'a, E> {
    pub(crate) const fn from_drain(drain: Drain<'a, E>) -> Self {
        Self(drain)
    }
}

impl<E> Iterator for EventDrain<'_, E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<E> DoubleEndedIterator for EventDrain<'_, E> {
    fn next_back(&mut self) -> Option<E> {
        self.0.next_back()
    }
}

impl<E> ExactSizeIterator for EventDrain<'_, E> {}

impl<E> FusedIterator for EventDrain<'_, E> {}

impl<E> fmt::Debug for EventDrain<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
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
    use std::collections::VecDeque;

    #[test]
    fn drain_empties_the_queue_in_order() {
        let mut queue: VecDeque<u32> = (1..=3).collect();
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn dropping_early_discards_the_rest() {
        let mut queue: VecDeque<u32> = (1..=3).collect();
        let first = EventDrain::from_drain(queue.drain(..)).next();
        assert_eq!(first, Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn double_ended_and_exact_size() {
        let mut queue: VecDeque<u32> = (1..=3).collect();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 3);
        assert_eq!(drain.next_back(), Some(3));
        assert_eq!(drain.next(), Some(1));
        assert_eq!(drain.len(), 1);
        assert_eq!(drain.next(), Some(2));
        assert!(drain.next().is_none());
    }

    #[test]
    fn debug_shows_remaining() {
        let mut queue: VecDeque<u32> = (1..=2).collect();
        let drain = EventDrain::from_drain(queue.drain(..));
        assert!(format!("{drain:?}").contains("remaining: 2"));
    }
}
