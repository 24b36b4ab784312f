//! Ordered, deduplicated queue of synchronized commands.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::frame_info::Command;
use crate::PlayerId;

/// `(command_type, player_id, sort_number, insertion sequence)`
type QueueKey = (u32, PlayerId, u32, u64);

/// A queue that is always observed in ascending `(command_type, player_id, sort_number)` order.
///
/// Commands with equal sort keys keep their insertion order. A command whose dedupe key was
/// seen before is dropped; dedupe keys are remembered for the lifetime of the queue, so a key
/// stays spent after its command was dequeued.
///
/// # Example
///
/// ```
/// use fortress_lockstep::__internal::CommandQueue;
/// use fortress_lockstep::{Command, PlayerId};
///
/// let mut queue = CommandQueue::new();
/// assert!(queue.enqueue(Command::new(7, PlayerId::new(1), 5, vec![]).with_dedupe_key("k")));
/// assert!(!queue.enqueue(Command::new(7, PlayerId::new(1), 5, vec![]).with_dedupe_key("k")));
/// queue.enqueue(Command::new(2, PlayerId::new(2), 10, vec![]));
///
/// let order: Vec<u32> = queue.iter().map(|c| c.command_type).collect();
/// assert_eq!(order, vec![2, 7]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    commands: BTreeMap<QueueKey, Command>,
    seen_keys: BTreeSet<String>,
    next_seq: u64,
}

impl CommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `command` in order. Returns `false` if its dedupe key was already seen.
    pub fn enqueue(&mut self, command: Command) -> bool {
        if let Some(key) = &command.dedupe_key {
            if !self.seen_keys.insert(key.clone()) {
                trace!("Dropping duplicate command with dedupe key {:?}", key);
                return false;
            }
        }
        let (command_type, player_id, sort_number) = command.sort_key();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.commands
            .insert((command_type, player_id, sort_number, seq), command);
        true
    }

    /// The first command in order.
    #[must_use]
    pub fn peek(&self) -> Option<&Command> {
        self.commands.values().next()
    }

    /// Every queued command, in order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Command> + ExactSizeIterator {
        self.commands.values()
    }

    /// Removes and returns the first command in order.
    pub fn dequeue(&mut self) -> Option<Command> {
        self.commands.pop_first().map(|(_, command)| command)
    }

    /// Removes and returns every command, in order.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands).into_values().collect()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True if no command is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// True if a command with `key` was ever accepted.
    #[must_use]
    pub fn contains_dedupe_key(&self, key: &str) -> bool {
        self.seen_keys.contains(key)
    }

    /// Drops queued commands. Spent dedupe keys stay spent.
    pub fn clear(&mut self) {
        self.commands.clear();
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

    fn cmd(command_type: u32, player: u8, sort_number: u32) -> Command {
        Command::new(command_type, PlayerId::new(player), sort_number, vec![])
    }

    fn keys(queue: &CommandQueue) -> Vec<(u32, u8, u32)> {
        queue
            .iter()
            .map(|c| (c.command_type, c.player_id.as_u8(), c.sort_number))
            .collect()
    }

    #[test]
    fn queue_is_sorted_and_deduplicated() {
        let mut queue = CommandQueue::new();
        queue.enqueue(cmd(4, 1, 40));
        queue.enqueue(cmd(2, 3, 10));
        queue.enqueue(cmd(2, 2, 99));
        queue.enqueue(cmd(2, 2, 10));
        assert!(queue.enqueue(cmd(7, 1, 5).with_dedupe_key("k")));
        assert!(!queue.enqueue(cmd(7, 1, 5).with_dedupe_key("k")));

        assert_eq!(
            keys(&queue),
            vec![(2, 2, 10), (2, 2, 99), (2, 3, 10), (4, 1, 40), (7, 1, 5)]
        );
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::new(1, PlayerId::new(0), 0, vec![1]));
        queue.enqueue(Command::new(1, PlayerId::new(0), 0, vec![2]));
        let payloads: Vec<u8> = queue.drain().into_iter().map(|c| c.payload[0]).collect();
        assert_eq!(payloads, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn dedupe_keys_outlive_their_commands() {
        let mut queue = CommandQueue::new();
        queue.enqueue(cmd(1, 0, 0).with_dedupe_key("a"));
        assert_eq!(queue.dequeue().unwrap().command_type, 1);
        assert!(queue.contains_dedupe_key("a"));
        assert!(!queue.enqueue(cmd(1, 0, 0).with_dedupe_key("a")));
        queue.clear();
        assert!(!queue.enqueue(cmd(1, 0, 0).with_dedupe_key("a")));
    }

    #[test]
    fn commands_without_keys_are_never_deduplicated() {
        let mut queue = CommandQueue::new();
        assert!(queue.enqueue(cmd(1, 0, 0)));
        assert!(queue.enqueue(cmd(1, 0, 0)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek(), Some(&cmd(1, 0, 0)));
    }
}
