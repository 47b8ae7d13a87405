// Inbound message buffer shared between a reader thread and its consumers.
//
// Unbounded, arrival-ordered. Consumers remove entries by scanning for the
// first match (`take_first`), so each message is consumed exactly once and
// messages nobody asks for simply stay put. The server funnels every client
// into one mailbox; envelopes carry the sender so consumers can filter.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use boardlink_protocol::{ClientId, Envelope};

#[derive(Default)]
pub struct Mailbox {
    entries: Mutex<VecDeque<Envelope>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        crate::lock(&self.entries)
    }

    pub fn push(&self, envelope: Envelope) {
        self.lock().push_back(envelope);
    }

    /// Remove and return the oldest envelope satisfying `predicate`.
    pub fn take_first<F>(&self, mut predicate: F) -> Option<Envelope>
    where
        F: FnMut(&Envelope) -> bool,
    {
        let mut entries = self.lock();
        let index = entries.iter().position(&mut predicate)?;
        entries.remove(index)
    }

    /// True if some envelope satisfies `predicate`; nothing is removed.
    pub fn contains<F>(&self, predicate: F) -> bool
    where
        F: FnMut(&Envelope) -> bool,
    {
        self.lock().iter().any(predicate)
    }

    /// Drop every envelope from `sender`. Returns how many were dropped.
    pub fn discard_from(&self, sender: ClientId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.sender != Some(sender));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use boardlink_protocol::{Category, Message};

    use super::*;

    fn from(id: u32, message: Message) -> Envelope {
        Envelope::from_client(ClientId(id), message)
    }

    #[test]
    fn first_match_wins_in_arrival_order() {
        let mailbox = Mailbox::new();
        mailbox.push(from(10, Message::game_state("a")));
        mailbox.push(from(20, Message::game_move("m")));
        mailbox.push(from(20, Message::game_state("b")));

        let first = mailbox
            .take_first(|e| e.message.matches(Category::State, None))
            .unwrap();
        assert_eq!(first.message.first_payload(), Some("a"));
        let second = mailbox
            .take_first(|e| e.message.matches(Category::State, None))
            .unwrap();
        assert_eq!(second.message.first_payload(), Some("b"));
        assert!(
            mailbox
                .take_first(|e| e.message.matches(Category::State, None))
                .is_none()
        );
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn discard_from_only_touches_that_sender() {
        let mailbox = Mailbox::new();
        mailbox.push(from(10, Message::test()));
        mailbox.push(from(20, Message::test()));
        mailbox.push(from(10, Message::abort()));
        assert_eq!(mailbox.discard_from(ClientId(10)), 2);
        assert_eq!(mailbox.len(), 1);
        assert!(mailbox.contains(|e| e.sender == Some(ClientId(20))));
    }

    #[test]
    fn concurrent_consumers_take_each_message_once() {
        let mailbox = Arc::new(Mailbox::new());
        for i in 0..200 {
            mailbox.push(from(10, Message::game_move(i.to_string())));
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(e) = mailbox.take_first(|_| true) {
                        taken.push(e.message.first_payload().unwrap().to_string());
                    }
                    taken
                })
            })
            .collect();
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|s| s.parse().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<u32>>());
        assert!(mailbox.is_empty());
    }
}
