use crate::error::{ChatError, Missing};
use crate::framing::Frame;
use crate::history::{snippet, Ledger, LedgerEntry, Pin};
use crate::session::{Peer, SessionId};

/// A named broadcast domain: its members, message ledger and pins.
///
/// Message ids and pin numbers are separate counters, both starting at 1 and
/// never reused for the life of the room.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: Vec<Peer>, // join order
    ledger: Ledger,
    next_message_id: u64,
    pins: Vec<Pin>,
    next_pin: u64,
}

impl Room {
    pub fn new(name: impl Into<String>, history_capacity: usize) -> Self {
        Room {
            name: name.into(),
            members: Vec::new(),
            ledger: Ledger::with_capacity(history_capacity),
            next_message_id: 1,
            pins: Vec::new(),
            next_pin: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Peer] {
        &self.members
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members.iter().any(|m| m.id() == id)
    }

    pub fn add_member(&mut self, peer: Peer) {
        if !self.contains(peer.id()) {
            self.members.push(peer);
        }
    }

    pub fn remove_member(&mut self, id: SessionId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id() != id);
        self.members.len() != before
    }

    pub fn take_members(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.members)
    }

    fn append(&mut self, author: &str, render: impl FnOnce(u64) -> String) -> (u64, String) {
        let id = self.next_message_id;
        self.next_message_id += 1;
        let line = render(id);
        self.ledger.push(LedgerEntry {
            id,
            author: author.to_string(),
            line: line.clone(),
        });
        (id, line)
    }

    pub fn post(&mut self, author: &str, text: &str) -> (u64, String) {
        self.append(author, |id| format!("[MSG #{id}] {author}: {text}"))
    }

    pub fn record_file(&mut self, author: &str, filename: &str, size: u64) -> (u64, String) {
        self.append(author, |id| {
            format!("[FILE #{id}] {author} sent {filename} ({size} B)")
        })
    }

    /// The reply quotes the original as it reads now; later recalls of the
    /// original leave that quote alone.
    pub fn reply(&mut self, author: &str, original: u64, text: &str) -> Result<(u64, String), ChatError> {
        let quoted = self
            .ledger
            .get(original)
            .ok_or(ChatError::NotFound(Missing::Message(original)))?;
        let original_author = quoted.author.clone();
        let quote = snippet(&quoted.line);
        Ok(self.append(author, |id| {
            format!(
                "[MSG #{id}] {author} reply {original_author} →#{original} «{original_author}: {quote}»: {text}"
            )
        }))
    }

    pub fn recall(&mut self, caller: &str, id: u64) -> Result<String, ChatError> {
        self.ledger.recall(id, caller)
    }

    pub fn pin(&mut self, message_id: u64) -> Result<u64, ChatError> {
        let line = self
            .ledger
            .get(message_id)
            .ok_or(ChatError::NotFound(Missing::Message(message_id)))?
            .line
            .clone();
        let number = self.next_pin;
        self.next_pin += 1;
        self.pins.push(Pin {
            number,
            message_id,
            line,
        });
        Ok(number)
    }

    pub fn unpin(&mut self, number: u64) -> Result<(), ChatError> {
        let before = self.pins.len();
        self.pins.retain(|p| p.number != number);
        if self.pins.len() == before {
            return Err(ChatError::NotFound(Missing::Pin(number)));
        }
        Ok(())
    }

    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    /// Lines a joining member receives: the whole ledger, then the pins.
    pub fn replay(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.ledger.iter().map(|e| e.line.clone()).collect();
        if !self.pins.is_empty() {
            lines.push("-- PINNED --".to_string());
            lines.extend(self.pins.iter().map(|p| format!("{}) {}", p.number, p.line)));
            lines.push("-------------".to_string());
        }
        lines
    }

    pub fn pin_listing(&self) -> Vec<String> {
        if self.pins.is_empty() {
            return vec!["No pinned items.".to_string()];
        }
        let mut lines = vec!["-- PINNED LIST --".to_string()];
        lines.extend(self.pins.iter().map(|p| format!("{}) {}", p.number, p.line)));
        lines.push("-----------------".to_string());
        lines
    }

    pub fn broadcast(&self, frame: &Frame) {
        self.broadcast_except(frame, None);
    }

    pub fn broadcast_except(&self, frame: &Frame, except: Option<SessionId>) {
        for member in &self.members {
            if Some(member.id()) != except {
                member.send(frame.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DEFAULT_CAPACITY;
    use crate::session::Outbound;

    #[test]
    fn ids_and_pin_numbers_count_independently() {
        let mut room = Room::new("r1", DEFAULT_CAPACITY);
        let (first, line) = room.post("alice", "hello");
        assert_eq!((first, line.as_str()), (1, "[MSG #1] alice: hello"));
        let (second, _) = room.record_file("alice", "a.bin", 10);
        assert_eq!(second, 2);

        assert_eq!(room.pin(2).unwrap(), 1);
        assert_eq!(room.pin(1).unwrap(), 2);
        let (third, _) = room.post("bob", "later");
        assert_eq!(third, 3);

        room.unpin(1).unwrap();
        assert_eq!(room.unpin(1), Err(ChatError::NotFound(Missing::Pin(1))));
        assert_eq!(room.pin(3).unwrap(), 3);
    }

    #[test]
    fn reply_snapshot_survives_recall_of_the_original() {
        let mut room = Room::new("r1", DEFAULT_CAPACITY);
        room.post("C1", "hello");
        let (id, reply) = room.reply("C2", 1, "hi").unwrap();
        assert_eq!(id, 2);
        assert_eq!(reply, "[MSG #2] C2 reply C1 →#1 «C1: hello»: hi");

        assert_eq!(room.recall("C1", 1).unwrap(), "[MSG #1] (recalled)");
        let lines = room.replay();
        assert_eq!(lines[0], "[MSG #1] (recalled)");
        assert!(lines[1].contains("«C1: hello»"));
    }

    #[test]
    fn evicted_ids_are_gone_for_every_operation() {
        let mut room = Room::new("r1", 2);
        room.post("alice", "one");
        room.post("alice", "two");
        room.post("alice", "three");

        let gone = ChatError::NotFound(Missing::Message(1));
        assert_eq!(room.recall("alice", 1), Err(gone.clone()));
        assert_eq!(room.pin(1), Err(gone.clone()));
        assert_eq!(room.reply("bob", 1, "?"), Err(gone));
        assert!(room.pin(2).is_ok());
    }

    #[test]
    fn pins_keep_the_line_from_pin_time() {
        let mut room = Room::new("r1", DEFAULT_CAPACITY);
        room.post("alice", "keep me");
        room.pin(1).unwrap();
        room.recall("alice", 1).unwrap();

        assert_eq!(room.pins()[0].line, "[MSG #1] alice: keep me");
        assert_eq!(
            room.replay(),
            vec![
                "[MSG #1] (recalled)".to_string(),
                "-- PINNED --".to_string(),
                "1) [MSG #1] alice: keep me".to_string(),
                "-------------".to_string(),
            ]
        );
        assert_eq!(room.pin_listing()[0], "-- PINNED LIST --");
    }

    #[test]
    fn broadcast_skips_the_excluded_member() {
        let mut room = Room::new("r1", DEFAULT_CAPACITY);
        let (alice, mut alice_rx) = Peer::channel();
        let (bob, mut bob_rx) = Peer::channel();
        room.add_member(alice.clone());
        room.add_member(bob.clone());
        room.add_member(bob.clone());
        assert_eq!(room.members().len(), 2);

        room.broadcast_except(&Frame::Line("hey".into()), Some(alice.id()));
        assert!(alice_rx.try_recv().is_err());
        assert!(matches!(
            bob_rx.try_recv(),
            Ok(Outbound::Frame(Frame::Line(ref l))) if l == "hey"
        ));

        assert!(room.remove_member(bob.id()));
        assert!(!room.remove_member(bob.id()));
    }
}
