use crate::error::{ChatError, Missing};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const SNIPPET_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: u64,
    pub author: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub number: u64,
    pub message_id: u64,
    /// The entry's rendered line as it was when pinned.
    pub line: String,
}

/// Fixed-capacity message ledger.
///
/// Backed by a `Vec` used as a ring: once full, each push overwrites the
/// slot at `head` (the oldest entry) and advances `head`.
#[derive(Debug, Clone)]
pub struct Ledger {
    slots: Vec<LedgerEntry>,
    head: usize,
    capacity: usize,
}

impl Ledger {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Ledger {
            slots: Vec::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            head: 0,
            capacity,
        }
    }

    /// Appends an entry, returning the one it evicted when full.
    pub fn push(&mut self, entry: LedgerEntry) -> Option<LedgerEntry> {
        if self.slots.len() < self.capacity {
            self.slots.push(entry);
            return None;
        }
        let evicted = std::mem::replace(&mut self.slots[self.head], entry);
        self.head = (self.head + 1) % self.capacity;
        Some(evicted)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.slots[self.head..].iter().chain(self.slots[..self.head].iter())
    }

    pub fn get(&self, id: u64) -> Option<&LedgerEntry> {
        self.slots.iter().find(|entry| entry.id == id)
    }

    /// Replaces the entry's line with a tombstone, keeping its id and author.
    pub fn recall(&mut self, id: u64, caller: &str) -> Result<String, ChatError> {
        let entry = self
            .slots
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(ChatError::NotFound(Missing::Message(id)))?;
        if entry.author != caller {
            return Err(ChatError::NotOwner);
        }
        entry.line = tombstone(id);
        Ok(entry.line.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub fn tombstone(id: u64) -> String {
    format!("[MSG #{id}] (recalled)")
}

/// The quotable text of a rendered line, cut to [`SNIPPET_CHARS`].
///
/// Reply lines quote everything after their `»: ` marker; other lines
/// everything after the first `: `.
pub fn snippet(line: &str) -> String {
    let text = match line.split_once("»: ") {
        Some((_, rest)) => rest,
        None => line.split_once(": ").map_or(line, |(_, rest)| rest),
    };
    if text.chars().count() > SNIPPET_CHARS {
        let cut: String = text.chars().take(SNIPPET_CHARS).collect();
        format!("{cut}…")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> LedgerEntry {
        LedgerEntry {
            id,
            author: "alice".into(),
            line: format!("[MSG #{id}] alice: m{id}"),
        }
    }

    #[test]
    fn evicts_exactly_the_oldest_when_full() {
        let mut ledger = Ledger::with_capacity(3);
        for id in 1..=3 {
            assert_eq!(ledger.push(entry(id)), None);
        }
        assert_eq!(ledger.push(entry(4)).map(|e| e.id), Some(1));
        assert_eq!(ledger.push(entry(5)).map(|e| e.id), Some(2));

        let ids: Vec<u64> = ledger.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(ledger.get(1).is_none());
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn default_capacity_holds_a_thousand() {
        let mut ledger = Ledger::with_capacity(DEFAULT_CAPACITY);
        for id in 1..=1001 {
            ledger.push(entry(id));
        }
        assert_eq!(ledger.len(), 1000);
        assert_eq!(ledger.iter().next().map(|e| e.id), Some(2));
        assert_eq!(
            ledger.recall(1, "alice"),
            Err(ChatError::NotFound(Missing::Message(1)))
        );
    }

    #[test]
    fn recall_keeps_id_and_author() {
        let mut ledger = Ledger::with_capacity(4);
        ledger.push(entry(1));
        ledger.push(entry(2));

        assert_eq!(ledger.recall(1, "mallory"), Err(ChatError::NotOwner));
        assert_eq!(ledger.get(1).unwrap().line, "[MSG #1] alice: m1");

        assert_eq!(ledger.recall(1, "alice").unwrap(), "[MSG #1] (recalled)");
        let recalled = ledger.get(1).unwrap();
        assert_eq!(recalled.id, 1);
        assert_eq!(recalled.author, "alice");
        assert_eq!(ledger.get(2).unwrap().line, "[MSG #2] alice: m2");
    }

    #[test]
    fn snippet_quotes_message_text() {
        assert_eq!(snippet("[MSG #1] alice: hello"), "hello");
        assert_eq!(
            snippet("[MSG #3] bob reply alice →#1 «alice: hello»: hi there"),
            "hi there"
        );
        assert_eq!(snippet("[MSG #4] (recalled)"), "[MSG #4] (recalled)");

        let long = format!("[MSG #5] alice: {}", "x".repeat(80));
        let cut = snippet(&long);
        assert_eq!(cut.chars().count(), SNIPPET_CHARS + 1);
        assert!(cut.ends_with('…'));
    }
}
