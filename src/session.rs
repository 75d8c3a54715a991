use std::collections::HashMap;

use log::debug;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::ChatError;
use crate::framing::Frame;
use crate::messages::Packet;

pub type SessionId = Uuid;

/// Outbound frames a connection may have queued before further sends to it
/// are dropped.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Items queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Flush what is queued, then shut the stream down.
    Close,
}

/// Outbound handle to one connection.
///
/// Delivery is at-most-once: a send to a connection whose queue is full or
/// whose writer has gone away is dropped without error and never retried.
/// The queue is bounded, so a stalled reader costs at most a queue's worth
/// of frames.
#[derive(Clone, Debug)]
pub struct Peer {
    id: SessionId,
    tx: mpsc::Sender<Outbound>,
}

impl Peer {
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_capacity(depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let peer = Peer {
            id: Uuid::new_v4(),
            tx,
        };
        (peer, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send(&self, frame: Frame) {
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Dropping frame for {}, its queue is full", self.id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Dropping frame for closed connection {}", self.id);
            }
        }
    }

    pub fn send_line(&self, line: impl Into<String>) {
        self.send(Frame::Line(line.into()));
    }

    pub fn send_packet(&self, packet: Packet) {
        self.send(Frame::Packet(packet));
    }

    /// Asks the writer to flush and shut down. Returns `false` when the
    /// request could not be queued.
    pub fn close(&self) -> bool {
        self.tx.try_send(Outbound::Close).is_ok()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// A connection that completed the login handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub room: Option<String>,
    pub peer: Peer,
}

/// Every logged-in connection, keyed by connection id.
#[derive(Debug, Default)]
pub struct Directory {
    sessions: HashMap<SessionId, Session>,
}

impl Directory {
    /// Binds `name` to `peer`; names are unique among live sessions.
    pub fn bind(&mut self, peer: Peer, name: &str) -> Result<(), ChatError> {
        if self.is_taken(name) {
            return Err(ChatError::UsernameTaken);
        }
        self.sessions.insert(
            peer.id(),
            Session {
                name: name.to_string(),
                room: None,
                peer,
            },
        );
        Ok(())
    }

    /// Returns the previous name.
    pub fn rename(&mut self, id: SessionId, new_name: &str) -> Result<String, ChatError> {
        if self.is_taken(new_name) {
            return Err(ChatError::UsernameTaken);
        }
        let session = self.sessions.get_mut(&id).ok_or(ChatError::NotOnline)?;
        Ok(std::mem::replace(&mut session.name, new_name.to_string()))
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Result<&Session, ChatError> {
        self.sessions.get(&id).ok_or(ChatError::NotOnline)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Result<&mut Session, ChatError> {
        self.sessions.get_mut(&id).ok_or(ChatError::NotOnline)
    }

    /// The session and the name of the room it is in.
    pub fn in_room(&self, id: SessionId) -> Result<(&Session, &str), ChatError> {
        let session = self.get(id)?;
        let room = session.room.as_deref().ok_or(ChatError::NoRoom)?;
        Ok((session, room))
    }

    pub fn name_of(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(&id).map(|s| s.name.as_str())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Session> {
        self.sessions.values().find(|s| s.name == name)
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_renameable() {
        let mut directory = Directory::default();
        let (alice, _a) = Peer::channel();
        let (bob, _b) = Peer::channel();

        directory.bind(alice.clone(), "alice").unwrap();
        assert_eq!(directory.bind(bob.clone(), "alice"), Err(ChatError::UsernameTaken));
        directory.bind(bob.clone(), "bob").unwrap();

        assert_eq!(directory.rename(alice.id(), "bob"), Err(ChatError::UsernameTaken));
        assert_eq!(directory.rename(alice.id(), "carol").unwrap(), "alice");
        assert!(!directory.is_taken("alice"));
        assert_eq!(directory.name_of(alice.id()), Some("carol"));
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn in_room_requires_a_room() {
        let mut directory = Directory::default();
        let (peer, _rx) = Peer::channel();
        directory.bind(peer.clone(), "alice").unwrap();
        assert_eq!(directory.in_room(peer.id()).err(), Some(ChatError::NoRoom));

        directory.get_mut(peer.id()).unwrap().room = Some("r1".into());
        assert_eq!(directory.in_room(peer.id()).unwrap().1, "r1");
    }

    #[test]
    fn sends_to_a_closed_connection_are_swallowed() {
        let (peer, rx) = Peer::channel();
        drop(rx);
        peer.send_line("nobody is listening");
        assert!(!peer.close());
    }

    #[test]
    fn full_queue_drops_instead_of_growing() {
        let (peer, mut rx) = Peer::with_capacity(2);
        for n in 0..10 {
            peer.send_line(format!("line {n}"));
        }
        assert!(!peer.close());

        let mut queued = Vec::new();
        while let Ok(Outbound::Frame(Frame::Line(line))) = rx.try_recv() {
            queued.push(line);
        }
        assert_eq!(queued, vec!["line 0".to_string(), "line 1".to_string()]);

        peer.send_line("after drain");
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Frame(Frame::Line(ref l))) if l == "after drain"
        ));
    }
}
