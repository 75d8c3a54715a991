use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::session::{Peer, SessionId};

pub type TransferId = Uuid;

/// Bookkeeping for one in-flight file relay.
///
/// The recipient set is computed once when the transfer starts and never
/// re-filtered, so members who leave the room mid-transfer keep receiving.
/// File bytes are never stored here, only counted.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub origin: SessionId,
    /// Origin's identity when the transfer started.
    pub from: String,
    pub filename: String,
    pub size: u64,
    pub recipients: Arc<[Peer]>,
    pub relayed_bytes: u64,
    pub chunks: u64,
    started: u64,
}

#[derive(Debug, Default)]
pub struct TransferTable {
    active: HashMap<TransferId, Transfer>,
    started: u64,
}

impl TransferTable {
    /// Registers a new transfer under a fresh id. An earlier transfer of the
    /// same file from the same origin stays active alongside it.
    pub fn start(
        &mut self,
        origin: SessionId,
        from: &str,
        filename: &str,
        size: u64,
        recipients: Vec<Peer>,
    ) -> TransferId {
        let id = Uuid::new_v4();
        self.started += 1;
        self.active.insert(
            id,
            Transfer {
                id,
                origin,
                from: from.to_string(),
                filename: filename.to_string(),
                size,
                recipients: recipients.into(),
                relayed_bytes: 0,
                chunks: 0,
                started: self.started,
            },
        );
        id
    }

    /// Finds the transfer a chunk or end record belongs to.
    ///
    /// An explicit id must belong to `origin` and name the same file. Without
    /// one, the most recently started transfer of `filename` by `origin` wins.
    pub fn resolve(
        &self,
        origin: SessionId,
        filename: &str,
        id: Option<TransferId>,
    ) -> Option<TransferId> {
        match id {
            Some(id) => self
                .active
                .get(&id)
                .filter(|t| t.origin == origin && t.filename == filename)
                .map(|t| t.id),
            None => self
                .active
                .values()
                .filter(|t| t.origin == origin && t.filename == filename)
                .max_by_key(|t| t.started)
                .map(|t| t.id),
        }
    }

    /// Accounts for one relayed chunk and returns its transfer.
    pub fn record_chunk(
        &mut self,
        origin: SessionId,
        filename: &str,
        id: Option<TransferId>,
        bytes: u64,
    ) -> Option<&Transfer> {
        let id = self.resolve(origin, filename, id)?;
        let transfer = self.active.get_mut(&id)?;
        transfer.relayed_bytes += bytes;
        transfer.chunks += 1;
        Some(transfer)
    }

    pub fn finish(
        &mut self,
        origin: SessionId,
        filename: &str,
        id: Option<TransferId>,
    ) -> Option<Transfer> {
        let id = self.resolve(origin, filename, id)?;
        self.active.remove(&id)
    }

    /// Removes every transfer started by `origin`.
    pub fn drop_origin(&mut self, origin: SessionId) -> Vec<Transfer> {
        let ids: Vec<TransferId> = self
            .active
            .values()
            .filter(|t| t.origin == origin)
            .map(|t| t.id)
            .collect();
        ids.iter().filter_map(|id| self.active.remove(id)).collect()
    }
}

#[cfg(test)]
impl TransferTable {
    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.active.get(&id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
