use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Local;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::commands::COMMAND_MARKER;
use crate::config::Config;
use crate::error::{validate_name, ChatError, Missing};
use crate::framing::{Frame, Record, RecordCodec};
use crate::messages::{
    FileAck, FileChunk, FileEnd, FileStart, FriendRequest, Invite, Packet, PrivateMessage,
    INBOUND_KINDS,
};
use crate::room::Room;
use crate::session::{Directory, Outbound, Peer, Session, SessionId};
use crate::social::SocialGraph;
use crate::transfer::{TransferId, TransferTable};

// Lock order: sessions, rooms, a single room, social, transfers.
type Sessions = Arc<RwLock<Directory>>;
type Rooms = Arc<RwLock<BTreeMap<String, Arc<Mutex<Room>>>>>;

pub const LOGIN_PROMPT: &str = "Enter username:";
pub const FAREWELL: &str = "Bye!";

/// Whether the read loop keeps going after a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Prefixes a notice with the local wall-clock time.
pub fn stamped(text: impl Display) -> String {
    format!("{} {}", Local::now().format("[%H:%M:%S]"), text)
}

/// Sends `packet` to every recipient; failed deliveries are skipped.
fn fan_out(recipients: &[Peer], packet: &Packet) {
    for peer in recipients {
        peer.send_packet(packet.clone());
    }
}

fn notify_friends(sessions: &Directory, social: &SocialGraph, name: &str, online: bool) {
    let state = if online { "online" } else { "offline" };
    for session in sessions.iter() {
        if session.name != name && social.are_friends(&session.name, name) {
            session
                .peer
                .send_line(format!("[Friend] {name} is now {state}"));
        }
    }
}

/// Lets the writer flush what is queued, or stops it outright when even the
/// close request does not fit in its queue.
async fn finish_writer(peer: &Peer, writer: JoinHandle<()>) {
    if peer.close() {
        let _ = writer.await;
    } else {
        debug!("Outbound queue of {} is full, abandoning it", peer.id());
        writer.abort();
    }
}

/// Shared state of the relay plus the per-connection supervisor.
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    sessions: Sessions,
    rooms: Rooms,
    social: Arc<Mutex<SocialGraph>>,
    transfers: Arc<Mutex<TransferTable>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let rooms = config
            .rooms
            .iter()
            .map(|name| {
                let room = Room::new(name.clone(), config.history_capacity);
                (name.clone(), Arc::new(Mutex::new(room)))
            })
            .collect();

        Server {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(Directory::default())),
            rooms: Arc::new(RwLock::new(rooms)),
            social: Arc::new(Mutex::new(SocialGraph::default())),
            transfers: Arc::new(Mutex::new(TransferTable::default())),
        }
    }

    fn codec(&self) -> RecordCodec {
        RecordCodec::new(self.config.framing_mode(), self.config.max_line_bytes)
    }

    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub async fn handle_connection<S>(&self, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut records = FramedRead::new(reader, self.codec());
        let mut sink = FramedWrite::new(writer, self.codec());
        let (peer, mut rx) = Peer::with_capacity(self.config.outbound_queue);

        let writer_task = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let Outbound::Frame(frame) = outbound else {
                    break;
                };
                if let Err(e) = sink.send(frame).await {
                    warn!("Failed to write to {addr}: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let Some(name) = self.login(&peer, &mut records, addr).await else {
            debug!("{addr} went away before logging in");
            finish_writer(&peer, writer_task).await;
            return;
        };
        info!("{addr} logged in as {name}");

        while let Some(result) = records.next().await {
            match result {
                Ok(record) => {
                    if self.handle_record(&peer, record).await == Flow::Quit {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Read error from {addr}: {e}");
                    break;
                }
            }
        }

        self.handle_disconnect(peer.id()).await;
        finish_writer(&peer, writer_task).await;
        info!("Connection {addr} closed");
    }

    /// Prompts until the client supplies a free name.
    async fn login<R>(
        &self,
        peer: &Peer,
        records: &mut FramedRead<R, RecordCodec>,
        addr: SocketAddr,
    ) -> Option<String>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            peer.send_line(LOGIN_PROMPT);
            let record = match records.next().await? {
                Ok(record) => record,
                Err(e) => {
                    warn!("Read error from {addr} during login: {e}");
                    return None;
                }
            };
            let Record::Plain(requested) = record else {
                peer.send_line("Send a username before anything else.");
                continue;
            };
            let requested = requested.trim();
            let name = if requested.is_empty() {
                format!("Anon{}", addr.port())
            } else {
                requested.to_string()
            };
            match self.bind_identity(peer, &name).await {
                Ok(()) => {
                    peer.send_line(stamped(format!("Hello {name}! Type /help")));
                    return Some(name);
                }
                Err(e) => peer.send_line(e.to_string()),
            }
        }
    }

    pub async fn bind_identity(&self, peer: &Peer, name: &str) -> Result<(), ChatError> {
        validate_name(name)?;
        let mut sessions = self.sessions.write().await;
        sessions.bind(peer.clone(), name)?;
        let social = self.social.lock().await;
        notify_friends(&sessions, &social, name, true);
        Ok(())
    }

    /// Removes every trace of a connection and tells whoever cares.
    pub async fn handle_disconnect(&self, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.remove(id) else {
            return;
        };

        if let Some(room_name) = &session.room {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_name) {
                let mut room = room.lock().await;
                room.remove_member(id);
                room.broadcast(&Frame::Line(stamped(format!(
                    "**{} disconnected.**",
                    session.name
                ))));
            }
        }

        {
            let social = self.social.lock().await;
            notify_friends(&sessions, &social, &session.name, false);
        }

        for transfer in self.transfers.lock().await.drop_origin(id) {
            warn!(
                "Discarding unfinished transfer {} of {} from {}",
                transfer.id, transfer.filename, session.name
            );
        }
        info!("{} disconnected", session.name);
    }

    pub async fn handle_record(&self, peer: &Peer, record: Record) -> Flow {
        match record {
            Record::Plain(line) => return self.handle_text(peer, &line).await,
            Record::Packet(packet) => self.handle_packet(peer, packet).await,
            Record::Malformed { kind, reason } => {
                debug!("Malformed {kind} record from {}: {reason}", peer.id());
                peer.send_line(stamped(ChatError::MalformedRecord { kind, reason }));
            }
        }
        Flow::Continue
    }

    async fn handle_text(&self, peer: &Peer, line: &str) -> Flow {
        if line.starts_with(COMMAND_MARKER) {
            return self.dispatch(peer, line).await;
        }
        if let Err(e) = self.post(peer.id(), line).await {
            peer.send_line(e.to_string());
        }
        Flow::Continue
    }

    async fn handle_packet(&self, peer: &Peer, packet: Packet) {
        match packet {
            Packet::FileStart(start) => {
                if let Err(e) = self.start_transfer(peer, start).await {
                    peer.send_line(e.to_string());
                }
            }
            Packet::FileChunk(chunk) => self.relay_chunk(peer.id(), chunk).await,
            Packet::FileEnd(end) => self.end_transfer(peer.id(), end).await,
            Packet::PrivateMessage(message) => self.private_message(peer.id(), message).await,
            other => debug!(
                "Ignoring {} packet from {}, clients may only send {INBOUND_KINDS:?}",
                other.kind(),
                peer.id()
            ),
        }
    }

    async fn room_of(&self, name: &str) -> Result<Arc<Mutex<Room>>, ChatError> {
        self.rooms
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(ChatError::NoRoom)
    }

    /// Runs `op` against the caller's current room with that room locked.
    async fn in_current_room<T>(
        &self,
        id: SessionId,
        op: impl FnOnce(&Directory, &Session, &mut Room) -> Result<T, ChatError> + Send,
    ) -> Result<T, ChatError> {
        let sessions = self.sessions.read().await;
        let (session, room_name) = sessions.in_room(id)?;
        let handle = self.room_of(room_name).await?;
        let mut room = handle.lock().await;
        op(&*sessions, session, &mut *room)
    }

    pub async fn current_room(&self, id: SessionId) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(id).ok().and_then(|s| s.room.clone())
    }

    pub async fn create_room(&self, name: &str) -> Result<(), ChatError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(name) {
            return Err(ChatError::AlreadyExists(name.to_string()));
        }
        let room = Room::new(name, self.config.history_capacity);
        rooms.insert(name.to_string(), Arc::new(Mutex::new(room)));
        info!("Room '{name}' created");
        Ok(())
    }

    /// Moves the session into `name`, replaying the room's ledger and pins
    /// to it before anyone else hears about the join.
    pub async fn join_room(&self, id: SessionId, name: &str) -> Result<(), ChatError> {
        let mut sessions = self.sessions.write().await;
        let rooms = self.rooms.read().await;
        let target = rooms
            .get(name)
            .cloned()
            .ok_or(ChatError::NotFound(Missing::Room))?;

        let session = sessions.get_mut(id)?;
        if let Some(previous) = session.room.take() {
            if let Some(previous) = rooms.get(&previous) {
                previous.lock().await.remove_member(id);
            }
        }
        session.room = Some(name.to_string());
        let peer = session.peer.clone();
        let user = session.name.clone();

        let mut room = target.lock().await;
        room.add_member(peer.clone());
        peer.send_line(stamped(format!("Joined {name}")));
        let replay = room.replay();
        if !replay.is_empty() {
            // A single frame, written as one wire line per entry.
            peer.send_line(replay.join("\n"));
        }
        room.broadcast_except(
            &Frame::Line(stamped(format!("**{user} joined the room.**"))),
            Some(id),
        );
        Ok(())
    }

    /// Returns the name of the room left.
    pub async fn leave_room(&self, id: SessionId) -> Result<String, ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        let room_name = session.room.take().ok_or(ChatError::NoRoom)?;
        session.peer.send_line(stamped("Left room"));
        let user = session.name.clone();

        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(&room_name) {
            let mut room = room.lock().await;
            room.remove_member(id);
            room.broadcast(&Frame::Line(stamped(format!("**{user} left.**"))));
        }
        Ok(room_name)
    }

    /// Evicts every member and throws away the room's ledger and pins.
    pub async fn delete_room(&self, name: &str) -> Result<(), ChatError> {
        let mut sessions = self.sessions.write().await;
        let removed = self
            .rooms
            .write()
            .await
            .remove(name)
            .ok_or(ChatError::NotFound(Missing::Room))?;

        let mut room = removed.lock().await;
        let notice = Frame::Line(stamped(format!("Room '{name}' deleted")));
        let members = room.take_members();
        for member in &members {
            if let Ok(session) = sessions.get_mut(member.id()) {
                session.room = None;
            }
            member.send(notice.clone());
        }
        info!("Room '{}' deleted, {} member(s) evicted", room.name(), members.len());
        Ok(())
    }

    pub async fn post(&self, id: SessionId, text: &str) -> Result<u64, ChatError> {
        self.in_current_room(id, |_, session, room| {
            let (message_id, line) = room.post(&session.name, text);
            room.broadcast(&Frame::Line(line));
            Ok(message_id)
        })
        .await
    }

    pub async fn recall(&self, id: SessionId, message_id: u64) -> Result<(), ChatError> {
        self.in_current_room(id, |_, session, room| {
            let tombstone = room.recall(&session.name, message_id)?;
            room.broadcast(&Frame::Line(tombstone));
            Ok(())
        })
        .await
    }

    pub async fn reply(&self, id: SessionId, original: u64, text: &str) -> Result<u64, ChatError> {
        self.in_current_room(id, |_, session, room| {
            let (message_id, line) = room.reply(&session.name, original, text)?;
            room.broadcast(&Frame::Line(line));
            Ok(message_id)
        })
        .await
    }

    /// Returns the new pin number.
    pub async fn pin(&self, id: SessionId, message_id: u64) -> Result<u64, ChatError> {
        self.in_current_room(id, |_, session, room| {
            let number = room.pin(message_id)?;
            room.broadcast(&Frame::Line(stamped(format!(
                "**{} pinned message #{message_id} (pin {number})**",
                session.name
            ))));
            Ok(number)
        })
        .await
    }

    pub async fn unpin(&self, id: SessionId, number: u64) -> Result<(), ChatError> {
        self.in_current_room(id, |_, session, room| {
            room.unpin(number)?;
            room.broadcast(&Frame::Line(stamped(format!(
                "**{} unpinned item {number}**",
                session.name
            ))));
            Ok(())
        })
        .await
    }

    pub async fn list_pins(&self, id: SessionId) -> Result<Vec<String>, ChatError> {
        self.in_current_room(id, |_, _, room| Ok(room.pin_listing()))
            .await
    }

    pub async fn room_users(&self, id: SessionId) -> Result<Vec<String>, ChatError> {
        self.in_current_room(id, |sessions, _, room| {
            Ok(room
                .members()
                .iter()
                .filter_map(|m| sessions.name_of(m.id()).map(str::to_owned))
                .collect())
        })
        .await
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn room_counts(&self) -> Vec<(String, usize)> {
        let rooms = self.rooms.read().await;
        let mut counts = Vec::with_capacity(rooms.len());
        for (name, room) in rooms.iter() {
            counts.push((name.clone(), room.lock().await.members().len()));
        }
        counts
    }

    pub async fn online_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns the previous name. Social relations follow the rename.
    pub async fn rename(&self, id: SessionId, new_name: &str) -> Result<String, ChatError> {
        validate_name(new_name)?;
        let mut sessions = self.sessions.write().await;
        let old = sessions.rename(id, new_name)?;
        self.social.lock().await.rename(&old, new_name);
        info!("{old} is now known as {new_name}");
        Ok(old)
    }

    pub async fn add_friend(&self, id: SessionId, target: &str) -> Result<(), ChatError> {
        let sessions = self.sessions.read().await;
        let me = sessions.get(id)?.name.clone();
        if me == target {
            return Err(ChatError::SelfTarget);
        }
        let target = sessions.find_by_name(target).ok_or(ChatError::NotOnline)?;
        self.social.lock().await.request(&me, &target.name)?;
        target
            .peer
            .send_packet(Packet::FriendRequest(FriendRequest { from: me }));
        Ok(())
    }

    pub async fn accept_friend(&self, id: SessionId, requester: &str) -> Result<(), ChatError> {
        let sessions = self.sessions.read().await;
        let me = sessions.get(id)?.name.clone();
        self.social.lock().await.accept(&me, requester)?;
        if let Some(requester) = sessions.find_by_name(requester) {
            requester
                .peer
                .send_line(format!("[Friend] {me} accepted your request."));
        }
        Ok(())
    }

    pub async fn friends(&self, id: SessionId) -> Result<Vec<String>, ChatError> {
        let sessions = self.sessions.read().await;
        let me = &sessions.get(id)?.name;
        Ok(self.social.lock().await.friends_of(me))
    }

    pub async fn unfriend(&self, id: SessionId, target: &str) -> Result<(), ChatError> {
        let sessions = self.sessions.read().await;
        let me = &sessions.get(id)?.name;
        self.social.lock().await.unfriend(me, target);
        Ok(())
    }

    /// Returns whether `target` is now blocked.
    pub async fn toggle_block(&self, id: SessionId, target: &str) -> Result<bool, ChatError> {
        let sessions = self.sessions.read().await;
        let me = &sessions.get(id)?.name;
        if me == target {
            return Err(ChatError::SelfTarget);
        }
        Ok(self.social.lock().await.toggle_block(me, target))
    }

    pub async fn invite_to_room(&self, id: SessionId, target: &str) -> Result<(), ChatError> {
        let sessions = self.sessions.read().await;
        let (session, room) = sessions.in_room(id)?;
        if session.name == target {
            return Err(ChatError::SelfTarget);
        }
        let target = sessions.find_by_name(target).ok_or(ChatError::NotOnline)?;
        target.peer.send_packet(Packet::Invite(Invite {
            from: session.name.clone(),
            room: room.to_string(),
        }));
        Ok(())
    }

    /// Freezes the recipient set, logs the transfer in the room history and
    /// forwards the start record to every recipient.
    pub async fn start_transfer(
        &self,
        origin: &Peer,
        start: FileStart,
    ) -> Result<TransferId, ChatError> {
        let (transfer_id, recipients, from) = {
            let sessions = self.sessions.read().await;
            let (session, room_name) = sessions.in_room(origin.id())?;
            let handle = self.room_of(room_name).await?;
            let mut room = handle.lock().await;

            let targets = start.to.as_deref().filter(|t| !t.is_empty());
            let recipients: Vec<Peer> = {
                let social = self.social.lock().await;
                room.members()
                    .iter()
                    .filter(|m| m.id() != origin.id())
                    .filter(|m| {
                        sessions.name_of(m.id()).is_some_and(|name| {
                            targets.is_none_or(|t| t.iter().any(|tag| tag == name))
                                && !social.is_blocking(name, &session.name)
                        })
                    })
                    .cloned()
                    .collect()
            };

            let (_, line) = room.record_file(&session.name, &start.filename, start.size);
            room.broadcast(&Frame::Line(line));

            let transfer_id = self.transfers.lock().await.start(
                origin.id(),
                &session.name,
                &start.filename,
                start.size,
                recipients.clone(),
            );
            (transfer_id, recipients, session.name.clone())
        };

        info!(
            "{from} started transfer {transfer_id} of {} ({} B) to {} recipient(s)",
            start.filename,
            start.size,
            recipients.len()
        );
        origin.send_packet(Packet::FileAck(FileAck {
            filename: start.filename.clone(),
            transfer_id,
        }));
        let relayed = Packet::FileStart(FileStart {
            from,
            transfer_id: Some(transfer_id),
            ..start
        });
        fan_out(&recipients, &relayed);
        Ok(transfer_id)
    }

    /// Chunks for a transfer that is not active are dropped.
    pub async fn relay_chunk(&self, origin: SessionId, chunk: FileChunk) {
        let bytes = match BASE64.decode(chunk.data.as_bytes()) {
            Ok(decoded) => decoded.len() as u64,
            Err(e) => {
                warn!("Chunk of {} is not valid base64: {e}", chunk.filename);
                0
            }
        };

        let (recipients, packet) = {
            let mut transfers = self.transfers.lock().await;
            let Some(transfer) =
                transfers.record_chunk(origin, &chunk.filename, chunk.transfer_id, bytes)
            else {
                debug!("Dropping chunk of {} for no active transfer", chunk.filename);
                return;
            };
            let packet = Packet::FileChunk(FileChunk {
                from: transfer.from.clone(),
                transfer_id: Some(transfer.id),
                ..chunk
            });
            (Arc::clone(&transfer.recipients), packet)
        };
        fan_out(&recipients, &packet);
    }

    pub async fn end_transfer(&self, origin: SessionId, end: FileEnd) {
        let finished = self
            .transfers
            .lock()
            .await
            .finish(origin, &end.filename, end.transfer_id);
        let Some(transfer) = finished else {
            debug!("Dropping end of {} for no active transfer", end.filename);
            return;
        };

        fan_out(
            &transfer.recipients,
            &Packet::FileEnd(FileEnd {
                from: transfer.from.clone(),
                transfer_id: Some(transfer.id),
                ..end
            }),
        );
        if transfer.relayed_bytes == transfer.size {
            info!(
                "Transfer {} of {} finished after {} chunk(s)",
                transfer.id, transfer.filename, transfer.chunks
            );
        } else {
            warn!(
                "Transfer {} of {} ended with {} of {} B relayed",
                transfer.id, transfer.filename, transfer.relayed_bytes, transfer.size
            );
        }
    }

    /// Relays a private message to the named identities that have not
    /// blocked the sender.
    pub async fn private_message(&self, origin: SessionId, message: PrivateMessage) {
        let (from, recipients) = {
            let sessions = self.sessions.read().await;
            let Some(from) = sessions.name_of(origin).map(str::to_owned) else {
                return;
            };
            let social = self.social.lock().await;
            let recipients: Vec<Peer> = sessions
                .iter()
                .filter(|s| s.peer.id() != origin)
                .filter(|s| {
                    message
                        .to
                        .iter()
                        .any(|tag| tag.trim_start_matches('@') == s.name)
                })
                .filter(|s| !social.is_blocking(&s.name, &from))
                .map(|s| s.peer.clone())
                .collect();
            (from, recipients)
        };
        fan_out(
            &recipients,
            &Packet::PrivateMessage(PrivateMessage { from, ..message }),
        );
    }
}
