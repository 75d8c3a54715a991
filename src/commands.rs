use std::fmt::Display;

use log::debug;

use crate::error::ChatError;
use crate::framing::Frame;
use crate::server::{stamped, Flow, Server, FAREWELL};
use crate::session::Peer;

pub const COMMAND_MARKER: char = '/';

/// Terminal reset sequence sent for `/clean`.
pub const CLEAR_SCREEN: &str = "\x1bc";

const CLIENT_SIDE: [&str; 11] = [
    "/sendfile", "/pic", "/mp3", "/mp4", "/text", "/gif", "/pdf", "/open", "/save", "/msg",
    "/forward",
];

const HELP_ROOT: [&str; 6] = [
    "Help topics, use /help <number or name>:",
    "  1) menu    commands outside any room",
    "  2) chat    commands inside a room",
    "  3) file    sending files and private messages",
    "  4) friend  friends, blocks and invites",
    "Lines not starting with / are posted to your current room.",
];

const HELP_MENU: [(&str, &str); 9] = [
    ("/room", "list rooms"),
    ("/create <room>", "create a room"),
    ("/join <room>", "join a room, leaving the current one"),
    ("/rename <name>", "change your username"),
    ("/delete <room>", "delete a room and evict its members"),
    ("/count", "members per room"),
    ("/online", "number of users online"),
    ("/clean", "clear the screen (outside rooms only)"),
    ("/quit", "log out"),
];

const HELP_CHAT: [(&str, &str); 10] = [
    ("/leave", "leave the current room"),
    ("/users", "who is in this room"),
    ("/recall <id>", "withdraw one of your messages"),
    ("/reply <id> <text>", "answer a message with a quote"),
    ("/pin <id>", "pin a message"),
    ("/pinned", "show the pin list"),
    ("/unpin <pin>", "remove a pin by its number"),
    ("/msg @user <text>", "private message"),
    ("/invitefriend <user>", "invite someone to this room"),
    ("/help", "this help"),
];

const HELP_FILE: [(&str, &str); 9] = [
    ("/sendfile <path>", "send any file to the room"),
    ("/pic <path>", "send an image"),
    ("/mp3 <path>", "send audio"),
    ("/mp4 <path>", "send video"),
    ("/text <path>", "send a text file"),
    ("/pdf <path>", "send a pdf"),
    ("/gif <url>", "download and send a gif"),
    ("/open <file>", "open a received file"),
    ("/save <file>", "keep a received file"),
];

const HELP_FRIEND: [(&str, &str); 5] = [
    ("/addfriend <user>", "send a friend request"),
    ("/acceptfriend <user>", "accept a pending request"),
    ("/myfriends", "list your friends"),
    ("/unfriend <user>", "remove a friend"),
    ("/block <user>", "block or unblock a user"),
];

fn help_topic(topic: &str) -> Option<&'static [(&'static str, &'static str)]> {
    match topic {
        "1" | "menu" => Some(&HELP_MENU),
        "2" | "chat" => Some(&HELP_CHAT),
        "3" | "file" => Some(&HELP_FILE),
        "4" | "friend" => Some(&HELP_FRIEND),
        _ => None,
    }
}

/// A parsed `/` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help(Option<String>),
    RoomList,
    Create(String),
    Join(String),
    Rename(String),
    Delete(String),
    Count,
    Online,
    Clean,
    Quit,
    Leave,
    Users,
    Recall(u64),
    Reply(u64, String),
    Pin(u64),
    Pinned,
    Unpin(u64),
    InviteFriend(String),
    AddFriend(String),
    AcceptFriend(String),
    MyFriends,
    Unfriend(String),
    Block(String),
    /// Handled entirely by the client; the server stays silent.
    ClientSide(String),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, ChatError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(Command::Unknown(String::new()));
        };
        let args: Vec<&str> = words.collect();
        let word = |usage| {
            args.first()
                .map(|s| (*s).to_string())
                .ok_or(ChatError::Usage(usage))
        };
        let number = |usage| {
            args.first()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(ChatError::Usage(usage))
        };

        let command = match name {
            "/help" => Command::Help(args.first().map(|s| s.to_lowercase())),
            "/room" => Command::RoomList,
            "/create" => Command::Create(word("/create <room>")?),
            "/join" => Command::Join(word("/join <room>")?),
            "/rename" => Command::Rename(word("/rename <name>")?),
            "/delete" => Command::Delete(word("/delete <room>")?),
            "/count" => Command::Count,
            "/online" => Command::Online,
            "/clean" => Command::Clean,
            "/quit" => Command::Quit,
            "/leave" => Command::Leave,
            "/users" => Command::Users,
            "/recall" => Command::Recall(number("/recall <id>")?),
            "/reply" => {
                let id = number("/reply <id> <text>")?;
                if args.len() < 2 {
                    return Err(ChatError::Usage("/reply <id> <text>"));
                }
                Command::Reply(id, args[1..].join(" "))
            }
            "/pin" => Command::Pin(number("/pin <id>")?),
            "/pinned" => Command::Pinned,
            "/unpin" => Command::Unpin(number("/unpin <pin>")?),
            "/invitefriend" => Command::InviteFriend(word("/invitefriend <user>")?),
            "/addfriend" => Command::AddFriend(word("/addfriend <user>")?),
            "/acceptfriend" => Command::AcceptFriend(word("/acceptfriend <user>")?),
            "/myfriends" => Command::MyFriends,
            "/unfriend" => Command::Unfriend(word("/unfriend <user>")?),
            "/block" => Command::Block(word("/block <user>")?),
            other if CLIENT_SIDE.contains(&other) => Command::ClientSide(other.to_string()),
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }

    pub fn requires_room(&self) -> bool {
        matches!(
            self,
            Command::Leave
                | Command::Users
                | Command::Recall(_)
                | Command::Reply(..)
                | Command::Pin(_)
                | Command::Pinned
                | Command::Unpin(_)
                | Command::InviteFriend(_)
        )
    }
}

fn tell(peer: &Peer, text: impl Display) {
    peer.send_line(stamped(text));
}

impl Server {
    /// Runs one command line for `peer`. Failures are reported to the
    /// caller only and never end the session.
    pub async fn dispatch(&self, peer: &Peer, line: &str) -> Flow {
        let result = match Command::parse(line) {
            Ok(command) => self.execute(peer, command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(flow) => flow,
            Err(e) => {
                debug!("Command {line:?} from {} failed: {e}", peer.id());
                tell(peer, e);
                Flow::Continue
            }
        }
    }

    async fn execute(&self, peer: &Peer, command: Command) -> Result<Flow, ChatError> {
        let id = peer.id();
        let in_room = self.current_room(id).await.is_some();
        if command.requires_room() && !in_room {
            return Err(ChatError::NoRoom);
        }

        match command {
            Command::Help(None) => {
                for line in HELP_ROOT {
                    peer.send_line(line);
                }
            }
            Command::Help(Some(topic)) => match help_topic(&topic) {
                Some(entries) => {
                    for (usage, what) in entries {
                        peer.send_line(format!("{usage:<22}{what}"));
                    }
                }
                None => tell(peer, format!("No help for '{topic}'. Try /help")),
            },
            Command::RoomList => {
                tell(peer, format!("Rooms: {}", self.room_names().await.join(", ")));
            }
            Command::Create(name) => {
                self.create_room(&name).await?;
                tell(peer, format!("Room '{name}' created."));
            }
            Command::Join(name) => self.join_room(id, &name).await?,
            Command::Rename(name) => {
                self.rename(id, &name).await?;
                tell(peer, format!("Renamed to {name}"));
            }
            Command::Delete(name) => {
                self.delete_room(&name).await?;
                tell(peer, format!("Room '{name}' deleted."));
            }
            Command::Count => {
                let counts: Vec<String> = self
                    .room_counts()
                    .await
                    .into_iter()
                    .map(|(room, n)| format!("{room}:{n}"))
                    .collect();
                tell(peer, counts.join(", "));
            }
            Command::Online => {
                tell(peer, format!("Online users: {}", self.online_count().await));
            }
            Command::Clean => {
                if in_room {
                    return Err(ChatError::InsideRoom);
                }
                peer.send(Frame::Raw(CLEAR_SCREEN.to_string()));
            }
            Command::Quit => {
                peer.send_line(FAREWELL);
                return Ok(Flow::Quit);
            }
            Command::Leave => {
                self.leave_room(id).await?;
            }
            Command::Users => {
                tell(peer, format!("Users: {}", self.room_users(id).await?.join(", ")));
            }
            Command::Recall(message_id) => self.recall(id, message_id).await?,
            Command::Reply(original, text) => {
                self.reply(id, original, &text).await?;
            }
            Command::Pin(message_id) => {
                self.pin(id, message_id).await?;
            }
            Command::Pinned => {
                peer.send_line(self.list_pins(id).await?.join("\n"));
            }
            Command::Unpin(number) => self.unpin(id, number).await?,
            Command::InviteFriend(target) => {
                self.invite_to_room(id, &target).await?;
                tell(peer, "Invite sent.");
            }
            Command::AddFriend(target) => {
                self.add_friend(id, &target).await?;
                tell(peer, "Request sent.");
            }
            Command::AcceptFriend(requester) => {
                self.accept_friend(id, &requester).await?;
                tell(peer, "Friend added.");
            }
            Command::MyFriends => {
                let friends = self.friends(id).await?;
                if friends.is_empty() {
                    tell(peer, "Friends: (none)");
                } else {
                    tell(peer, format!("Friends: {}", friends.join(", ")));
                }
            }
            Command::Unfriend(target) => {
                self.unfriend(id, &target).await?;
                tell(peer, "Removed.");
            }
            Command::Block(target) => {
                if self.toggle_block(id, &target).await? {
                    tell(peer, format!("Blocked {target}"));
                } else {
                    tell(peer, format!("Unblocked {target}"));
                }
            }
            Command::ClientSide(name) => debug!("{name} from {id} is a client-side command"),
            Command::Unknown(_) => tell(peer, "Unknown command."),
        }
        Ok(Flow::Continue)
    }
}
