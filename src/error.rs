use std::fmt;

use thiserror::Error;

/// What a failed lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Room,
    Message(u64),
    Pin(u64),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Room => write!(f, "Room"),
            Missing::Message(id) => write!(f, "ID #{id}"),
            Missing::Pin(number) => write!(f, "Pin {number}"),
        }
    }
}

/// Every failure a command or packet can produce.
///
/// None of these close the connection: the `Display` text is sent back to
/// the issuing client as a private line and the read loop carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("{0} not found")]
    NotFound(Missing),
    #[error("Room '{0}' already exists")]
    AlreadyExists(String),
    #[error("Already friends or pending.")]
    AlreadyRelated,
    #[error("Only recall own msg")]
    NotOwner,
    #[error("Join a room first.")]
    NoRoom,
    #[error("User not online.")]
    NotOnline,
    #[error("No pending request.")]
    NoPendingRequest,
    #[error("Username taken, try again.")]
    UsernameTaken,
    #[error("Invalid username '{0}'")]
    InvalidName(String),
    #[error("You cannot do that to yourself.")]
    SelfTarget,
    #[error("Cannot /clean inside a room.")]
    InsideRoom,
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Malformed {kind} record: {reason}")]
    MalformedRecord { kind: String, reason: String },
}

/// Identity names are single tokens so they can be used as command arguments.
pub fn validate_name(name: &str) -> Result<(), ChatError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ChatError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_private_reply() {
        assert_eq!(ChatError::NotFound(Missing::Message(7)).to_string(), "ID #7 not found");
        assert_eq!(ChatError::NotFound(Missing::Room).to_string(), "Room not found");
        assert_eq!(ChatError::Usage("/pin <id>").to_string(), "Usage: /pin <id>");
    }

    #[test]
    fn names_must_be_single_tokens() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("two words").is_err());
    }
}
