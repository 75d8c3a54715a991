pub mod commands;
pub mod config;
pub mod error;
pub mod framing;
pub mod history;
pub mod messages;
pub mod room;
pub mod server;
pub mod session;
pub mod social;
pub mod transfer;

pub use config::Config;
pub use error::ChatError;
pub use server::Server;
