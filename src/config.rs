use clap::Parser;

use crate::framing::FramingMode;
use crate::history::DEFAULT_CAPACITY;
use crate::session::DEFAULT_QUEUE_DEPTH;

/// Multi-room chat and file relay server
#[derive(Parser, Debug, Clone)]
#[command(name = "room_relay")]
#[command(version)]
pub struct Config {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:12345")]
    pub bind: String,

    /// Room to create at startup (repeatable)
    #[arg(long = "room", default_values = ["room1", "room2", "room3"])]
    pub rooms: Vec<String>,

    /// Messages kept per room before the oldest is evicted
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub history_capacity: usize,

    /// Longest accepted record in bytes; longer records are discarded
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_line_bytes: usize,

    /// Outbound frames queued per connection before further sends to it are dropped
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    pub outbound_queue: usize,

    /// Require packets to start with the 0x1E record separator
    #[arg(long)]
    pub strict_framing: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn framing_mode(&self) -> FramingMode {
        if self.strict_framing {
            FramingMode::Enveloped
        } else {
            FramingMode::ValueDriven
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["room_relay"])
    }
}
