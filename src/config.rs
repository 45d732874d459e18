//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::error::{ChatError, Result};
use crate::protocol::frame::DEFAULT_MAX_FRAME_SIZE;

/// Chat server
#[derive(Parser, Clone, Debug)]
#[command(name = "chatline", version, about = "Multi-user chat server")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "CHATLINE_BIND_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], 15000)))]
    pub bind_addr: SocketAddr,

    /// Directory holding the credential and queue databases
    #[arg(long, env = "CHATLINE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Credential database file name, relative to the data directory
    #[arg(long, env = "CHATLINE_CREDENTIALS_DB", default_value = "users.db")]
    pub credentials_db: String,

    /// Durable queue database file name, relative to the data directory
    #[arg(long, env = "CHATLINE_QUEUE_DB", default_value = "queue.db")]
    pub queue_db: String,

    /// Run without the durable queue (chat is broadcast directly)
    #[arg(long, env = "CHATLINE_NO_QUEUE")]
    pub no_queue: bool,

    /// Clear chat history and activity ranking at startup
    #[arg(long, env = "CHATLINE_RESET_QUEUE")]
    pub reset_queue_on_start: bool,

    /// Number of consumer replay workers
    #[arg(long, env = "CHATLINE_CONSUMERS", default_value_t = 3)]
    pub consumers: usize,

    /// Chat entries kept in the durable queue
    #[arg(long, env = "CHATLINE_QUEUE_RETENTION", default_value_t = 1000)]
    pub queue_retention: u64,

    /// Lines returned by /history
    #[arg(long, env = "CHATLINE_HISTORY_COUNT", default_value_t = 10)]
    pub history_count: usize,

    /// Entries returned by /rank
    #[arg(long, env = "CHATLINE_RANK_COUNT", default_value_t = 5)]
    pub rank_count: usize,

    #[arg(long, env = "CHATLINE_INBOUND_CAPACITY", default_value_t = 100)]
    pub inbound_capacity: usize,

    #[arg(long, env = "CHATLINE_BROADCAST_CAPACITY", default_value_t = 100)]
    pub broadcast_capacity: usize,

    #[arg(long, env = "CHATLINE_REGISTER_CAPACITY", default_value_t = 10)]
    pub register_capacity: usize,

    #[arg(long, env = "CHATLINE_UNREGISTER_CAPACITY", default_value_t = 10)]
    pub unregister_capacity: usize,

    /// Largest accepted frame payload in bytes
    #[arg(long, env = "CHATLINE_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Enable structured JSON logging
    #[arg(long, env = "CHATLINE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 15000)),
            data_dir: PathBuf::from("./data"),
            credentials_db: "users.db".to_string(),
            queue_db: "queue.db".to_string(),
            no_queue: false,
            reset_queue_on_start: false,
            consumers: 3,
            queue_retention: 1000,
            history_count: 10,
            rank_count: 5,
            inbound_capacity: 100,
            broadcast_capacity: 100,
            register_capacity: 10,
            unregister_capacity: 10,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(&self.credentials_db)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(&self.queue_db)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("inbound", self.inbound_capacity),
            ("broadcast", self.broadcast_capacity),
            ("register", self.register_capacity),
            ("unregister", self.unregister_capacity),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(ChatError::config(format!("{} queue capacity must be positive", name)));
            }
        }
        if self.max_frame_size == 0 {
            return Err(ChatError::config("max frame size must be positive"));
        }
        if !self.no_queue {
            if self.consumers == 0 {
                return Err(ChatError::config(
                    "at least one consumer is required unless the queue is disabled",
                ));
            }
            if self.queue_retention == 0 {
                return Err(ChatError::config("queue retention must be positive"));
            }
        }
        Ok(())
    }
}
