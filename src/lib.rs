//! Anonymous 1:1 Matchmaking & Chat Relay Server Library
//!
//! A WebSocket server that pairs anonymous strangers for 1:1 chat,
//! built with tokio-tungstenite using the Actor pattern for state
//! management.
//!
//! # Features
//! - Attribute-preferred matchmaking with FIFO fallback
//! - Durable sessions that survive transport drops (grace period)
//! - Ordered message relay with transient half-open buffering
//! - Typing indicators, emoji reactions, read receipts
//! - Explicit skip/end-of-chat handling
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning the session registry,
//!   waiting pool, and pair map
//! - Each connection has a `handler` task communicating with the server
//! - No locks needed - all state access goes through message passing;
//!   delivery to peers is non-blocking so pairs never stall each other
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use pairchat_server::{handle_connection, ChatServer, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env();
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!     let (cmd_tx, cmd_rx) = mpsc::channel(256);
//!
//!     tokio::spawn(ChatServer::new(config, cmd_rx, cmd_tx.clone()).run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let cmd_tx = cmd_tx.clone();
//!         tokio::spawn(handle_connection(stream, cmd_tx));
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod pair;
pub mod pool;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use error::{AppError, SendError};
pub use handler::handle_connection;
pub use message::{ClientMessage, Envelope, ErrorCode, ServerMessage};
pub use pair::{Pair, PairState};
pub use pool::{WaitingEntry, WaitingPool};
pub use server::{ChatServer, ServerCommand};
pub use session::{Session, SessionState};
pub use types::{MessageId, PairId, SessionId};
