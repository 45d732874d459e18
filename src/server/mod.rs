//! Chat server implementation
//!
//! ## Task layout
//!
//! - **Accept loop**: hands each new socket to the register queue
//! - **Admission**: starts one session task per connection
//! - **Sessions**: authenticate, then classify client lines
//! - **Dispatcher**: routes chat through the durable queue, everything else
//!   straight to the broadcaster
//! - **Consumers**: replay queued chat into the broadcast queue
//! - **Broadcaster**: fans envelopes out to registered sessions
//! - **Unregister handler**: removes connections whose writes failed

pub mod auth;
pub mod chat_server;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;
pub mod session;

pub use chat_server::ChatServer;
pub use lifecycle::Shutdown;
pub use registry::ConnectionRegistry;
pub use session::SessionContext;
