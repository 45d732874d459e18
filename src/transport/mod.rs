//! Transport layer: per-client connection handles over byte streams

pub mod connection;

pub use connection::{BoxedReader, Connection, SessionReader};
