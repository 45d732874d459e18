//! Wire protocol: length-prefixed frames and the messages they carry

pub mod frame;
pub mod messages;

pub use frame::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec, FrameReader, write_frame};
pub use messages::{ConnId, Envelope, MessageKind, ReplyKind, ServerMessage};
