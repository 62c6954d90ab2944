//! Wire protocol for the streaming channel

mod codec;

pub use codec::{Command, DecodeError, FrameMetadata, MessageCodec, StreamAction, StreamEvent};
