//! Wire protocol between viewer instances
//!
//! Everything that crosses a socket lives here: the [`Message`] enum, the
//! length-prefixed frame codec for TCP, and the discovery announcement
//! codec for UDP. The managers never touch raw bytes themselves.

pub mod message;
pub mod wire;

pub use message::{kind, Message};
pub use wire::{
    decode_announcement, encode_announcement, Announcement, FrameCodec, DISCOVERY_MAGIC,
    MAX_FRAME_SIZE,
};
