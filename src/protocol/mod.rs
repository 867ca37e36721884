//! Tunnel protocol: wire codec, body transcoding, and id generation.

pub mod body;
pub mod codec;
pub mod ids;
