//! Wire protocol: binary packets and the admin text protocol

pub mod admin;
mod packet;
mod parser;

pub use packet::{
    bytes_to_string, Magic, Packet, PacketType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, REQ_MAGIC,
    RES_MAGIC,
};
pub use parser::{Frame, FrameParser};
