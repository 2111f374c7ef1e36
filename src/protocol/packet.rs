//! Binary packet encoding
//!
//! Every binary frame has a 12-byte header:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ Magic    │ Type     │ Length   │
//! │ 4 bytes  │ uint32 BE│ uint32 BE│
//! └──────────┴──────────┴──────────┘
//! ```
//! followed by `Length` payload bytes. Payload arguments are NUL separated;
//! the last argument is opaque and may itself contain NUL bytes.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Default maximum payload size (1MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Magic prefix of frames sent to the server
pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";

/// Magic prefix of frames sent by the server
pub const RES_MAGIC: [u8; 4] = *b"\0RES";

/// Frame direction, identified by the magic prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// `\0REQ`
    Request,
    /// `\0RES`
    Response,
}

impl Magic {
    /// Wire bytes for this magic
    #[must_use]
    pub fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => REQ_MAGIC,
            Magic::Response => RES_MAGIC,
        }
    }

    /// Parse a magic prefix
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the bytes match neither magic.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes == &REQ_MAGIC[..] {
            Ok(Magic::Request)
        } else if bytes == &RES_MAGIC[..] {
            Ok(Magic::Response)
        } else {
            Err(Error::Protocol(format!("Invalid magic: {bytes:02x?}")))
        }
    }
}

macro_rules! packet_types {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Packet type codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum PacketType {
            $($name),+
        }

        impl PacketType {
            /// Numeric code on the wire
            #[must_use]
            pub fn code(self) -> u32 {
                match self {
                    $(PacketType::$name => $code),+
                }
            }

            /// Look up a packet type by its wire code
            ///
            /// # Errors
            ///
            /// Returns a protocol error for unknown codes.
            pub fn from_code(code: u32) -> Result<Self> {
                match code {
                    $($code => Ok(PacketType::$name),)+
                    _ => Err(Error::Protocol(format!("Unknown packet type: {code}"))),
                }
            }
        }
    };
}

packet_types! {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    AllYours = 24,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

/// A decoded binary packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Direction
    pub magic: Magic,
    /// Packet type
    pub ptype: PacketType,
    /// Raw payload
    pub data: Bytes,
}

impl Packet {
    /// Create a packet from raw payload bytes
    #[must_use]
    pub fn new(magic: Magic, ptype: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            magic,
            ptype,
            data: data.into(),
        }
    }

    /// Create a request packet by joining `args` with NUL separators
    #[must_use]
    pub fn request(ptype: PacketType, args: &[&[u8]]) -> Self {
        Self::new(Magic::Request, ptype, join_arguments(args))
    }

    /// Create a response packet by joining `args` with NUL separators
    #[must_use]
    pub fn response(ptype: PacketType, args: &[&[u8]]) -> Self {
        Self::new(Magic::Response, ptype, join_arguments(args))
    }

    /// Split the payload into exactly `count` arguments.
    ///
    /// The last argument receives the remainder of the payload, NULs included.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload has fewer separators than needed.
    pub fn arguments(&self, count: usize) -> Result<Vec<Bytes>> {
        let mut args = Vec::with_capacity(count);
        let mut rest = self.data.clone();

        for _ in 1..count {
            let Some(pos) = rest.iter().position(|b| *b == 0) else {
                return Err(Error::Protocol(format!(
                    "{:?} expects {} arguments",
                    self.ptype, count
                )));
            };
            args.push(rest.slice(..pos));
            rest = rest.slice(pos + 1..);
        }

        if count > 0 {
            args.push(rest);
        }
        Ok(args)
    }

    /// Split a WORK_* style payload into the handle and everything after it.
    ///
    /// The remainder is empty when the payload carries only a handle.
    #[must_use]
    pub fn handle_and_payload(&self) -> (Bytes, Bytes) {
        match self.data.iter().position(|b| *b == 0) {
            Some(pos) => (self.data.slice(..pos), self.data.slice(pos + 1..)),
            None => (self.data.clone(), Bytes::new()),
        }
    }

    /// Payload interpreted as a single UTF-8 argument
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload is not valid UTF-8.
    pub fn text(&self) -> Result<String> {
        bytes_to_string(&self.data)
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append wire bytes to `buf`
    ///
    /// # Panics
    ///
    /// Panics if the payload is larger than `u32::MAX` bytes.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let len = u32::try_from(self.data.len()).expect("payload length fits in u32");
        buf.put_slice(&self.magic.bytes());
        buf.put_u32(self.ptype.code());
        buf.put_u32(len);
        buf.put_slice(&self.data);
    }
}

/// Decode an argument as UTF-8 text
///
/// # Errors
///
/// Returns a protocol error if the bytes are not valid UTF-8.
pub fn bytes_to_string(data: &[u8]) -> Result<String> {
    std::str::from_utf8(data)
        .map(std::string::ToString::to_string)
        .map_err(|_| Error::Protocol("Invalid UTF-8 in argument".to_string()))
}

fn join_arguments(args: &[&[u8]]) -> Bytes {
    let len = args.iter().map(|a| a.len()).sum::<usize>() + args.len().saturating_sub(1);
    let mut buf = BytesMut::with_capacity(len);
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            buf.put_u8(0);
        }
        buf.put_slice(arg);
    }
    buf.freeze()
}
