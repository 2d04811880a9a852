//! Fixed 8-byte wire header framing connection payloads.
//!
//! The header carries two 32-bit fields in network byte order: the message
//! kind (request or response) and the body length. Collaborators frame the
//! bytes flowing through a connection's buffers with it; the reactor core
//! itself never parses payloads.

/// Encoded size of a [`Header`] on the wire.
pub const HEADER_LEN: usize = 8;

/// Message kind carried in the header's first field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Kind {
    Request = 1,
    Response = 2,
}

impl Kind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Kind::Request),
            2 => Some(Kind::Response),
            _ => None,
        }
    }
}

/// The fixed command/length framing header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub kind: Kind,
    pub body_len: u32,
}

impl Header {
    /// Encodes the header into its 8-byte network-order representation.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&(self.kind as u32).to_be_bytes());
        out[4..].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }

    /// Decodes a header from the front of `bytes`.
    ///
    /// # Returns
    /// `None` if fewer than 8 bytes are available or the kind field holds an
    /// unknown value.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let kind = u32::from_be_bytes(bytes[..4].try_into().unwrap());
        let body_len = u32::from_be_bytes(bytes[4..HEADER_LEN].try_into().unwrap());
        Some(Self {
            kind: Kind::from_u32(kind)?,
            body_len,
        })
    }
}
