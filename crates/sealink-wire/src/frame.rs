//! Wire framing.
//!
//! Every frame is a 4-byte big-endian length header followed by a JSON body
//! tagged by `"type"`. Binary fields are base64 encoded.

use crate::envelope::TransferEnvelope;
use crate::error::WireError;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of the frame header.
pub const HEADER_LEN: usize = 4;

/// A single unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// The sender's public key (SPKI DER), unencrypted. First frame in
    /// encrypted mode.
    #[serde(rename = "handshake")]
    Handshake {
        #[serde(with = "crate::serde_b64")]
        public_key: Vec<u8>,
    },
    /// A hybrid-encrypted application message.
    #[serde(rename = "envelope")]
    Envelope(TransferEnvelope),
    /// A serialized application message, plaintext mode only.
    #[serde(rename = "plain")]
    Plain {
        #[serde(with = "crate::serde_b64")]
        payload: Vec<u8>,
    },
}

impl Frame {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Envelope(_) => "envelope",
            Self::Plain { .. } => "plain",
        }
    }
}

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(frame)?;
    let len = u32::try_from(json.len()).map_err(|_| WireError::FrameTooLarge {
        size: json.len(),
        max: u32::MAX as usize,
    })?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a Frame.
pub fn decode_frame(body: &[u8]) -> Result<Frame, WireError> {
    serde_json::from_slice(body).map_err(|e| WireError::StreamCorrupted(e.to_string()))
}

/// Read exactly one frame from an async reader.
///
/// Never reads past the end of the frame, so whatever follows stays in the
/// socket for the next owner.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header) as usize;
    if len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body)
}

/// Reassembles frames from arbitrarily split reads.
///
/// Holds at most one partial frame. A header announcing more than
/// `max_frame_size` bytes is a framing desync and is reported as soon as the
/// header is seen, before any body is buffered.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, if one is buffered.
    pub fn next_body(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let len = decode_length(&header) as usize;
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).to_vec()))
    }

    /// Bytes held for an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
