//! Binary frame codec for the MFT file-copy protocol.
//!
//! Layout, bit-exact:
//!
//! ```text
//! "mftframe" (8) | type (1) | frameNo (2, LE) | body (1..=5000) | "by lucarignanese" (16)
//! ```
//!
//! The sender numbers frames descending: START carries the total frame
//! count, TRANSMISSION frames count N..1, END carries 0. The receiver can
//! detect gaps and knows the total from the START frame alone.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Leading magic of every frame.
pub const FRAME_MAGIC: &[u8; 8] = b"mftframe";

/// Trailing magic of every frame.
pub const FRAME_FOOTER: &[u8; 16] = b"by lucarignanese";

/// Maximum body size per frame.
pub const MAX_BODY_LEN: usize = 5000;

/// Header length: magic + type byte + 2-byte frame number.
pub const HEADER_LEN: usize = FRAME_MAGIC.len() + 1 + 2;

/// Footer length.
pub const FOOTER_LEN: usize = FRAME_FOOTER.len();

/// Smallest valid frame (1-byte filler body).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1 + FOOTER_LEN;

/// Largest valid frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_BODY_LEN + FOOTER_LEN;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Start = 0,
    Transmission = 1,
    End = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Start),
            1 => Ok(FrameType::Transmission),
            2 => Ok(FrameType::End),
            other => Err(Error::Codec {
                message: format!("invalid frame type {other}"),
            }),
        }
    }
}

/// One MFT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    frame_no: u16,
    body: Bytes,
}

impl Frame {
    /// START frame; `frame_no` is the total transmission frame count.
    pub fn start(frame_no: u16) -> Self {
        Frame {
            frame_type: FrameType::Start,
            frame_no,
            body: Bytes::from_static(&[0]),
        }
    }

    /// END frame; `frame_no` is 0 on the wire.
    pub fn end(frame_no: u16) -> Self {
        Frame {
            frame_type: FrameType::End,
            frame_no,
            body: Bytes::from_static(&[0]),
        }
    }

    /// TRANSMISSION frame carrying a slice of file bytes.
    pub fn transmission(frame_no: u16, body: impl Into<Bytes>) -> Result<Self> {
        let body = body.into();
        if body.is_empty() {
            return Err(Error::codec("frame body must not be empty"));
        }
        if body.len() > MAX_BODY_LEN {
            return Err(Error::Codec {
                message: format!("frame body {} exceeds max {}", body.len(), MAX_BODY_LEN),
            });
        }
        Ok(Frame {
            frame_type: FrameType::Transmission,
            frame_no,
            body,
        })
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn frame_no(&self) -> u16 {
        self.frame_no
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len() + FOOTER_LEN);
        buf.put_slice(FRAME_MAGIC);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16_le(self.frame_no);
        buf.put_slice(&self.body);
        buf.put_slice(FRAME_FOOTER);
        buf.freeze()
    }

    /// Decode a frame, verifying size bounds and both magics.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(Error::Codec {
                message: format!("frame size {} below minimum {}", raw.len(), MIN_FRAME_LEN),
            });
        }
        if raw.len() > MAX_FRAME_LEN {
            return Err(Error::Codec {
                message: format!("frame size {} above maximum {}", raw.len(), MAX_FRAME_LEN),
            });
        }
        if &raw[..FRAME_MAGIC.len()] != FRAME_MAGIC {
            return Err(Error::codec("invalid frame header"));
        }
        if &raw[raw.len() - FOOTER_LEN..] != FRAME_FOOTER {
            return Err(Error::codec("invalid frame footer"));
        }
        let frame_type = FrameType::try_from(raw[FRAME_MAGIC.len()])?;
        let frame_no = u16::from_le_bytes([raw[FRAME_MAGIC.len() + 1], raw[FRAME_MAGIC.len() + 2]]);
        let body = Bytes::copy_from_slice(&raw[HEADER_LEN..raw.len() - FOOTER_LEN]);
        Ok(Frame {
            frame_type,
            frame_no,
            body,
        })
    }
}

/// Progress of a running transfer, pushed to an optional sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub frame_total: u32,
    pub frame_received: u32,
    pub percent: f32,
}

impl Progress {
    pub fn new(frame_total: u32, frame_received: u32) -> Self {
        let percent = if frame_total == 0 {
            0.0
        } else {
            (frame_received as f32 / frame_total as f32) * 100.0
        };
        Progress {
            frame_total,
            frame_received,
            percent,
        }
    }
}
