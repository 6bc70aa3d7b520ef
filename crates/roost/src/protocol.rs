//! Framed IPC between the session daemon and its clients.
//!
//! Wire format per message: 1-byte type, 4-byte big-endian payload length,
//! then the payload. Frames above [`MAX_FRAME_LEN`] are a protocol error and
//! the connection is dropped. Reads are strict; writes are best-effort at the
//! call sites that fan out to multiple clients.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const TYPE_INPUT: u8 = 1;
const TYPE_OUTPUT: u8 = 2;
const TYPE_RESIZE: u8 = 3;
const TYPE_EXIT: u8 = 4;

/// One protocol message.
///
/// `Unknown` stands in for unrecognized type codes and malformed `Resize`
/// payloads; receivers ignore it so the protocol stays forward-compatible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client → server: bytes for the PTY master.
    Input(Vec<u8>),
    /// Server → client: bytes read from the PTY master.
    Output(Vec<u8>),
    /// Client → server: the client terminal's dimensions.
    Resize { rows: u16, cols: u16 },
    /// Server → client: the hosted process ended.
    Exit,
    Unknown,
}

impl Frame {
    /// Encode to the wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let (type_byte, payload): (u8, &[u8]) = match self {
            Frame::Input(data) => (TYPE_INPUT, data),
            Frame::Output(data) => (TYPE_OUTPUT, data),
            Frame::Resize { rows, cols } => {
                let mut buf = Vec::with_capacity(5 + 4);
                buf.push(TYPE_RESIZE);
                buf.extend_from_slice(&4u32.to_be_bytes());
                buf.extend_from_slice(&rows.to_be_bytes());
                buf.extend_from_slice(&cols.to_be_bytes());
                return buf;
            }
            Frame::Exit => (TYPE_EXIT, &[]),
            Frame::Unknown => (0, &[]),
        };
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.push(type_byte);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn decode(type_byte: u8, payload: Vec<u8>) -> Frame {
        match type_byte {
            TYPE_INPUT => Frame::Input(payload),
            TYPE_OUTPUT => Frame::Output(payload),
            TYPE_RESIZE if payload.len() >= 4 => Frame::Resize {
                rows: u16::from_be_bytes([payload[0], payload[1]]),
                cols: u16::from_be_bytes([payload[2], payload[3]]),
            },
            TYPE_EXIT => Frame::Exit,
            _ => Frame::Unknown,
        }
    }
}

/// Read one frame. Errors mean the connection is unusable (EOF mid-frame,
/// oversized length, I/O failure) and the caller should drop it.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Frame::decode(header[0], payload))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()).await
}

// ── Unit tests ──────────────────────────────────────────────────────
