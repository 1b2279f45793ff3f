//! The cross-process/cross-thread command channel (spec §4.7).
//!
//! Frames travel over a connected stream socket (a [`SocketPair`] half) in
//! a fixed little-endian header followed by a type-specific payload. The
//! same channel is used two ways: (1) a supervisor and its worker
//! processes exchange `Exit`/`Heartbeat`/`Respawn` frames across the
//! process boundary, and (2) any thread wakes a [`Loop`](crate::loop_::Loop)
//! by writing an (empty-payload) `Task` frame to it — the real task
//! closures travel through the loop's in-memory task queue; the frame is
//! only the wakeup signal (spec §4.6).

use std::io::{self, Read, Write};

use crate::PROTOCOL_VERSION;

const HEADER_LEN: usize = 12;
const RESPONSE_BIT: u16 = 0x8000;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum FrameKind {
    Exit = 1,
    ExitResp = 1 | RESPONSE_BIT,
    Heartbeat = 2,
    HeartbeatResp = 2 | RESPONSE_BIT,
    Task = 3,
    Respawn = 4,
    Version = 5,
}

impl FrameKind {
    pub fn raw(self) -> u16 {
        self as u16
    }

    pub fn from_raw(raw: u16) -> Option<FrameKind> {
        match raw {
            1 => Some(FrameKind::Exit),
            x if x == (1 | RESPONSE_BIT) => Some(FrameKind::ExitResp),
            2 => Some(FrameKind::Heartbeat),
            x if x == (2 | RESPONSE_BIT) => Some(FrameKind::HeartbeatResp),
            3 => Some(FrameKind::Task),
            4 => Some(FrameKind::Respawn),
            5 => Some(FrameKind::Version),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        self.raw() & RESPONSE_BIT != 0
    }
}

/// `{size: u32, kind: u16, version: u16, sn: u32}` (spec §4.7/§6).
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub sn: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, sn: u32, payload: Vec<u8>) -> Frame {
        Frame { kind, sn, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = (HEADER_LEN + self.payload.len()) as u32;
        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.kind.raw().to_le_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.sn.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Accumulates bytes read off the wire and dispatches whole frames, so a
/// partial `recv` never gets mistaken for a full frame (spec §4.7:
/// "the receiver accumulates into a reassembly buffer and dispatches
/// whole frames").
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop one complete frame if the buffer holds one, in FIFO order.
    pub fn pop_frame(&mut self) -> io::Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = u32::from_le_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if size < HEADER_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame size underflow"));
        }
        if self.buf.len() < size {
            return Ok(None);
        }
        let kind_raw = u16::from_le_bytes(self.buf[4..6].try_into().unwrap());
        let _version = u16::from_le_bytes(self.buf[6..8].try_into().unwrap());
        let sn = u32::from_le_bytes(self.buf[8..12].try_into().unwrap());
        let payload = self.buf[HEADER_LEN..size].to_vec();
        self.buf.drain(..size);

        let kind = FrameKind::from_raw(kind_raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown frame kind"))?;
        Ok(Some(Frame { kind, sn, payload }))
    }
}

/// Writes a frame atomically: a single `send` of `frame.size` bytes, on
/// the assumption frames stay far smaller than the socket's send buffer
/// (spec §4.7).
pub fn send_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let bytes = frame.encode();
    writer.write_all(&bytes)
}

pub fn read_into<R: Read>(reader: &mut R, reassembler: &mut Reassembler) -> io::Result<usize> {
    let mut buf = [0u8; 4096];
    let n = reader.read(&mut buf)?;
    reassembler.feed(&buf[..n]);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let frame = Frame::new(FrameKind::Heartbeat, 42, vec![1, 2, 3]);
        let bytes = frame.encode();

        let mut asm = Reassembler::new();
        asm.feed(&bytes);
        let parsed = asm.pop_frame().unwrap().unwrap();
        assert_eq!(parsed.kind, FrameKind::Heartbeat);
        assert_eq!(parsed.sn, 42);
        assert_eq!(parsed.payload, vec![1, 2, 3]);
        assert!(asm.pop_frame().unwrap().is_none());
    }

    #[test]
    fn handles_partial_then_multiple_frames() {
        let f1 = Frame::new(FrameKind::Exit, 1, vec![]);
        let f2 = Frame::new(FrameKind::Task, 2, vec![9; 10]);
        let mut bytes = f1.encode();
        bytes.extend(f2.encode());

        let mut asm = Reassembler::new();
        // Feed byte-by-byte to exercise the partial-frame path.
        for b in &bytes {
            asm.feed(&[*b]);
        }
        let got1 = asm.pop_frame().unwrap().unwrap();
        let got2 = asm.pop_frame().unwrap().unwrap();
        assert_eq!(got1.kind, FrameKind::Exit);
        assert_eq!(got2.kind, FrameKind::Task);
        assert_eq!(got2.payload.len(), 10);
    }

    #[test]
    fn response_bit_distinguishes_request_from_response() {
        assert!(!FrameKind::Heartbeat.is_response());
        assert!(FrameKind::HeartbeatResp.is_response());
        assert!(!FrameKind::Exit.is_response());
        assert!(FrameKind::ExitResp.is_response());
    }
}
