//! Wire framing and the peer handshake
//!
//! ```text
//!   ┌──────────────┬────────────┬──────────┬──────────┬─────────────────┐
//!   │ source:u32   │ dest:u32   │ size:u32 │ tag:u32  │ payload[size]   │
//!   └──────────────┴────────────┴──────────┴──────────┴─────────────────┘
//!     big-endian local ids; the node part of each id is implied by the
//!     connection the frame travels on
//! ```
//!
//! A freshly established node-to-node connection starts with a handshake:
//!
//! ```text
//!   acceptor  ── WELCOME ──────────────────────▶ connector
//!   connector ── WELCOME, listen_port:u16 ─────▶ acceptor
//! ```
//!
//! The acceptor sniffs its first inbound bytes: a matching WELCOME marks a
//! peer node, anything else is a console client typing at a prompt. The
//! WELCOME text doubles as the console banner.

use crate::error::{WireError, WireResult};
use crate::payload::{get_u16, get_u32, put_u16, put_u32};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 16;

/// Largest payload a frame may announce
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Handshake greeting, also shown to console clients
pub const WELCOME: &[u8] = b"Welcome to the nodelink debug console. Enter commands below:\n\n> ";

/// Length of the connector's hello: greeting plus listen port
pub const HELLO_LEN: usize = WELCOME.len() + 2;

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: u32,
    pub dest: u32,
    pub size: u32,
    pub tag: u32,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.source);
        put_u32(buf, self.dest);
        put_u32(buf, self.size);
        put_u32(buf, self.tag);
    }

    pub fn decode(mut input: &[u8]) -> WireResult<Self> {
        let header = FrameHeader {
            source: get_u32(&mut input)?,
            dest: get_u32(&mut input)?,
            size: get_u32(&mut input)?,
            tag: get_u32(&mut input)?,
        };
        if header.size as usize > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(header.size));
        }
        Ok(header)
    }
}

/// One reassembled frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: u32,
    pub dest: u32,
    pub tag: u32,
    pub data: Vec<u8>,
}

/// Append a frame to `buf`
pub fn encode_frame(buf: &mut Vec<u8>, source: u32, dest: u32, tag: u32, data: &[u8]) {
    buf.reserve(HEADER_LEN + data.len());
    FrameHeader { source, dest, size: data.len() as u32, tag }.encode(buf);
    buf.extend_from_slice(data);
}

/// Extract every complete frame at the front of `buf`
///
/// Returns the frames and the number of bytes they occupied. A partial
/// trailing frame is left unconsumed for the next call.
pub fn parse_frames(buf: &[u8]) -> WireResult<(Vec<Frame>, usize)> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while buf.len() - pos >= HEADER_LEN {
        let header = FrameHeader::decode(&buf[pos..pos + HEADER_LEN])?;
        let end = pos + HEADER_LEN + header.size as usize;
        if end > buf.len() {
            break;
        }
        frames.push(Frame {
            source: header.source,
            dest: header.dest,
            tag: header.tag,
            data: buf[pos + HEADER_LEN..end].to_vec(),
        });
        pos = end;
    }
    Ok((frames, pos))
}

/// Write the connector's hello
pub fn encode_hello(buf: &mut Vec<u8>, listen_port: u16) {
    buf.extend_from_slice(WELCOME);
    put_u16(buf, listen_port);
}

/// Outcome of inspecting the first bytes of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// Not enough bytes to decide yet
    NeedMore,
    /// The other side is a node; `consumed` handshake bytes can be dropped
    Peer { listen_port: Option<u16>, consumed: usize },
    /// The other side is not a node
    Console,
}

/// Inspect the start of a connection's receive buffer
///
/// With `with_port` set the greeting must be followed by the sender's
/// listen port, as sent by a connecting node.
pub fn sniff(buf: &[u8], with_port: bool) -> Sniff {
    let n = buf.len().min(WELCOME.len());
    if buf[..n] != WELCOME[..n] {
        return Sniff::Console;
    }
    if buf.len() < WELCOME.len() {
        return Sniff::NeedMore;
    }
    if !with_port {
        return Sniff::Peer { listen_port: None, consumed: WELCOME.len() };
    }
    let mut rest = &buf[WELCOME.len()..];
    match get_u16(&mut rest) {
        Ok(port) => Sniff::Peer { listen_port: Some(port), consumed: HELLO_LEN },
        Err(_) => Sniff::NeedMore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<u8>, Frame) {
        let frame = Frame { source: 7, dest: 3, tag: 1001, data: b"PING".to_vec() };
        let mut buf = Vec::new();
        encode_frame(&mut buf, frame.source, frame.dest, frame.tag, &frame.data);
        (buf, frame)
    }

    #[test]
    fn test_header_layout() {
        let (buf, _) = sample();
        assert_eq!(buf.len(), HEADER_LEN + 4);
        assert_eq!(&buf[..16], &[0, 0, 0, 7, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0x03, 0xe9]);
    }

    #[test]
    fn test_parse_chunked() {
        let (buf, frame) = sample();
        // Every split point: the first part never yields the frame unless it
        // holds all of it, and the reassembled buffer always yields exactly one.
        for split in 0..=buf.len() {
            let mut acc: Vec<u8> = Vec::new();
            let mut out = Vec::new();
            for chunk in [&buf[..split], &buf[split..]] {
                acc.extend_from_slice(chunk);
                let (frames, used) = parse_frames(&acc).unwrap();
                acc.drain(..used);
                out.extend(frames);
            }
            assert_eq!(out, vec![frame.clone()], "split at {split}");
            assert!(acc.is_empty());
        }
    }

    #[test]
    fn test_parse_byte_at_a_time_with_trailer() {
        let (mut buf, frame) = sample();
        let second_start = buf.len();
        encode_frame(&mut buf, 1, 2, 3, &[9; 40]);
        let mut acc = Vec::new();
        let mut out = Vec::new();
        for b in &buf[..second_start + 5] {
            acc.push(*b);
            let (frames, used) = parse_frames(&acc).unwrap();
            acc.drain(..used);
            out.extend(frames);
        }
        assert_eq!(out, vec![frame]);
        assert_eq!(acc.len(), 5);
    }

    /// Feed `buf` in chunks whose sizes cycle through `pattern`
    fn reassemble(buf: &[u8], pattern: &[usize]) -> (Vec<Frame>, usize) {
        let mut acc = Vec::new();
        let mut out = Vec::new();
        let mut reads = 0;
        let mut pos = 0;
        for size in pattern.iter().cycle() {
            if pos == buf.len() {
                break;
            }
            let end = (pos + size).min(buf.len());
            acc.extend_from_slice(&buf[pos..end]);
            pos = end;
            reads += 1;
            let (frames, used) = parse_frames(&acc).unwrap();
            acc.drain(..used);
            out.extend(frames);
        }
        assert!(acc.is_empty(), "{} bytes left over", acc.len());
        (out, reads)
    }

    #[test]
    fn test_parse_many_frames_across_uneven_reads() {
        let frames: Vec<Frame> = [0usize, 1, 17, 300, 5, 64]
            .iter()
            .enumerate()
            .map(|(i, &len)| Frame {
                source: i as u32 + 1,
                dest: 100 + i as u32,
                tag: 1000 + i as u32,
                data: (0..len).map(|b| (b * 7 + i) as u8).collect(),
            })
            .collect();
        let mut buf = Vec::new();
        for f in &frames {
            encode_frame(&mut buf, f.source, f.dest, f.tag, &f.data);
        }

        // The first header alone spans four reads under [1, 3, 5, 7]
        for pattern in [&[1, 3, 5, 7][..], &[5][..], &[2, 11][..], &[HEADER_LEN][..], &[13, 1, 1, 29][..]] {
            let (out, _) = reassemble(&buf, pattern);
            assert_eq!(out, frames, "pattern {pattern:?}");
        }
        let (_, reads) = reassemble(&buf[..HEADER_LEN], &[1, 3, 5, 7]);
        assert_eq!(reads, 4);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        FrameHeader { source: 1, dest: 2, size: (MAX_FRAME_SIZE + 1) as u32, tag: 5 }.encode(&mut buf);
        assert!(matches!(parse_frames(&buf), Err(WireError::FrameTooLarge(_))));
    }

    #[test]
    fn test_sniff_peer_hello() {
        let mut hello = Vec::new();
        encode_hello(&mut hello, 9001);
        assert_eq!(sniff(&hello[..10], true), Sniff::NeedMore);
        assert_eq!(sniff(&hello[..WELCOME.len() + 1], true), Sniff::NeedMore);
        assert_eq!(
            sniff(&hello, true),
            Sniff::Peer { listen_port: Some(9001), consumed: HELLO_LEN }
        );
        assert_eq!(
            sniff(&hello, false),
            Sniff::Peer { listen_port: None, consumed: WELCOME.len() }
        );
    }

    #[test]
    fn test_sniff_console() {
        assert_eq!(sniff(b"", true), Sniff::NeedMore);
        assert_eq!(sniff(b"help\r\n", true), Sniff::Console);
        assert_eq!(sniff(b"Welcome to the jungle", true), Sniff::Console);
    }
}
