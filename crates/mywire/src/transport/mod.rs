//! Packet framing over a raw byte stream.
//!
//! Every logical message travels as one or more frames: a 3-byte LE payload
//! length plus a 1-byte sequence number, then the payload. Messages longer
//! than the maximum block size are split across consecutive frames and the
//! receiver reassembles until it sees a frame shorter than the block size.
//! Sequence numbers must increase by exactly one per frame and reset at each
//! command boundary.

#![allow(clippy::cast_possible_truncation)]

pub mod compress;
pub mod timed;

pub use compress::{CompressedLayer, MIN_COMPRESS_LENGTH};
pub use timed::{NetStream, TimedStream};

use std::io::{Read, Write};
use std::sync::Arc;

use mywire_core::error::protocol_error;
use mywire_core::Result;

use crate::buffer::BufferPool;
use crate::protocol::MAX_BLOCK_SIZE;

/// Frame header: 3-byte LE payload length plus sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub sequence: u8,
}

impl FrameHeader {
    pub const SIZE: usize = 4;

    pub fn decode(bytes: [u8; 4]) -> Self {
        Self {
            length: u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16),
            sequence: bytes[3],
        }
    }

    pub fn encode(self) -> [u8; 4] {
        [
            (self.length & 0xFF) as u8,
            ((self.length >> 8) & 0xFF) as u8,
            ((self.length >> 16) & 0xFF) as u8,
            self.sequence,
        ]
    }
}

/// The byte stream frames travel over: plain, or wrapped in the compressed
/// envelope after the handshake negotiates compression.
pub enum PacketStream {
    Plain(TimedStream),
    Compressed(CompressedLayer),
    /// Transient placeholder while layers are being swapped; never does I/O.
    Detached,
}

impl PacketStream {
    fn timed_mut(&mut self) -> Option<&mut TimedStream> {
        match self {
            PacketStream::Plain(s) => Some(s),
            PacketStream::Compressed(c) => Some(c.timed_mut()),
            PacketStream::Detached => None,
        }
    }
}

fn detached_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "transport detached")
}

impl Read for PacketStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PacketStream::Plain(s) => s.read(buf),
            PacketStream::Compressed(c) => c.read(buf),
            PacketStream::Detached => Err(detached_error()),
        }
    }
}

impl Write for PacketStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            PacketStream::Plain(s) => s.write(buf),
            PacketStream::Compressed(c) => c.write(buf),
            PacketStream::Detached => Err(detached_error()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            PacketStream::Plain(s) => s.flush(),
            PacketStream::Compressed(c) => c.flush(),
            PacketStream::Detached => Err(detached_error()),
        }
    }
}

/// Framed view of the connection: splits outgoing logical messages into
/// frames, reassembles incoming ones, and polices the sequence counter.
pub struct FramedTransport {
    stream: PacketStream,
    sequence: u8,
    max_block_size: usize,
}

impl FramedTransport {
    /// Frame a plain TCP stream.
    pub fn new(stream: TimedStream) -> Self {
        Self {
            stream: PacketStream::Plain(stream),
            sequence: 0,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }

    /// Re-frame an upgraded stream, continuing at the given sequence number
    /// (the TLS upgrade keeps its own counter, independent of the plaintext
    /// stream's).
    pub fn resume(stream: TimedStream, sequence: u8) -> Self {
        Self {
            stream: PacketStream::Plain(stream),
            sequence,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }

    /// Switch the underlying byte stream to the compressed envelope.
    /// Called once, after authentication succeeds with compression agreed.
    pub fn enable_compression(&mut self, pool: Arc<BufferPool>) {
        match std::mem::replace(&mut self.stream, PacketStream::Detached) {
            PacketStream::Plain(timed) => {
                self.stream = PacketStream::Compressed(CompressedLayer::new(timed, pool));
            }
            other => self.stream = other,
        }
    }

    /// Lower the frame split threshold (the server's max packet size caps it).
    pub fn set_max_block_size(&mut self, size: usize) {
        self.max_block_size = size.clamp(1, MAX_BLOCK_SIZE);
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Reset the sequence counter at a command boundary.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        if let PacketStream::Compressed(c) = &mut self.stream {
            c.reset_sequence();
        }
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// Arm (or disarm with 0) the shared I/O deadline.
    pub fn reset_timeout(&mut self, timeout_ms: u64) {
        if let Some(timed) = self.stream.timed_mut() {
            timed.reset_timeout(timeout_ms);
        }
    }

    /// Shut down the underlying socket.
    pub fn close(&mut self) {
        if let Some(timed) = self.stream.timed_mut() {
            timed.close();
        }
    }

    /// Unwrap the timed stream for the TLS upgrade. The upgrade happens
    /// before compression is negotiated, so the plain layer is the only
    /// live case.
    pub fn into_stream(self) -> Option<TimedStream> {
        match self.stream {
            PacketStream::Plain(s) => Some(s),
            PacketStream::Compressed(c) => Some(c.into_timed()),
            PacketStream::Detached => None,
        }
    }

    /// Send one logical message, splitting at the block size and appending
    /// the empty terminator frame for exact multiples.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 0;
        loop {
            let chunk = (payload.len() - offset).min(self.max_block_size);
            self.write_frame(&payload[offset..offset + chunk])?;
            offset += chunk;
            if offset >= payload.len() {
                // An exact-multiple message needs an empty frame so the
                // receiver knows it ended.
                if chunk == self.max_block_size {
                    self.write_frame(&[])?;
                }
                break;
            }
        }
        self.stream.flush().map_err(mywire_core::Error::from)?;
        Ok(())
    }

    /// Send one frame verbatim, without splitting. Used when streaming local
    /// file contents, where the terminating empty frame is explicit.
    pub fn send_raw_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(payload)?;
        self.stream.flush().map_err(mywire_core::Error::from)?;
        Ok(())
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let header = FrameHeader {
            length: payload.len() as u32,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.stream
            .write_all(&header.encode())
            .map_err(mywire_core::Error::from)?;
        self.stream
            .write_all(payload)
            .map_err(mywire_core::Error::from)?;
        Ok(())
    }

    /// Receive one logical message, reassembling split frames.
    pub fn receive_message(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let frame_len = self.read_frame_into(&mut payload)?;
            if frame_len < self.max_block_size {
                break;
            }
        }
        Ok(payload)
    }

    fn read_frame_into(&mut self, payload: &mut Vec<u8>) -> Result<usize> {
        let mut raw = [0u8; FrameHeader::SIZE];
        self.stream
            .read_exact(&mut raw)
            .map_err(mywire_core::Error::from)?;
        let header = FrameHeader::decode(raw);
        if header.sequence != self.sequence {
            return Err(protocol_error(format!(
                "frames out of order: expected sequence {}, got {}",
                self.sequence, header.sequence
            )));
        }
        self.sequence = header.sequence.wrapping_add(1);

        let len = header.length as usize;
        if len > 0 {
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .map_err(mywire_core::Error::from)?;
        }
        Ok(len)
    }
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("sequence", &self.sequence)
            .field("max_block_size", &self.max_block_size)
            .field(
                "compressed",
                &matches!(self.stream, PacketStream::Compressed(_)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn transport_pair() -> (FramedTransport, FramedTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            FramedTransport::new(TimedStream::new(NetStream::Tcp(client))),
            FramedTransport::new(TimedStream::new(NetStream::Tcp(server))),
        )
    }

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader {
            length: 0x12_3456,
            sequence: 7,
        };
        assert_eq!(FrameHeader::decode(header.encode()), header);
    }

    #[test]
    fn single_frame_roundtrip() {
        let (mut tx, mut rx) = transport_pair();
        tx.send_message(b"SELECT 1").unwrap();
        assert_eq!(rx.receive_message().unwrap(), b"SELECT 1");
        assert_eq!(rx.sequence(), 1);
    }

    #[test]
    fn empty_message_roundtrip() {
        let (mut tx, mut rx) = transport_pair();
        tx.send_message(b"").unwrap();
        assert_eq!(rx.receive_message().unwrap(), b"");
    }

    #[test]
    fn split_and_reassemble_exact_multiple_plus_one() {
        let (mut tx, mut rx) = transport_pair();
        tx.set_max_block_size(1024);
        rx.set_max_block_size(1024);

        let payload: Vec<u8> = (0..1025u32).map(|i| (i % 251) as u8).collect();
        let send = std::thread::spawn(move || {
            tx.send_message(&payload).unwrap();
            payload
        });
        let got = rx.receive_message().unwrap();
        let sent = send.join().unwrap();
        assert_eq!(got.len(), 1025);
        assert_eq!(got, sent);
        assert_eq!(rx.sequence(), 2, "two frames consumed");
    }

    #[test]
    fn exact_multiple_emits_empty_terminator() {
        let (mut tx, mut rx) = transport_pair();
        tx.set_max_block_size(512);
        rx.set_max_block_size(512);

        let payload = vec![0xAB; 1024];
        let send = std::thread::spawn(move || tx.send_message(&payload).unwrap());
        let got = rx.receive_message().unwrap();
        send.join().unwrap();
        assert_eq!(got.len(), 1024);
        assert_eq!(rx.sequence(), 3, "two full frames plus the empty one");
    }

    #[test]
    fn out_of_order_sequence_is_protocol_error() {
        let (mut tx, mut rx) = transport_pair();
        tx.set_sequence(5);
        tx.send_message(b"x").unwrap();
        let err = rx.receive_message().unwrap_err();
        assert!(matches!(err, mywire_core::Error::Protocol(_)));
    }

    #[test]
    fn compressed_transport_roundtrip() {
        let (mut tx, mut rx) = transport_pair();
        let pool = Arc::new(BufferPool::new());
        tx.enable_compression(pool.clone());
        rx.enable_compression(pool);

        let payload = vec![b'z'; 10_000];
        tx.send_message(&payload).unwrap();
        assert_eq!(rx.receive_message().unwrap(), payload);

        tx.reset_sequence();
        rx.reset_sequence();
        tx.send_message(b"ping").unwrap();
        assert_eq!(rx.receive_message().unwrap(), b"ping");
    }
}
