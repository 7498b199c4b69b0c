//! Compressed protocol envelope.
//!
//! When compression is negotiated, every chunk of the plain packet stream is
//! wrapped in a compressed frame with its own 7-byte header:
//!
//! - 3 bytes LE: length of the payload as it appears on the wire
//! - 1 byte: compressed-stream sequence number
//! - 3 bytes LE: uncompressed length, or 0 when the payload is stored as-is
//!
//! Payloads below [`MIN_COMPRESS_LENGTH`] — or payloads zlib fails to shrink —
//! are stored rather than deflated, signalled by the zero uncompressed-length
//! field. One compressed frame is fully consumed before the next header is
//! read.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::buffer::BufferPool;
use crate::transport::timed::TimedStream;

/// Payloads smaller than this are never worth deflating. Heuristic floor
/// carried over from the reference client; tune with care.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// The compressed-envelope codec over the timed stream.
pub struct CompressedLayer {
    stream: TimedStream,
    /// Inflated bytes not yet handed to the reader.
    pending: Vec<u8>,
    pending_pos: usize,
    /// Plain bytes accumulated until the next flush.
    outgoing: Vec<u8>,
    seq: u8,
    pool: Arc<BufferPool>,
}

impl CompressedLayer {
    pub fn new(stream: TimedStream, pool: Arc<BufferPool>) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            pending_pos: 0,
            outgoing: Vec::new(),
            seq: 0,
            pool,
        }
    }

    /// Reset the compressed-stream sequence counter (done per command,
    /// alongside the logical counter).
    pub fn reset_sequence(&mut self) {
        self.seq = 0;
    }

    pub fn timed(&self) -> &TimedStream {
        &self.stream
    }

    pub fn timed_mut(&mut self) -> &mut TimedStream {
        &mut self.stream
    }

    /// Unwrap the timed stream, discarding any buffered frame state.
    pub fn into_timed(self) -> TimedStream {
        self.stream
    }

    /// Read and inflate the next compressed frame into `pending`.
    fn fill(&mut self) -> io::Result<()> {
        let mut header = [0u8; 7];
        self.stream.read_exact(&mut header)?;
        let wire_len = usize::from(header[0])
            | (usize::from(header[1]) << 8)
            | (usize::from(header[2]) << 16);
        self.seq = header[3].wrapping_add(1);
        let plain_len = usize::from(header[4])
            | (usize::from(header[5]) << 8)
            | (usize::from(header[6]) << 16);

        let mut wire = self.pool.checkout(wire_len);
        wire.resize(wire_len, 0);
        self.stream.read_exact(&mut wire)?;

        self.pending.clear();
        self.pending_pos = 0;
        if plain_len == 0 {
            // Stored frame: the payload is the plain bytes.
            self.pending.extend_from_slice(&wire);
        } else {
            self.pending.reserve(plain_len);
            let mut decoder = ZlibDecoder::new(&wire[..]);
            decoder.read_to_end(&mut self.pending).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("inflate failed: {e}"))
            })?;
            if self.pending.len() != plain_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "inflated {} bytes, header promised {}",
                        self.pending.len(),
                        plain_len
                    ),
                ));
            }
        }
        self.pool.give_back(wire);
        Ok(())
    }

    /// Deflate-or-store the buffered outgoing bytes as one compressed frame.
    fn flush_outgoing(&mut self) -> io::Result<()> {
        if self.outgoing.is_empty() {
            return Ok(());
        }
        let plain = std::mem::take(&mut self.outgoing);

        let mut stored = true;
        let mut body = Vec::new();
        if plain.len() >= MIN_COMPRESS_LENGTH {
            let scratch = self.pool.checkout(plain.len());
            let mut encoder = ZlibEncoder::new(scratch, Compression::default());
            encoder.write_all(&plain)?;
            let deflated = encoder.finish()?;
            if deflated.len() < plain.len() {
                stored = false;
                body = deflated;
            } else {
                self.pool.give_back(deflated);
            }
        }
        let plain_len_field = if stored { 0 } else { plain.len() };
        let wire: &[u8] = if stored { &plain } else { &body };

        let mut header = [0u8; 7];
        header[0] = (wire.len() & 0xFF) as u8;
        header[1] = ((wire.len() >> 8) & 0xFF) as u8;
        header[2] = ((wire.len() >> 16) & 0xFF) as u8;
        header[3] = self.seq;
        header[4] = (plain_len_field & 0xFF) as u8;
        header[5] = ((plain_len_field >> 8) & 0xFF) as u8;
        header[6] = ((plain_len_field >> 16) & 0xFF) as u8;
        self.seq = self.seq.wrapping_add(1);

        self.stream.write_all(&header)?;
        self.stream.write_all(wire)?;
        self.stream.flush()?;
        if !stored {
            self.pool.give_back(body);
        }
        Ok(())
    }
}

impl Read for CompressedLayer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_pos >= self.pending.len() {
            self.fill()?;
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }
}

impl Write for CompressedLayer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_outgoing()
    }
}

impl std::fmt::Debug for CompressedLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedLayer")
            .field("seq", &self.seq)
            .field("pending", &(self.pending.len() - self.pending_pos))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::timed::NetStream;
    use std::net::{TcpListener, TcpStream};

    fn layer_pair() -> (CompressedLayer, CompressedLayer) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let pool = Arc::new(BufferPool::new());
        (
            CompressedLayer::new(TimedStream::new(NetStream::Tcp(client)), pool.clone()),
            CompressedLayer::new(TimedStream::new(NetStream::Tcp(server)), pool),
        )
    }

    #[test]
    fn small_payload_is_stored() {
        let (mut tx, mut rx) = layer_pair();
        tx.write_all(b"tiny").unwrap();
        tx.flush().unwrap();

        // Inspect the raw frame from the peer side before decoding.
        let mut header = [0u8; 7];
        rx.timed_mut().read_exact(&mut header).unwrap();
        let wire_len = usize::from(header[0]);
        let plain_len = usize::from(header[4]);
        assert_eq!(plain_len, 0, "sub-threshold payloads are stored");
        assert_eq!(wire_len, 4);
        let mut body = vec![0u8; wire_len];
        rx.timed_mut().read_exact(&mut body).unwrap();
        assert_eq!(&body, b"tiny");
    }

    #[test]
    fn compressible_payload_roundtrips_deflated() {
        let (mut tx, mut rx) = layer_pair();
        let payload = vec![b'a'; 4096];
        tx.write_all(&payload).unwrap();
        tx.flush().unwrap();

        let mut back = vec![0u8; payload.len()];
        rx.read_exact(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn incompressible_payload_falls_back_to_stored() {
        let (mut tx, mut rx) = layer_pair();
        // Pseudo-random bytes do not shrink under zlib.
        let mut payload = Vec::with_capacity(600);
        let mut x: u32 = 0x1234_5678;
        for _ in 0..600 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            payload.push((x >> 24) as u8);
        }
        tx.write_all(&payload).unwrap();
        tx.flush().unwrap();

        let mut header = [0u8; 7];
        rx.timed_mut().read_exact(&mut header).unwrap();
        let wire_len = usize::from(header[0]) | (usize::from(header[1]) << 8);
        let plain_len =
            usize::from(header[4]) | (usize::from(header[5]) << 8) | (usize::from(header[6]) << 16);
        assert_eq!(plain_len, 0, "incompressible payloads are stored");
        let mut body = vec![0u8; wire_len];
        rx.timed_mut().read_exact(&mut body).unwrap();
        assert_eq!(body, payload);
    }

    #[test]
    fn sequence_counter_advances_per_frame() {
        let (mut tx, mut rx) = layer_pair();
        tx.write_all(b"one").unwrap();
        tx.flush().unwrap();
        tx.write_all(b"two").unwrap();
        tx.flush().unwrap();

        let mut buf = [0u8; 3];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"one");
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"two");
        assert_eq!(rx.seq, 2);
    }
}
