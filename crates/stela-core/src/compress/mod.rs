//! Streaming compression for the transfer pipeline.
//!
//! All codecs are chunked: a fixed window of input is read, transformed
//! and handed out, so memory never scales with file size. Snappy uses the
//! crate's own framing; LZF uses the `ZV` chunk framing that older
//! deployments wrote; `none` passes bytes through untouched.

pub mod lzf;

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{Result, StelaError};

/// Input window per compressed chunk. Chunk lengths are carried in u16
/// fields, so this is also the hard ceiling.
const LZF_CHUNK_SIZE: usize = 64 * 1024 - 1;

/// LZF chunk magic, followed by a type byte (0 = raw, 1 = compressed).
const LZF_MAGIC: [u8; 2] = *b"ZV";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Snappy,
    Lzf,
    None,
}

impl Codec {
    pub fn from_config(name: &str) -> Result<Self> {
        match name {
            "snappy" => Ok(Codec::Snappy),
            "lzf" => Ok(Codec::Lzf),
            "none" => Ok(Codec::None),
            other => Err(StelaError::Config(format!(
                "unknown compression codec: '{other}'"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Snappy => "snappy",
            Codec::Lzf => "lzf",
            Codec::None => "none",
        }
    }
}

/// Wrap a reader so its output is compressed with `codec`.
pub fn compress_stream<'a>(
    codec: Codec,
    inner: Box<dyn Read + Send + 'a>,
) -> Box<dyn Read + Send + 'a> {
    match codec {
        Codec::Snappy => Box::new(snap::read::FrameEncoder::new(inner)),
        Codec::Lzf => Box::new(LzfEncoder::new(inner)),
        Codec::None => inner,
    }
}

/// Wrap a reader holding `codec`-compressed data so its output is plain.
///
/// Corruption surfaces as `io::ErrorKind::InvalidData`; map it with
/// [`classify_stream_error`] at the consumer.
pub fn decompress_stream<'a>(
    codec: Codec,
    inner: Box<dyn Read + Send + 'a>,
) -> Box<dyn Read + Send + 'a> {
    match codec {
        Codec::Snappy => Box::new(snap::read::FrameDecoder::new(inner)),
        Codec::Lzf => Box::new(LzfDecoder::new(inner)),
        Codec::None => inner,
    }
}

/// Split decode failures into "the bytes are bad" versus "the read failed".
pub fn classify_stream_error(e: io::Error) -> StelaError {
    if e.kind() == io::ErrorKind::InvalidData {
        StelaError::CorruptCompressed(e.to_string())
    } else {
        StelaError::LocalIo(e)
    }
}

// ---------------------------------------------------------------------------
// Byte accounting adapters
// ---------------------------------------------------------------------------

/// Shared byte counter a [`CountingReader`] feeds.
#[derive(Debug, Default, Clone)]
pub struct ByteCount(Arc<AtomicU64>);

impl ByteCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counts bytes as they pass through, for size accounting on both sides
/// of a codec.
pub struct CountingReader<R> {
    inner: R,
    count: ByteCount,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: ByteCount) -> Self {
        Self { inner, count }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.0.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Shared digest slot a [`HashingReader`] fills at EOF.
#[derive(Debug, Default, Clone)]
pub struct DigestSlot(Arc<std::sync::Mutex<Option<String>>>);

impl DigestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex digest, available once the wrapped stream hit EOF.
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Computes a SHA-256 over everything read, publishing the hex digest when
/// the stream ends.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    slot: DigestSlot,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, slot: DigestSlot) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            slot,
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            let digest = self.hasher.clone().finalize();
            let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
            *self.slot.0.lock().unwrap() = Some(hex);
        } else {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// LZF chunk framing
// ---------------------------------------------------------------------------

struct LzfEncoder<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> LzfEncoder<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.pos = 0;
        let mut window = vec![0u8; LZF_CHUNK_SIZE];
        let mut filled = 0;
        while filled < window.len() {
            let n = self.inner.read(&mut window[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            self.eof = true;
            return Ok(());
        }
        window.truncate(filled);
        self.buf.extend_from_slice(&LZF_MAGIC);
        match lzf::compress_block(&window) {
            Some(packed) => {
                self.buf.push(1);
                self.buf.extend_from_slice(&(packed.len() as u16).to_be_bytes());
                self.buf.extend_from_slice(&(window.len() as u16).to_be_bytes());
                self.buf.extend_from_slice(&packed);
            }
            None => {
                self.buf.push(0);
                self.buf.extend_from_slice(&(window.len() as u16).to_be_bytes());
                self.buf.extend_from_slice(&window);
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for LzfEncoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            if self.eof {
                return Ok(0);
            }
            self.refill()?;
            if self.buf.is_empty() {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.buf.len() - self.pos);
        buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct LzfDecoder<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> LzfDecoder<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn corrupt(msg: impl Into<String>) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg.into())
    }

    /// Read exactly `n` bytes, or return `Ok(None)` on clean EOF at the
    /// first byte. EOF in the middle of a header or payload is corruption.
    fn read_exact_or_eof(&mut self, n: usize, at_boundary: bool) -> io::Result<Option<Vec<u8>>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.inner.read(&mut out[filled..])?;
            if read == 0 {
                if filled == 0 && at_boundary {
                    return Ok(None);
                }
                return Err(Self::corrupt("truncated lzf chunk"));
            }
            filled += read;
        }
        Ok(Some(out))
    }

    fn refill(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.pos = 0;
        let header = match self.read_exact_or_eof(3, true)? {
            Some(h) => h,
            None => {
                self.eof = true;
                return Ok(());
            }
        };
        if header[0..2] != LZF_MAGIC {
            return Err(Self::corrupt("bad lzf chunk magic"));
        }
        match header[2] {
            0 => {
                let len_bytes = self
                    .read_exact_or_eof(2, false)?
                    .expect("checked mid-chunk");
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                let payload = self.read_exact_or_eof(len, false)?.expect("checked");
                self.buf = payload;
            }
            1 => {
                let lens = self
                    .read_exact_or_eof(4, false)?
                    .expect("checked mid-chunk");
                let packed_len = u16::from_be_bytes([lens[0], lens[1]]) as usize;
                let plain_len = u16::from_be_bytes([lens[2], lens[3]]) as usize;
                let payload = self.read_exact_or_eof(packed_len, false)?.expect("checked");
                self.buf = lzf::decompress_block(&payload, plain_len)
                    .map_err(|e| Self::corrupt(e.to_string()))?;
            }
            other => {
                return Err(Self::corrupt(format!("bad lzf chunk type {other}")));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for LzfDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            if self.eof {
                return Ok(0);
            }
            self.refill()?;
            if self.buf.is_empty() && self.eof {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.buf.len() - self.pos);
        buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
