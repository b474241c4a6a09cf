//! Content-defined chunking with a Rabin fingerprint over a sliding window.
//!
//! Boundaries depend only on the bytes near them, so an insertion early in a
//! stream shifts at most a couple of chunks and the rest deduplicate.

use std::sync::OnceLock;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TransferError;

/// Irreducible polynomial of degree 53 used for fingerprinting.
pub const POLYNOMIAL: u64 = 0x3DA3358B4DC173;

/// Smallest chunk, except for the last one of a stream.
pub const MIN_SIZE: usize = 512 * 1024;

/// Largest chunk.
pub const MAX_SIZE: usize = 8 * 1024 * 1024;

/// Cut when the low 20 bits of the digest are zero (1 MiB average).
const SPLIT_MASK: u64 = (1 << 20) - 1;

const WINDOW_SIZE: usize = 64;
const BUF_SIZE: usize = 512 * 1024;

struct Tables {
    out: [u64; 256],
    modulo: [u64; 256],
}

fn deg(p: u64) -> i32 {
    63 - p.leading_zeros() as i32
}

/// Remainder of polynomial division over GF(2).
fn pol_mod(mut x: u64, d: u64) -> u64 {
    let dd = deg(d);
    while deg(x) >= dd {
        x ^= d << (deg(x) - dd);
    }
    x
}

fn append_byte(hash: u64, b: u8, pol: u64) -> u64 {
    pol_mod((hash << 8) | u64::from(b), pol)
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut t = Tables {
            out: [0; 256],
            modulo: [0; 256],
        };
        // out[b]: contribution of byte b once it has slid out of the window
        for b in 0..256usize {
            let mut h = append_byte(0, b as u8, POLYNOMIAL);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, POLYNOMIAL);
            }
            t.out[b] = h;
        }
        let k = deg(POLYNOMIAL);
        for b in 0..256u64 {
            t.modulo[b as usize] = pol_mod(b << k, POLYNOMIAL) | (b << k);
        }
        t
    })
}

/// Splits an async byte stream into content-defined chunks.
pub struct Chunker<R> {
    rd: R,
    buf: Box<[u8]>,
    bpos: usize,
    bmax: usize,
    closed: bool,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,
    /// Bytes to take without fingerprinting at the start of a chunk.
    pre: usize,
    count: usize,
    data: Vec<u8>,
    tables: &'static Tables,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(rd: R) -> Self {
        let mut c = Self {
            rd,
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            bpos: 0,
            bmax: 0,
            closed: false,
            window: [0; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            pre: 0,
            count: 0,
            data: Vec::new(),
            tables: tables(),
        };
        c.reset();
        c
    }

    fn reset(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        self.count = 0;
        self.slide(1);
        self.pre = MIN_SIZE - WINDOW_SIZE;
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = (self.digest >> (deg(POLYNOMIAL) - 8)) as u8;
        self.digest = (self.digest << 8) | u64::from(b);
        self.digest ^= self.tables.modulo[index as usize];
    }

    /// Reads until the buffer is full or the stream ends.
    async fn fill(&mut self) -> Result<usize, TransferError> {
        let mut n = 0;
        while n < self.buf.len() {
            let read = self
                .rd
                .read(&mut self.buf[n..])
                .await
                .map_err(chunker_error)?;
            if read == 0 {
                break;
            }
            n += read;
        }
        Ok(n)
    }

    fn take_chunk(&mut self) -> Bytes {
        let chunk = Bytes::from(std::mem::replace(
            &mut self.data,
            Vec::with_capacity(MIN_SIZE),
        ));
        self.reset();
        chunk
    }

    /// Returns the next chunk, or `None` once the stream is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        loop {
            if self.bpos >= self.bmax {
                if self.closed {
                    return Ok(None);
                }
                let n = self.fill().await?;
                if n == 0 {
                    self.closed = true;
                    if self.count > 0 {
                        return Ok(Some(self.take_chunk()));
                    }
                    return Ok(None);
                }
                self.bpos = 0;
                self.bmax = n;
            }

            if self.pre > 0 {
                let avail = self.bmax - self.bpos;
                let take = self.pre.min(avail);
                self.data
                    .extend_from_slice(&self.buf[self.bpos..self.bpos + take]);
                self.bpos += take;
                self.count += take;
                self.pre -= take;
                if self.pre > 0 {
                    continue;
                }
            }

            let start = self.bpos;
            let mut i = start;
            while i < self.bmax {
                let b = self.buf[i];
                self.slide(b);
                i += 1;
                let size = self.count + (i - start);
                if size < MIN_SIZE {
                    continue;
                }
                if self.digest & SPLIT_MASK == 0 || size >= MAX_SIZE {
                    self.data.extend_from_slice(&self.buf[start..i]);
                    self.bpos = i;
                    return Ok(Some(self.take_chunk()));
                }
            }

            self.data.extend_from_slice(&self.buf[start..self.bmax]);
            self.count += self.bmax - start;
            self.bpos = self.bmax;
        }
    }
}

fn chunker_error(err: std::io::Error) -> TransferError {
    match TransferError::from(err) {
        TransferError::Io(e) => TransferError::Chunker(e),
        other => other,
    }
}
