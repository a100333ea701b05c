//! Deflate bundle codec.
//!
//! The host compresses all file contents into one raw-deflate stream, a
//! single compression context for the whole batch, so header and dictionary
//! overhead is paid once, not per file. The device inflates incrementally as
//! bytes arrive, forwarding output straight to a sink; the payload is never
//! held in memory at once.

use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::error::TransferError;

/// Inflater output buffer size.
const INFLATE_BUF: usize = 32 * 1024;

/// Streaming compressor for one update bundle.
pub struct Deflater {
    encoder: DeflateEncoder<Vec<u8>>,
    raw_in: u64,
}

impl Deflater {
    pub fn new() -> Self {
        Self {
            encoder: DeflateEncoder::new(Vec::new(), Compression::best()),
            raw_in: 0,
        }
    }

    /// Append one file's contents to the bundle.
    pub fn push(&mut self, data: &[u8]) -> io::Result<()> {
        self.encoder.write_all(data)?;
        self.raw_in += data.len() as u64;
        Ok(())
    }

    /// Uncompressed bytes fed in so far.
    pub fn raw_len(&self) -> u64 {
        self.raw_in
    }

    /// Terminate the stream and return the compressed bundle.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        self.encoder.finish()
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental raw-deflate decompressor with a hard output limit.
pub struct Inflater {
    raw: Decompress,
    out: Vec<u8>,
    limit: u64,
    finished: bool,
}

impl Inflater {
    /// `limit` is the declared uncompressed total. Producing more than this
    /// marks the stream corrupt before the excess reaches the sink.
    pub fn new(limit: u64) -> Self {
        Self {
            raw: Decompress::new(false),
            out: vec![0u8; INFLATE_BUF],
            limit,
            finished: false,
        }
    }

    /// Feed compressed bytes, writing decompressed output to `sink`.
    ///
    /// Stream problems surface as `CorruptPayload`; sink failures as
    /// `WriteFailed`.
    pub fn feed<W: Write>(&mut self, mut input: &[u8], sink: &mut W) -> Result<(), TransferError> {
        while !input.is_empty() {
            if self.finished {
                // Bytes after stream end: the declared payload length and
                // the deflate stream disagree.
                return Err(TransferError::CorruptPayload);
            }
            let in_before = self.raw.total_in();
            let out_before = self.raw.total_out();
            let status = self
                .raw
                .decompress(input, &mut self.out, FlushDecompress::None)
                .map_err(|_| TransferError::CorruptPayload)?;
            let consumed = (self.raw.total_in() - in_before) as usize;
            let produced = (self.raw.total_out() - out_before) as usize;

            if self.raw.total_out() > self.limit {
                return Err(TransferError::CorruptPayload);
            }
            if produced > 0 {
                sink.write_all(&self.out[..produced])
                    .map_err(|_| TransferError::WriteFailed)?;
            }
            input = &input[consumed..];
            match status {
                Status::StreamEnd => self.finished = true,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        // No forward progress on a non-empty input.
                        return Err(TransferError::CorruptPayload);
                    }
                }
            }
        }
        Ok(())
    }

    /// Declare the compressed stream complete. Fails unless the deflate
    /// stream terminated and produced exactly the declared total.
    pub fn finish(self) -> Result<u64, TransferError> {
        if !self.finished || self.raw.total_out() != self.limit {
            return Err(TransferError::CorruptPayload);
        }
        Ok(self.raw.total_out())
    }

    pub fn total_out(&self) -> u64 {
        self.raw.total_out()
    }
}
