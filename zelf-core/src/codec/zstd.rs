use super::{Codec, CodecKind};
use crate::error::CodecError;
use std::io;

pub const LEVEL: i32 = 19;

/// Single Zstandard frame.
pub struct Zstd;

fn map_err(e: io::Error, capacity: usize, compressing: bool) -> CodecError {
    // zstd reports a full destination as a generic io::Error carrying
    // "Destination buffer is too small"
    if e.to_string().contains("too small") {
        return CodecError::OutputTooSmall {
            codec: "Zstd",
            capacity,
        };
    }
    if compressing {
        CodecError::Compress {
            codec: "Zstd",
            reason: e.to_string(),
        }
    } else {
        CodecError::Decompress {
            codec: "Zstd",
            reason: e.to_string(),
        }
    }
}

impl Codec for Zstd {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }

    fn max_output_size(&self, input_len: usize) -> usize {
        zstd::zstd_safe::compress_bound(input_len)
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        zstd::bulk::compress_to_buffer(input, output, LEVEL).map_err(|e| map_err(e, capacity, true))
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        zstd::bulk::decompress_to_buffer(input, output).map_err(|e| map_err(e, capacity, false))
    }
}
