use super::{Codec, CodecKind};
use crate::error::CodecError;
use lz4_flex::block::{self, CompressError, DecompressError};

/// LZ4 raw block format, no frame or size prefix.
pub struct Lz4;

impl Codec for Lz4 {
    fn kind(&self) -> CodecKind {
        CodecKind::Lz4
    }

    fn max_output_size(&self, input_len: usize) -> usize {
        block::get_maximum_output_size(input_len)
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        block::compress_into(input, output).map_err(|e| match e {
            CompressError::OutputTooSmall => CodecError::OutputTooSmall {
                codec: "LZ4",
                capacity,
            },
            other => CodecError::Compress {
                codec: "LZ4",
                reason: other.to_string(),
            },
        })
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        block::decompress_into(input, output).map_err(|e| match e {
            DecompressError::OutputTooSmall { .. } => CodecError::OutputTooSmall {
                codec: "LZ4",
                capacity,
            },
            other => CodecError::Decompress {
                codec: "LZ4",
                reason: other.to_string(),
            },
        })
    }
}
