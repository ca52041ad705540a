use super::{Codec, CodecKind};
use crate::error::CodecError;

/// Snappy raw format (varint length preamble, no framing).
pub struct Snappy;

impl Codec for Snappy {
    fn kind(&self) -> CodecKind {
        CodecKind::Snappy
    }

    fn max_output_size(&self, input_len: usize) -> usize {
        snap::raw::max_compress_len(input_len)
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        snap::raw::Encoder::new()
            .compress(input, output)
            .map_err(|e| match e {
                snap::Error::BufferTooSmall { .. } => CodecError::OutputTooSmall {
                    codec: "Snappy",
                    capacity,
                },
                other => CodecError::Compress {
                    codec: "Snappy",
                    reason: other.to_string(),
                },
            })
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        snap::raw::Decoder::new()
            .decompress(input, output)
            .map_err(|e| match e {
                snap::Error::BufferTooSmall { .. } => CodecError::OutputTooSmall {
                    codec: "Snappy",
                    capacity,
                },
                other => CodecError::Decompress {
                    codec: "Snappy",
                    reason: other.to_string(),
                },
            })
    }
}
