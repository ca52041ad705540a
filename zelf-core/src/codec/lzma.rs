use super::{Codec, CodecKind};
use crate::error::CodecError;
use std::io::{self, Cursor};

/// LZMA "alone" stream (13-byte header, end marker).
pub struct Lzma;

impl Codec for Lzma {
    fn kind(&self) -> CodecKind {
        CodecKind::Lzma
    }

    fn max_output_size(&self, input_len: usize) -> usize {
        (input_len + input_len / 3 + 256).max(1024)
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        let mut reader = input;
        let mut writer = Cursor::new(output);
        match lzma_rs::lzma_compress(&mut reader, &mut writer) {
            Ok(()) => Ok(writer.position() as usize),
            Err(e) if e.kind() == io::ErrorKind::WriteZero => Err(CodecError::OutputTooSmall {
                codec: "LZMA",
                capacity,
            }),
            Err(e) => Err(CodecError::Compress {
                codec: "LZMA",
                reason: e.to_string(),
            }),
        }
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let capacity = output.len();
        let mut reader = input;
        let mut writer = Cursor::new(output);
        match lzma_rs::lzma_decompress(&mut reader, &mut writer) {
            Ok(()) => Ok(writer.position() as usize),
            Err(lzma_rs::error::Error::IoError(e)) if e.kind() == io::ErrorKind::WriteZero => {
                Err(CodecError::OutputTooSmall {
                    codec: "LZMA",
                    capacity,
                })
            }
            Err(e) => Err(CodecError::Decompress {
                codec: "LZMA",
                reason: e.to_string(),
            }),
        }
    }
}
