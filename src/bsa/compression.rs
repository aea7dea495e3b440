//! Entry codecs used by the different container versions.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{self, Read, Write};

use crate::streams::prealloc_capacity;

/// LZ4 expands at most 255 bytes per input byte, plus literal slack
const LZ4_MAX_RATIO: u64 = 255;

/// How an entry's payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Stored,
    /// zlib stream with header (TES4, FO3, FO4)
    Zlib,
    /// LZ4 frame format (Skyrim SE)
    Lz4Frame,
    /// Raw LZ4 block with a known decompressed size (Starfield v3)
    Lz4Block,
}

/// Streaming decoder over `input`. Block LZ4 has no streaming form and
/// decodes into memory.
pub fn decoder<'a, R: Read + 'a>(
    codec: Codec,
    mut input: R,
    packed_len: u64,
    unpacked_len: u64,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match codec {
        Codec::Stored => Box::new(input.take(unpacked_len)),
        Codec::Zlib => Box::new(ZlibDecoder::new(input.take(packed_len))),
        Codec::Lz4Frame => Box::new(FrameDecoder::new(input.take(packed_len))),
        Codec::Lz4Block => {
            let mut packed = Vec::with_capacity(prealloc_capacity(packed_len));
            (&mut input).take(packed_len).read_to_end(&mut packed)?;
            let limit = (packed.len() as u64).saturating_mul(LZ4_MAX_RATIO).saturating_add(16);
            if unpacked_len > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("declared size {} is too large for {} packed bytes", unpacked_len, packed.len()),
                ));
            }
            let unpacked_len = usize::try_from(unpacked_len)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let data = lz4_flex::block::decompress(&packed, unpacked_len)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            Box::new(io::Cursor::new(data))
        }
    })
}

/// Compress a whole entry.
pub fn compress(codec: Codec, data: &[u8]) -> io::Result<Vec<u8>> {
    match codec {
        Codec::Stored => Ok(data.to_vec()),
        Codec::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Codec::Lz4Frame => {
            let mut encoder = FrameEncoder::new(Vec::new());
            encoder.write_all(data)?;
            encoder
                .finish()
                .map_err(|e| io::Error::other(e.to_string()))
        }
        Codec::Lz4Block => Ok(lz4_flex::block::compress(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codecs_invert() -> io::Result<()> {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for codec in [Codec::Stored, Codec::Zlib, Codec::Lz4Frame, Codec::Lz4Block] {
            let packed = compress(codec, &data)?;
            let mut out = Vec::new();
            decoder(codec, &packed[..], packed.len() as u64, data.len() as u64)?
                .read_to_end(&mut out)?;
            assert_eq!(out, data, "{:?}", codec);
        }
        Ok(())
    }

    #[test]
    fn test_lz4_block_rejects_oversized_declaration() -> io::Result<()> {
        let packed = compress(Codec::Lz4Block, b"tiny")?;
        let result = decoder(Codec::Lz4Block, &packed[..], packed.len() as u64, u32::MAX as u64);
        match result {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            Ok(_) => panic!("expected oversized declaration to fail"),
        }
        Ok(())
    }
}
