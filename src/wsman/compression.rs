//! Compression block framing of WS-Man stream data.
//!
//! When the client negotiates compression, each `rsp:Stream` payload is a
//! sequence of blocks, each prefixed by two little-endian `u16`s holding
//! the uncompressed and compressed sizes minus one. A block whose two sizes
//! are equal is stored as-is. The compression algorithm itself (XPRESS) is
//! provided by a [`Decompressor`].

use crate::error::DecompressError;

const BLOCK_HEADER_LEN: usize = 4;
const MAX_BLOCK_LEN: usize = u16::MAX as usize + 1;

/// External decompression capability.
pub trait Decompressor: Send + Sync {
    /// Decompress one block whose uncompressed size is known.
    fn decompress(&self, block: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, DecompressError>;
}

/// Strip block framing from `blob`, decompressing blocks as needed.
pub fn decode_stream(blob: &[u8], decompressor: Option<&dyn Decompressor>) -> Result<Vec<u8>, DecompressError> {
    let mut out = Vec::with_capacity(blob.len());
    let mut offset = 0;
    while offset < blob.len() {
        let header = blob
            .get(offset..offset + BLOCK_HEADER_LEN)
            .ok_or(DecompressError::TruncatedHeader { offset })?;
        let uncompressed = u16::from_le_bytes([header[0], header[1]]) as usize + 1;
        let compressed = u16::from_le_bytes([header[2], header[3]]) as usize + 1;

        let start = offset + BLOCK_HEADER_LEN;
        let block = blob
            .get(start..start + compressed)
            .ok_or(DecompressError::TruncatedBlock {
                offset,
                declared: compressed,
                available: blob.len() - start,
            })?;

        if uncompressed == compressed {
            out.extend_from_slice(block);
        } else {
            let decompressor = decompressor.ok_or(DecompressError::Unavailable)?;
            let data = decompressor.decompress(block, uncompressed)?;
            if data.len() != uncompressed {
                return Err(DecompressError::SizeMismatch {
                    expected: uncompressed,
                    actual: data.len(),
                });
            }
            out.extend_from_slice(&data);
        }
        offset = start + compressed;
    }
    Ok(out)
}

/// Frame `data` as uncompressed blocks, as a client without compression
/// support would send it.
pub fn frame_uncompressed(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + BLOCK_HEADER_LEN * (data.len() / MAX_BLOCK_LEN + 1));
    for block in data.chunks(MAX_BLOCK_LEN) {
        let size = (block.len() - 1) as u16;
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test double: "decompresses" by repeating each byte twice.
    struct Doubler;

    impl Decompressor for Doubler {
        fn decompress(&self, block: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, DecompressError> {
            Ok(block.iter().flat_map(|b| [*b, *b]).collect())
        }
    }

    fn compressed_block(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((data.len() * 2 - 1) as u16).to_le_bytes());
        out.extend_from_slice(&((data.len() - 1) as u16).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_uncompressed_blocks() {
        let framed = frame_uncompressed(b"hello world");
        assert_eq!(&framed[..4], &[10, 0, 10, 0]);
        assert_eq!(decode_stream(&framed, None).unwrap(), b"hello world");
    }

    #[test]
    fn test_large_data_spans_blocks() {
        let data: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let framed = frame_uncompressed(&data);
        assert_eq!(framed.len(), data.len() + 8);
        assert_eq!(decode_stream(&framed, None).unwrap(), data);
    }

    #[test]
    fn test_compressed_block_uses_decompressor() {
        let mut blob = frame_uncompressed(b"ab");
        blob.extend(compressed_block(b"xyz"));
        assert_eq!(decode_stream(&blob, Some(&Doubler)).unwrap(), b"abxxyyzz");
    }

    #[test]
    fn test_compressed_without_decompressor() {
        let blob = compressed_block(b"xyz");
        assert!(matches!(decode_stream(&blob, None), Err(DecompressError::Unavailable)));
    }

    #[test]
    fn test_truncation() {
        assert!(matches!(
            decode_stream(&[1, 0], None),
            Err(DecompressError::TruncatedHeader { offset: 0 })
        ));
        let mut framed = frame_uncompressed(b"hello");
        framed.truncate(7);
        assert!(matches!(
            decode_stream(&framed, None),
            Err(DecompressError::TruncatedBlock {
                offset: 0,
                declared: 5,
                available: 3
            })
        ));
    }

    #[test]
    fn test_size_mismatch() {
        struct Short;
        impl Decompressor for Short {
            fn decompress(&self, _block: &[u8], _size: usize) -> Result<Vec<u8>, DecompressError> {
                Ok(vec![0])
            }
        }
        let blob = compressed_block(b"xyz");
        assert!(matches!(
            decode_stream(&blob, Some(&Short)),
            Err(DecompressError::SizeMismatch { expected: 6, actual: 1 })
        ));
    }
}
