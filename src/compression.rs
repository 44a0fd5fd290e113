//! `com.apple.decmpfs` transparent-compression resource fork handling.
//!
//! A compressed file's data fork holds a small header (magic, algorithm id,
//! uncompressed size) followed by the compressed payload — either inline in
//! the xattr value itself (small files) or in the regular extent stream
//! (larger files, where the xattr only carries the header). The algorithm id
//! selects: ZLIB (decoded natively by `deflate.rs`), LZVN (unsupported — no
//! default codec ships with this crate), or LZFSE (decoded by the default
//! `CompressionCodec` backed by the `lzfse` crate, or by a caller-supplied
//! codec).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::deflate;
use crate::error::{ApfsError, Result};

const DECMPFS_MAGIC: u32 = 0x636D_7066; // "fpmc" little-endian ("cmpf" on disk)

/// decmpfs algorithm identifiers (`cmp_type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    ZlibInline,
    ZlibResource,
    LzvnInline,
    LzvnResource,
    LzfseInline,
    LzfseResource,
    RawInline,
    RawResource,
}

impl CompressionAlgorithm {
    fn from_id(id: u32) -> Result<Self> {
        match id {
            3 => Ok(CompressionAlgorithm::ZlibInline),
            4 => Ok(CompressionAlgorithm::ZlibResource),
            7 => Ok(CompressionAlgorithm::LzvnInline),
            8 => Ok(CompressionAlgorithm::LzvnResource),
            9 => Ok(CompressionAlgorithm::RawInline),
            10 => Ok(CompressionAlgorithm::RawResource),
            11 => Ok(CompressionAlgorithm::LzfseInline),
            12 => Ok(CompressionAlgorithm::LzfseResource),
            other => Err(ApfsError::UnsupportedCompression(other as u8)),
        }
    }

    fn is_inline(self) -> bool {
        matches!(
            self,
            CompressionAlgorithm::ZlibInline
                | CompressionAlgorithm::LzvnInline
                | CompressionAlgorithm::LzfseInline
                | CompressionAlgorithm::RawInline
        )
    }
}

/// Parsed `com.apple.decmpfs` xattr header.
#[derive(Debug, Clone)]
pub struct DecmpfsHeader {
    pub algorithm: CompressionAlgorithm,
    pub uncompressed_size: u64,
    /// Present only for `*_Inline` algorithms: the compressed bytes follow
    /// the header directly within the xattr value.
    pub inline_payload: Option<Vec<u8>>,
}

impl DecmpfsHeader {
    pub fn parse(xattr_value: &[u8]) -> Result<Self> {
        if xattr_value.len() < 16 {
            return Err(ApfsError::CorruptedData("decmpfs header too short".into()));
        }
        let mut cursor = Cursor::new(xattr_value);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != DECMPFS_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }
        let cmp_type = cursor.read_u32::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u64::<LittleEndian>()?;
        let algorithm = CompressionAlgorithm::from_id(cmp_type)?;

        let inline_payload = if algorithm.is_inline() {
            Some(xattr_value[16..].to_vec())
        } else {
            None
        };

        Ok(DecmpfsHeader {
            algorithm,
            uncompressed_size,
            inline_payload,
        })
    }
}

/// A pluggable decoder for a single transparent-compression algorithm.
///
/// The core crate only ships a native ZLIB decoder (`deflate.rs`); LZFSE and
/// LZVN payloads are handed to whatever codec the caller registers (or the
/// bundled LZFSE default) since those formats are not self-contained enough
/// to reimplement from scratch inside this crate's scope.
pub trait CompressionCodec {
    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// LZFSE codec backed by the `lzfse` crate.
pub struct LzfseCodec;

impl CompressionCodec for LzfseCodec {
    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; uncompressed_size];
        let written = lzfse::decode_buffer(compressed, &mut out).map_err(|_| {
            ApfsError::CorruptCompressedStream("lzfse decode failed".into())
        })?;
        out.truncate(written);
        Ok(out)
    }
}

/// Decompress a payload per its decmpfs header. `resource_data` is the raw
/// content of the file's (non-xattr) data fork, only consulted for
/// `*_Resource` algorithms. `codec` is used for LZFSE payloads; pass `None`
/// to use the bundled default.
pub fn decompress(
    header: &DecmpfsHeader,
    resource_data: Option<&[u8]>,
    codec: Option<&dyn CompressionCodec>,
) -> Result<Vec<u8>> {
    let size = header.uncompressed_size as usize;

    match header.algorithm {
        CompressionAlgorithm::RawInline => {
            Ok(header.inline_payload.clone().unwrap_or_default())
        }

        CompressionAlgorithm::RawResource => {
            let data = resource_data
                .ok_or_else(|| ApfsError::CorruptedData("missing resource fork data".into()))?;
            Ok(data.to_vec())
        }

        CompressionAlgorithm::ZlibInline => {
            let payload = header
                .inline_payload
                .as_deref()
                .ok_or_else(|| ApfsError::CorruptedData("missing inline payload".into()))?;
            if payload.first() == Some(&0x78) {
                deflate::zlib_decompress(payload)
            } else {
                deflate::inflate(payload)
            }
        }

        CompressionAlgorithm::ZlibResource => {
            let data = resource_data
                .ok_or_else(|| ApfsError::CorruptedData("missing resource fork data".into()))?;
            decompress_zlib_resource(data)
        }

        CompressionAlgorithm::LzfseInline => {
            let payload = header
                .inline_payload
                .as_deref()
                .ok_or_else(|| ApfsError::CorruptedData("missing inline payload".into()))?;
            run_codec(codec, payload, size)
        }

        CompressionAlgorithm::LzfseResource => {
            let data = resource_data
                .ok_or_else(|| ApfsError::CorruptedData("missing resource fork data".into()))?;
            run_codec(codec, data, size)
        }

        CompressionAlgorithm::LzvnInline | CompressionAlgorithm::LzvnResource => {
            Err(ApfsError::UnsupportedCompression(
                if header.algorithm == CompressionAlgorithm::LzvnInline {
                    7
                } else {
                    8
                },
            ))
        }
    }
}

fn run_codec(codec: Option<&dyn CompressionCodec>, payload: &[u8], size: usize) -> Result<Vec<u8>> {
    match codec {
        Some(c) => c.decompress(payload, size),
        None => LzfseCodec.decompress(payload, size),
    }
}

/// A `*_Resource` zlib payload is chunked: an offset table of 32-bit
/// compressed-chunk offsets followed by each chunk's own zlib stream,
/// decompressing to up to 64 KiB of plaintext per chunk.
fn decompress_zlib_resource(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(ApfsError::CorruptedData("resource fork too short".into()));
    }
    let header_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if header_size < 4 || header_size > data.len() {
        return Err(ApfsError::CorruptedData(
            "resource fork chunk table out of range".into(),
        ));
    }

    let table = &data[4..header_size];
    let mut offsets: Vec<u32> = table
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    offsets.push((data.len() - header_size) as u32);

    let mut out = Vec::new();
    for window in offsets.windows(2) {
        let start = header_size + window[0] as usize;
        let end = header_size + window[1] as usize;
        if end > data.len() || start > end {
            return Err(ApfsError::CorruptedData(
                "resource fork chunk offset out of range".into(),
            ));
        }
        let chunk = &data[start..end];
        if chunk.first() == Some(&0xFF) {
            // An 0xFF-prefixed chunk is stored raw (already below the
            // compression threshold for this 64 KiB block).
            out.extend_from_slice(&chunk[1..]);
        } else {
            out.extend_from_slice(&deflate::zlib_decompress(chunk)?);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(cmp_type: u32, size: u64, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&DECMPFS_MAGIC.to_le_bytes());
        data.extend_from_slice(&cmp_type.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn parses_raw_inline_header() {
        let xattr = build_header(9, 4, b"data");
        let header = DecmpfsHeader::parse(&xattr).unwrap();
        assert_eq!(header.algorithm, CompressionAlgorithm::RawInline);
        assert_eq!(header.uncompressed_size, 4);
    }

    #[test]
    fn rejects_unknown_algorithm_id() {
        let xattr = build_header(99, 4, b"");
        let err = DecmpfsHeader::parse(&xattr).unwrap_err();
        assert!(matches!(err, ApfsError::UnsupportedCompression(99)));
    }

    #[test]
    fn lzvn_decompress_is_unsupported() {
        let xattr = build_header(7, 4, b"junk");
        let header = DecmpfsHeader::parse(&xattr).unwrap();
        let err = decompress(&header, None, None).unwrap_err();
        assert!(matches!(err, ApfsError::UnsupportedCompression(7)));
    }

    #[test]
    fn raw_inline_roundtrips() {
        let xattr = build_header(9, 4, b"data");
        let header = DecmpfsHeader::parse(&xattr).unwrap();
        let out = decompress(&header, None, None).unwrap();
        assert_eq!(out, b"data");
    }

    #[test]
    fn raw_resource_passes_through_resource_data() {
        let xattr = build_header(10, 4, b"");
        let header = DecmpfsHeader::parse(&xattr).unwrap();
        assert_eq!(header.algorithm, CompressionAlgorithm::RawResource);
        let out = decompress(&header, Some(b"data"), None).unwrap();
        assert_eq!(out, b"data");
    }

    #[test]
    fn raw_resource_without_data_errors() {
        let xattr = build_header(10, 4, b"");
        let header = DecmpfsHeader::parse(&xattr).unwrap();
        let err = decompress(&header, None, None).unwrap_err();
        assert!(matches!(err, ApfsError::CorruptedData(_)));
    }

    struct StubCodec;
    impl CompressionCodec for StubCodec {
        fn decompress(&self, compressed: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>> {
            Ok(compressed.iter().rev().copied().collect())
        }
    }

    #[test]
    fn custom_codec_is_used_for_lzfse() {
        let xattr = build_header(11, 3, b"xyz");
        let header = DecmpfsHeader::parse(&xattr).unwrap();
        let out = decompress(&header, None, Some(&StubCodec)).unwrap();
        assert_eq!(out, b"zyx");
    }
}
