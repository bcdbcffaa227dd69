// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Streaming compression for staged uploads and restored downloads.
//!
//! Both directions copy through a fixed-size window; memory use per
//! stream is independent of file size. The uncompressed byte count and
//! its sha256 are produced as side outputs of the copy, so callers never
//! need a second pass over the data.

use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

use crate::COPY_BUFFER_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CompressionCodec {
    Snappy,
    Zstd,
    None,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CompressError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt compressed stream: `{0}`")]
    Corrupt(String),
}

/// Side outputs of compressing one file.
#[derive(Debug, Clone)]
pub struct CompressedFile {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    /// Hex sha256 of the uncompressed content.
    pub sha256: String,
}

/// Side outputs of decompressing one stream.
#[derive(Debug, Clone)]
pub struct DecompressedFile {
    pub size: u64,
    /// Hex sha256 of the decompressed content.
    pub sha256: String,
}

fn copy_and_hash(reader: &mut dyn Read, writer: &mut dyn Write) -> std::io::Result<(u64, String)> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Compresses `src` into `dst` with the given codec.
pub fn compress_file(
    codec: CompressionCodec,
    src: &Path,
    dst: &Path,
) -> Result<CompressedFile, CompressError> {
    let mut input = File::open(src)?;
    let output = File::create(dst)?;
    let (uncompressed_size, sha256) = match codec {
        CompressionCodec::Snappy => {
            let mut encoder = snap::write::FrameEncoder::new(output);
            let result = copy_and_hash(&mut input, &mut encoder)?;
            encoder.flush()?;
            result
        }
        CompressionCodec::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(output, 0)?;
            let result = copy_and_hash(&mut input, &mut encoder)?;
            let mut output = encoder.finish()?;
            output.flush()?;
            result
        }
        CompressionCodec::None => {
            let mut writer = BufWriter::new(output);
            let result = copy_and_hash(&mut input, &mut writer)?;
            writer.flush()?;
            result
        }
    };
    let compressed_size = std::fs::metadata(dst)?.len();
    Ok(CompressedFile {
        uncompressed_size,
        compressed_size,
        sha256,
    })
}

/// Decompresses `reader` into `dst`.
///
/// A truncated stream or a frame checksum mismatch surfaces as
/// [`CompressError::Corrupt`].
pub fn decompress_to_file(
    codec: CompressionCodec,
    reader: impl Read,
    dst: &Path,
) -> Result<DecompressedFile, CompressError> {
    let output = File::create(dst)?;
    let mut writer = BufWriter::new(output);
    let result = match codec {
        CompressionCodec::Snappy => {
            let mut decoder = snap::read::FrameDecoder::new(reader);
            copy_and_hash(&mut decoder, &mut writer)
        }
        CompressionCodec::Zstd => {
            let mut decoder = zstd::stream::Decoder::new(reader)?;
            copy_and_hash(&mut decoder, &mut writer)
        }
        CompressionCodec::None => {
            let mut reader = reader;
            copy_and_hash(&mut reader, &mut writer)
        }
    };
    let (size, sha256) = result.map_err(classify_decode_error)?;
    writer.flush()?;
    Ok(DecompressedFile { size, sha256 })
}

fn classify_decode_error(err: std::io::Error) -> CompressError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            CompressError::Corrupt(err.to_string())
        }
        _ => CompressError::Io(err),
    }
}

/// Hex sha256 of a local file, streamed.
pub fn sha256_file(path: &Path) -> Result<String, CompressError> {
    let mut input = File::open(path)?;
    let mut sink = std::io::sink();
    let (_, sha256) = copy_and_hash(&mut input, &mut sink)?;
    Ok(sha256)
}
