// src/compression/mod.rs
//! Compression formats for published repository databases
//!
//! Every repository declares a `dbformat`; it selects the codec used for the
//! compressed database, the light dump and the metafiles bundle, and the file
//! extension that appears in their derived names.

use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to create {format} decoder: {source}")]
    DecoderCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("Failed to decompress {format} data: {source}")]
    Decompression {
        format: &'static str,
        source: io::Error,
    },

    #[error("Failed to compress {format} data: {source}")]
    Compression {
        format: &'static str,
        source: io::Error,
    },

    #[error("Unsupported compression format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),
}

/// Supported repository database formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DbFormat {
    /// Gzip (.gz)
    #[default]
    Gz,
    /// XZ/LZMA (.xz)
    Xz,
    /// Zstandard (.zst)
    Zst,
}

impl DbFormat {
    pub const ALL: [DbFormat; 3] = [DbFormat::Gz, DbFormat::Xz, DbFormat::Zst];

    /// File extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gz => "gz",
            Self::Xz => "xz",
            Self::Zst => "zst",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gz => "gzip",
            Self::Xz => "xz",
            Self::Zst => "zstd",
        }
    }

    /// Detect format from magic bytes
    ///
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x1f, 0x8b]) {
            Some(Self::Gz)
        } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Some(Self::Xz)
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(Self::Zst)
        } else {
            None
        }
    }
}

impl fmt::Display for DbFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for DbFormat {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gz" | "gzip" => Ok(Self::Gz),
            "xz" => Ok(Self::Xz),
            "zst" | "zstd" => Ok(Self::Zst),
            other => Err(CompressionError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for DbFormat {
    type Error = CompressionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Create a decompressing reader for the given format
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: DbFormat,
) -> Result<Box<dyn Read + 'a>, CompressionError> {
    match format {
        DbFormat::Gz => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        DbFormat::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        DbFormat::Zst => {
            let decoder =
                zstd::Decoder::new(reader).map_err(|e| CompressionError::DecoderCreation {
                    format: "zstd",
                    source: e,
                })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Run `body` against an encoder wrapping `out`, then finish and sync the stream
fn encode_into<F>(out: File, format: DbFormat, body: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let out = BufWriter::new(out);
    let file = match format {
        DbFormat::Gz => {
            let mut enc = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            body(&mut enc)?;
            enc.finish()?
        }
        DbFormat::Xz => {
            let mut enc = xz2::write::XzEncoder::new(out, 6);
            body(&mut enc)?;
            enc.finish()?
        }
        DbFormat::Zst => {
            let mut enc = zstd::Encoder::new(out, 0)?;
            body(&mut enc)?;
            enc.finish()?
        }
    };
    let file = file.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Compress `src` into `dst`
pub fn compress_file(src: &Path, dst: &Path, format: DbFormat) -> Result<(), CompressionError> {
    let wrap = |source| CompressionError::Compression {
        format: format.name(),
        source,
    };
    let mut input = BufReader::new(File::open(src).map_err(wrap)?);
    let output = File::create(dst).map_err(wrap)?;
    encode_into(output, format, |w| io::copy(&mut input, w).map(|_| ())).map_err(wrap)?;
    debug!("Compressed {} -> {}", src.display(), dst.display());
    Ok(())
}

/// Decompress `src` into `dst`
pub fn decompress_file(src: &Path, dst: &Path, format: DbFormat) -> Result<(), CompressionError> {
    let wrap = |source| CompressionError::Decompression {
        format: format.name(),
        source,
    };
    let input = BufReader::new(File::open(src).map_err(wrap)?);
    let mut decoder = create_decoder(input, format)?;
    let mut output = File::create(dst).map_err(wrap)?;
    io::copy(&mut decoder, &mut output).map_err(wrap)?;
    output.sync_all().map_err(wrap)?;
    debug!("Decompressed {} -> {}", src.display(), dst.display());
    Ok(())
}

/// Decompress a byte slice using the specified format
pub fn decompress(data: &[u8], format: DbFormat) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = create_decoder(data, format)?;
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| CompressionError::Decompression {
            format: format.name(),
            source: e,
        })?;
    Ok(output)
}

/// Compress a byte slice using the specified format
pub fn compress(data: &[u8], format: DbFormat) -> Result<Vec<u8>, CompressionError> {
    let wrap = |source| CompressionError::Compression {
        format: format.name(),
        source,
    };
    match format {
        DbFormat::Gz => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).map_err(wrap)?;
            enc.finish().map_err(wrap)
        }
        DbFormat::Xz => {
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
            enc.write_all(data).map_err(wrap)?;
            enc.finish().map_err(wrap)
        }
        DbFormat::Zst => zstd::encode_all(data, 0).map_err(wrap),
    }
}

/// Whether `format` round-trips a small sample on this host
pub fn codec_available(format: DbFormat) -> bool {
    const SAMPLE: &[u8] = b"packages.db";
    match compress(SAMPLE, format).and_then(|packed| decompress(&packed, format)) {
        Ok(unpacked) => unpacked == SAMPLE,
        Err(e) => {
            debug!("{} codec unusable: {}", format.name(), e);
            false
        }
    }
}

/// Pack files into a compressed tar bundle, flattened to their base names
pub fn pack_bundle(dst: &Path, files: &[PathBuf], format: DbFormat) -> Result<(), CompressionError> {
    let wrap = |source| CompressionError::Compression {
        format: format.name(),
        source,
    };
    let output = File::create(dst).map_err(wrap)?;
    encode_into(output, format, |w| {
        let mut builder = tar::Builder::new(w);
        for file in files {
            let name = file.file_name().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "bundle entry without file name")
            })?;
            builder.append_path_with_name(file, name)?;
        }
        builder.into_inner().map(|_| ())
    })
    .map_err(wrap)
}

/// Unpack a compressed tar bundle into `dest_dir`, returning the written paths
///
/// Entry paths are reduced to their base names; nested or absolute paths in
/// the archive never escape `dest_dir`.
pub fn unpack_bundle(
    src: &Path,
    dest_dir: &Path,
    format: DbFormat,
) -> Result<Vec<PathBuf>, CompressionError> {
    let wrap = |source| CompressionError::Decompression {
        format: format.name(),
        source,
    };
    let input = BufReader::new(File::open(src).map_err(wrap)?);
    let decoder = create_decoder(input, format)?;
    let mut archive = tar::Archive::new(decoder);

    let mut written = Vec::new();
    for entry in archive.entries().map_err(wrap)? {
        let mut entry = entry.map_err(wrap)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(wrap)?.into_owned();
        let name = path
            .file_name()
            .ok_or_else(|| CompressionError::InvalidBundle(format!("bad entry {:?}", path)))?
            .to_owned();
        let target = dest_dir.join(name);
        entry.unpack(&target).map_err(wrap)?;
        written.push(target);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_format_parse_and_display() {
        assert_eq!("gz".parse::<DbFormat>().unwrap(), DbFormat::Gz);
        assert_eq!("ZSTD".parse::<DbFormat>().unwrap(), DbFormat::Zst);
        assert_eq!(DbFormat::Xz.to_string(), "xz");
        assert!("bz2".parse::<DbFormat>().is_err());
    }

    #[test]
    fn test_format_from_magic_bytes() {
        assert_eq!(
            DbFormat::from_magic_bytes(&[0x1f, 0x8b, 0x08, 0x00]),
            Some(DbFormat::Gz)
        );
        assert_eq!(
            DbFormat::from_magic_bytes(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            Some(DbFormat::Xz)
        );
        assert_eq!(
            DbFormat::from_magic_bytes(&[0x28, 0xb5, 0x2f, 0xfd]),
            Some(DbFormat::Zst)
        );
        assert_eq!(DbFormat::from_magic_bytes(&[0x1f]), None);
    }

    #[test]
    fn test_decompress_gzip_literal() {
        // Minimal gzip of "hello"
        let gzip_data: &[u8] = &[
            0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0xcb, 0x48, 0xcd, 0xc9,
            0xc9, 0x07, 0x00, 0x86, 0xa6, 0x10, 0x36, 0x05, 0x00, 0x00, 0x00,
        ];
        assert_eq!(decompress(gzip_data, DbFormat::Gz).unwrap(), b"hello");
    }

    #[test]
    fn test_file_compression_all_formats() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("packages.db");
        fs::write(&src, b"repository payload ".repeat(64)).unwrap();

        for format in DbFormat::ALL {
            let packed = temp.path().join(format!("packages.db.{}", format.extension()));
            let unpacked = temp.path().join(format!("out.{}", format.extension()));
            compress_file(&src, &packed, format).unwrap();

            let head = fs::read(&packed).unwrap();
            assert_eq!(DbFormat::from_magic_bytes(&head), Some(format));

            decompress_file(&packed, &unpacked, format).unwrap();
            assert_eq!(fs::read(&unpacked).unwrap(), fs::read(&src).unwrap());
        }
    }

    #[test]
    fn test_memory_compression_and_codec_check() {
        let data = b"package record ".repeat(32);
        for format in DbFormat::ALL {
            let packed = compress(&data, format).unwrap();
            assert_eq!(DbFormat::from_magic_bytes(&packed), Some(format));
            assert_eq!(decompress(&packed, format).unwrap(), data);
            assert!(codec_available(format));
        }
    }

    #[test]
    fn test_bundle_flattens_names() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        let mask = nested.join("packages.db.mask");
        let notice = temp.path().join("notice.xml");
        fs::write(&mask, b"dev-libs/foo").unwrap();
        fs::write(&notice, b"<notice/>").unwrap();

        let bundle = temp.path().join("packages.db.meta");
        pack_bundle(&bundle, &[mask, notice], DbFormat::Gz).unwrap();

        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let mut written = unpack_bundle(&bundle, &out, DbFormat::Gz).unwrap();
        written.sort();

        assert_eq!(
            written,
            vec![out.join("notice.xml"), out.join("packages.db.mask")]
        );
        assert_eq!(fs::read(out.join("packages.db.mask")).unwrap(), b"dev-libs/foo");
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("garbage.gz");
        fs::write(&src, b"definitely not gzip").unwrap();
        assert!(decompress_file(&src, &temp.path().join("out"), DbFormat::Gz).is_err());
    }
}
