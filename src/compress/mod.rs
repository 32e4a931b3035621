//! Pluggable compression, selected by name and recognized by file extension.

use std::io::{self, Read, Write};

pub mod pipe;

pub use pipe::{compress_and_encrypt, decrypt_and_decompress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    #[default]
    Lz4,
    Zstd,
    Brotli,
    Lzma,
}

impl CompressionMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "lz4" => Some(Self::Lz4),
            "zstd" => Some(Self::Zstd),
            "brotli" => Some(Self::Brotli),
            "lzma" => Some(Self::Lzma),
            _ => None,
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "lz4" => Some(Self::Lz4),
            "zst" => Some(Self::Zstd),
            "br" => Some(Self::Brotli),
            "lzma" => Some(Self::Lzma),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Brotli => "brotli",
            Self::Lzma => "lzma",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zst",
            Self::Brotli => "br",
            Self::Lzma => "lzma",
        }
    }

    /// Every method we may encounter in a stored archive.
    pub fn all() -> [Self; 4] {
        [Self::Lz4, Self::Zstd, Self::Brotli, Self::Lzma]
    }
}

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 3;
const BROTLI_WINDOW: u32 = 22;
const ZSTD_LEVEL: i32 = 3;
const LZMA_PRESET: u32 = 6;

/// Single-pass compressing writer. `finish` closes the compressed stream and
/// hands back the underlying sink so layered closes happen in order.
pub enum CompressionWriter<W: Write> {
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Lzma(xz2::write::XzEncoder<W>),
}

impl<W: Write> CompressionWriter<W> {
    pub fn new(method: CompressionMethod, sink: W) -> io::Result<Self> {
        Ok(match method {
            CompressionMethod::Lz4 => Self::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
            CompressionMethod::Zstd => {
                Self::Zstd(zstd::stream::write::Encoder::new(sink, ZSTD_LEVEL)?)
            }
            CompressionMethod::Brotli => Self::Brotli(Box::new(brotli::CompressorWriter::new(
                sink,
                BROTLI_BUFFER,
                BROTLI_QUALITY,
                BROTLI_WINDOW,
            ))),
            CompressionMethod::Lzma => Self::Lzma(xz2::write::XzEncoder::new(sink, LZMA_PRESET)),
        })
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            Self::Zstd(encoder) => encoder.finish(),
            Self::Brotli(mut encoder) => {
                encoder.flush()?;
                Ok(encoder.into_inner())
            }
            Self::Lzma(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for CompressionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Lz4(encoder) => encoder.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
            Self::Brotli(encoder) => encoder.write(buf),
            Self::Lzma(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Lz4(encoder) => encoder.flush(),
            Self::Zstd(encoder) => encoder.flush(),
            Self::Brotli(encoder) => encoder.flush(),
            Self::Lzma(encoder) => encoder.flush(),
        }
    }
}

/// Decompressing reader over an archived object.
pub fn decompression_reader(
    method: CompressionMethod,
    source: Box<dyn Read + Send>,
) -> io::Result<Box<dyn Read + Send>> {
    Ok(match method {
        CompressionMethod::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(source)),
        CompressionMethod::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
        CompressionMethod::Brotli => Box::new(brotli::Decompressor::new(source, BROTLI_BUFFER)),
        CompressionMethod::Lzma => Box::new(xz2::read::XzDecoder::new(source)),
    })
}
