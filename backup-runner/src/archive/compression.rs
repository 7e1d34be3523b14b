//! zstd compression stage.

use super::{ArchiveError, Compressor, SealedWrite};
use std::io::{self, Read, Write};

/// Streaming zstd compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCompressor;

struct ZstdSink {
    encoder: zstd::stream::write::Encoder<'static, Box<dyn SealedWrite>>,
}

impl Write for ZstdSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl SealedWrite for ZstdSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.encoder.finish()?;
        inner.finish()
    }
}

impl Compressor for ZstdCompressor {
    fn compress_to(
        &self,
        sink: Box<dyn SealedWrite>,
        level: i32,
    ) -> Result<Box<dyn SealedWrite>, ArchiveError> {
        let mut encoder = zstd::stream::write::Encoder::new(sink, level)?;
        encoder.include_checksum(true)?;
        Ok(Box::new(ZstdSink { encoder }))
    }

    fn decompress_from(
        &self,
        source: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>, ArchiveError> {
        let decoder = zstd::stream::read::Decoder::new(source)?;
        Ok(Box::new(decoder))
    }
}
