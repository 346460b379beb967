use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracevault_types::{Error, ExportErrorCode, Result};

use super::Compression;

/// Sink for rendered export bytes, optionally wrapping the file in a
/// compressing encoder. `finish` must be called so encoder trailers are
/// written before the file handle drops.
pub(super) enum OutputWriter {
    Plain(BufWriter<File>),
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
    Brotli(Box<brotli::CompressorWriter<BufWriter<File>>>),
}

impl OutputWriter {
    pub(super) fn create(path: &Path, compression: Option<Compression>) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::Export {
            code: ExportErrorCode::WriteFailed,
            message: format!("cannot create {}: {}", path.display(), e),
        })?;
        let buf = BufWriter::new(file);
        Ok(match compression {
            None => OutputWriter::Plain(buf),
            Some(Compression::Gzip) => OutputWriter::Gzip(flate2::write::GzEncoder::new(
                buf,
                flate2::Compression::default(),
            )),
            // quality 5, lgwin 22: the brotli crate's general-purpose setting
            Some(Compression::Brotli) => {
                OutputWriter::Brotli(Box::new(brotli::CompressorWriter::new(buf, 4096, 5, 22)))
            }
        })
    }

    pub(super) fn finish(self) -> Result<()> {
        let write_failed = |e: io::Error| Error::Export {
            code: ExportErrorCode::WriteFailed,
            message: e.to_string(),
        };
        match self {
            OutputWriter::Plain(mut w) => w.flush().map_err(write_failed),
            OutputWriter::Gzip(w) => w.finish().and_then(|mut f| f.flush()).map_err(write_failed),
            OutputWriter::Brotli(mut w) => {
                w.flush().map_err(write_failed)?;
                w.into_inner().flush().map_err(write_failed)
            }
        }
    }
}

impl Write for OutputWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            OutputWriter::Plain(w) => w.write(data),
            OutputWriter::Gzip(w) => w.write(data),
            OutputWriter::Brotli(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputWriter::Plain(w) => w.flush(),
            OutputWriter::Gzip(w) => w.flush(),
            OutputWriter::Brotli(w) => w.flush(),
        }
    }
}
