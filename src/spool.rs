//! An append-then-replay buffer for SAM records.
//!
//! The estimator maps a sample once and then re-reads the alignments up
//! to twice more. The spool captures them during mapping so the aligner
//! never runs twice: either into compressed memory (the default) or into
//! a file on disk. Write once, close, then iterate as often as needed.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::error::{Error, Result};
use crate::sam::{SamReader, SamRecord};
use crate::utils::{open_maybe_gz, FileWriter};

/// Compression level of the in-memory backend. Level 1 with the default
/// single worker keeps the write path cheap while still shrinking SAM
/// text several-fold.
const RAM_ZSTD_LEVEL: i32 = 1;

/// A write-once/read-many buffer of SAM records.
pub struct SamSpool {
    backend: Backend,
}

enum Backend {
    RamWriting(ZstdEncoder<'static, Vec<u8>>),
    RamClosed(Vec<u8>),
    DiskWriting { path: PathBuf, writer: FileWriter },
    DiskClosed(PathBuf),
}

impl SamSpool {
    /// A spool backed by a zstd-compressed byte buffer.
    pub fn in_memory() -> Result<SamSpool> {
        let enc = ZstdEncoder::new(Vec::new(), RAM_ZSTD_LEVEL)?;
        Ok(SamSpool {
            backend: Backend::RamWriting(enc),
        })
    }

    /// A spool backed by a file, gzip-compressed if the path ends in `.gz`.
    pub fn on_disk<P: AsRef<Path>>(path: P) -> Result<SamSpool> {
        let path = path.as_ref().to_path_buf();
        let writer = FileWriter::create(&path)?;
        Ok(SamSpool {
            backend: Backend::DiskWriting { path, writer },
        })
    }

    pub fn write_record(&mut self, rec: &SamRecord) -> Result<()> {
        let writer: &mut dyn Write = match &mut self.backend {
            Backend::RamWriting(w) => w,
            Backend::DiskWriting { writer, .. } => writer,
            Backend::RamClosed(_) | Backend::DiskClosed(_) => return Err(Error::SpoolClosed),
        };
        writer.write_all(rec.to_line().as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Finalizes the spool for reading. Idempotent.
    ///
    /// The in-memory variant finishes the compressed frame and trims the
    /// buffer's capacity to its length, since the blob is retained across
    /// both remaining passes.
    pub fn close(&mut self) -> Result<()> {
        let backend = std::mem::replace(&mut self.backend, Backend::RamClosed(Vec::new()));
        self.backend = match backend {
            Backend::RamWriting(enc) => {
                let mut bytes = enc.finish()?;
                bytes.shrink_to_fit();
                Backend::RamClosed(bytes)
            }
            Backend::DiskWriting { path, writer } => {
                writer.finish()?;
                Backend::DiskClosed(path)
            }
            closed => closed,
        };
        Ok(())
    }

    /// A fresh pass over the spooled records, in write order.
    pub fn iter(&self) -> Result<SpoolRecords<'_>> {
        let reader: Box<dyn BufRead + '_> = match &self.backend {
            Backend::RamClosed(bytes) => Box::new(BufReader::new(ZstdDecoder::new(&bytes[..])?)),
            Backend::DiskClosed(path) => open_maybe_gz(path)?,
            Backend::RamWriting(_) | Backend::DiskWriting { .. } => {
                return Err(Error::SpoolNotClosed)
            }
        };
        Ok(SpoolRecords {
            records: SamReader::new(reader),
        })
    }
}

/// One replay of a closed [`SamSpool`].
pub struct SpoolRecords<'a> {
    records: SamReader<Box<dyn BufRead + 'a>>,
}

impl Iterator for SpoolRecords<'_> {
    type Item = Result<SamRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_records() -> Vec<SamRecord> {
        ["r1\t0\tc1\t5\t40\t4M\t*\t0\t0\tACGT\tFFFF\tAS:i:0",
            "r2\t4\t*\t0\t0\t*\t*\t0\t0\tTTTT\t!!!!",
            "r3\t0\tc2\t99\t12\t4M\t*\t0\t0\tGGGG\tFFFF"]
        .iter()
        .map(|l| SamRecord::parse(l).unwrap())
        .collect()
    }

    fn roundtrip(mut spool: SamSpool) {
        let records = some_records();
        for r in &records {
            spool.write_record(r).unwrap();
        }

        // reading an open spool is an error
        assert!(matches!(spool.iter(), Err(Error::SpoolNotClosed)));

        spool.close().unwrap();
        // close is idempotent
        spool.close().unwrap();

        // re-iteration yields the same sequence every time
        for _ in 0..3 {
            let replay: Vec<_> = spool.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
            assert_eq!(replay, records);
        }

        // writing after close is an error
        assert!(matches!(
            spool.write_record(&records[0]),
            Err(Error::SpoolClosed)
        ));
    }

    #[test]
    fn test_ram_roundtrip() {
        roundtrip(SamSpool::in_memory().unwrap());
    }

    #[test]
    fn test_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        roundtrip(SamSpool::on_disk(dir.path().join("spool.sam")).unwrap());
    }

    #[test]
    fn test_disk_gz_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        roundtrip(SamSpool::on_disk(dir.path().join("spool.sam.gz")).unwrap());
    }

    #[test]
    fn test_empty_spool() {
        let mut spool = SamSpool::in_memory().unwrap();
        spool.close().unwrap();
        assert_eq!(spool.iter().unwrap().count(), 0);
    }
}
