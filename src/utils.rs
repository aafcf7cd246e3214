//! Utilities: progress reporting and transparently-compressed file I/O.
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// returns a spinner for streams of unknown length
pub fn get_spinner(msg: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {human_pos} {msg} ({per_sec})")
            .unwrap(),
    );
    bar.set_message(msg);
    bar
}

/// a/b as a percentage
pub fn perc(a: usize, b: usize) -> f64 {
    100.0 * a as f64 / b as f64
}

/// a/b as a "12%"-style string
pub fn percf(a: usize, b: usize) -> String {
    format!("{:.0}%", perc(a, b))
}

/// Opens a file for reading, decompressing gzip by extension.
pub fn open_maybe_gz(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if is_gz(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(
            file,
        )))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn is_gz(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

/// A buffered file writer, gzip-compressing by extension.
///
/// Unlike a plain boxed writer this has an explicit [`FileWriter::finish`],
/// so compressed output is flushed on every exit path instead of silently
/// in a drop.
pub enum FileWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl FileWriter {
    pub fn create(path: &Path) -> io::Result<FileWriter> {
        let buf = BufWriter::new(File::create(path)?);
        if is_gz(path) {
            Ok(FileWriter::Gzip(GzEncoder::new(buf, Compression::default())))
        } else {
            Ok(FileWriter::Plain(buf))
        }
    }

    pub fn finish(self) -> io::Result<()> {
        match self {
            FileWriter::Plain(mut w) => w.flush(),
            FileWriter::Gzip(gz) => gz.finish()?.flush(),
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Plain(w) => w.write(buf),
            FileWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Plain(w) => w.flush(),
            FileWriter::Gzip(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_percf() {
        assert_eq!(percf(1, 4), "25%");
        assert_eq!(percf(0, 4), "0%");
    }

    #[test]
    fn test_file_roundtrip_plain_and_gz() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plain.txt", "zipped.txt.gz"] {
            let path = dir.path().join(name);
            let mut w = FileWriter::create(&path).unwrap();
            w.write_all(b"hello\nworld\n").unwrap();
            w.finish().unwrap();

            let mut text = String::new();
            open_maybe_gz(&path)
                .unwrap()
                .read_to_string(&mut text)
                .unwrap();
            assert_eq!(text, "hello\nworld\n");
        }
    }
}
