//! Running bowtie2 and streaming its alignments.
//!
//! The aligner runs as a subprocess with headers suppressed; its stdout
//! is parsed lazily into [`SamRecord`]s. Standard error is captured by a
//! background thread that also awaits the process and hands the exit
//! status back over a capacity-1 channel, so a failed run surfaces as the
//! terminal item of the stream with the aligner's own messages attached.

use std::io::{self, BufReader, Read, Write};
use std::process::{ChildStdout, Command, ExitStatus, Stdio};
use std::thread;

use crossbeam::channel::{bounded, Receiver};

use crate::error::{Error, Result};
use crate::sam::{SamReader, SamRecord};

const EXE: &str = "bowtie2";

/// Maps the given fastq file and returns a real-time stream of alignments.
pub fn map_file(fq: &str, reference: &str, threads: usize, extra: &[String]) -> Result<SamStream> {
    let mut cmd = base_command(reference, threads);
    cmd.arg("-U").arg(fq).args(extra);
    SamStream::spawn(cmd, None)
}

/// Maps a paired-end sample from two fastq files.
pub fn map_paired(
    fq1: &str,
    fq2: &str,
    reference: &str,
    threads: usize,
    extra: &[String],
) -> Result<SamStream> {
    let mut cmd = base_command(reference, threads);
    cmd.arg("-1").arg(fq1).arg("-2").arg(fq2).args(extra);
    SamStream::spawn(cmd, None)
}

/// Maps an interleaved paired-end fastq file.
pub fn map_interleaved(
    fq: &str,
    reference: &str,
    threads: usize,
    extra: &[String],
) -> Result<SamStream> {
    let mut cmd = base_command(reference, threads);
    cmd.arg("--interleaved").arg(fq).args(extra);
    SamStream::spawn(cmd, None)
}

/// Maps an arbitrary byte stream of reads via the aligner's stdin.
pub fn map_reader<R>(input: R, reference: &str, threads: usize, extra: &[String]) -> Result<SamStream>
where
    R: Read + Send + 'static,
{
    map_feed(
        move |w: &mut dyn Write| {
            let mut input = input;
            io::copy(&mut input, w)?;
            Ok(())
        },
        reference,
        threads,
        extra,
    )
}

/// Maps reads produced on the fly: `feed` writes them into the aligner's
/// stdin from a background thread. A feed error is reported at the end of
/// the stream, after the aligner itself has been awaited.
pub fn map_feed<F>(feed: F, reference: &str, threads: usize, extra: &[String]) -> Result<SamStream>
where
    F: FnOnce(&mut dyn Write) -> Result<()> + Send + 'static,
{
    let mut cmd = base_command(reference, threads);
    cmd.arg("-U").arg("-").args(extra);
    SamStream::spawn(cmd, Some(Box::new(feed)))
}

fn base_command(reference: &str, threads: usize) -> Command {
    let mut cmd = Command::new(EXE);
    cmd.arg("-t")
        .arg("--no-head")
        .arg("-p")
        .arg(threads.to_string())
        .arg("-x")
        .arg(reference);
    cmd
}

/// A lazy stream of alignments from a running aligner process.
///
/// Records are yielded in emission order. A parse error ends the stream;
/// a non-zero aligner exit is yielded as the terminal item once the SAM
/// output is exhausted. Dropping the stream early closes the output pipe,
/// which the subprocess observes as a broken pipe; the detached waiter
/// thread then reaps it.
pub struct SamStream {
    records: SamReader<BufReader<ChildStdout>>,
    status: Receiver<(io::Result<ExitStatus>, Vec<u8>)>,
    feed_err: Option<Receiver<Error>>,
    done: bool,
}

impl SamStream {
    fn spawn(
        mut cmd: Command,
        feed: Option<Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>>,
    ) -> Result<SamStream> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if feed.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout is piped");
        let mut stderr = child.stderr.take().expect("stderr is piped");

        let feed_err = feed.map(|feed| {
            let mut stdin = child.stdin.take().expect("stdin is piped");
            let (tx, rx) = bounded(1);
            thread::spawn(move || {
                if let Err(e) = feed(&mut stdin) {
                    let _ = tx.send(e);
                }
            });
            rx
        });

        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let mut captured = Vec::new();
            let _ = stderr.read_to_end(&mut captured);
            let status = child.wait();
            let _ = tx.send((status, captured));
        });

        Ok(SamStream {
            records: SamReader::new(BufReader::new(stdout)),
            status: rx,
            feed_err,
            done: false,
        })
    }

    /// Awaits the process once the output is exhausted.
    fn finish(&mut self) -> Option<Error> {
        let (status, stderr) = match self.status.recv() {
            Ok(v) => v,
            Err(_) => return None,
        };
        if let Some(rx) = &self.feed_err {
            if let Ok(e) = rx.try_recv() {
                return Some(e);
            }
        }
        match status {
            Ok(s) if s.success() => None,
            Ok(s) => Some(Error::Aligner {
                status: s,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }),
            Err(e) => Some(Error::Io(e)),
        }
    }
}

impl Iterator for SamStream {
    type Item = Result<SamRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.records.next() {
            Some(Ok(rec)) => Some(Ok(rec)),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                self.finish().map(Err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "r1\t0\tc1\t7\t40\t4M\t*\t0\t0\tACGT\tFFFF";

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_stream_ok() {
        let stream =
            SamStream::spawn(sh(&format!("printf '{LINE}\\n{LINE}\\n'")), None).unwrap();
        let records: Vec<_> = stream.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rname, "c1");
    }

    #[test]
    fn test_stream_exit_error_carries_stderr() {
        let stream =
            SamStream::spawn(sh("echo boom >&2; exit 3"), None).unwrap();
        let items: Vec<_> = stream.collect();
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(Error::Aligner { stderr, .. }) => assert!(stderr.contains("boom")),
            other => panic!("expected aligner error, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_feeds_stdin() {
        let stream = SamStream::spawn(
            sh("cat"),
            Some(Box::new(|w: &mut dyn Write| {
                writeln!(w, "{LINE}")?;
                Ok(())
            })),
        )
        .unwrap();
        let records: Vec<_> = stream.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pos, 7);
    }

    #[test]
    fn test_parse_error_fuses_stream() {
        let mut stream =
            SamStream::spawn(sh("printf 'not a sam line\\n'; sleep 0.1"), None).unwrap();
        assert!(matches!(stream.next(), Some(Err(Error::SamParse(_)))));
        assert!(stream.next().is_none());
    }
}
