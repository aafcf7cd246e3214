use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("aligner failed ({status})\n{stderr}")]
    Aligner { status: ExitStatus, stderr: String },

    #[error("invalid SAM line: {0}")]
    SamParse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid glob pattern: {0}")]
    BadGlob(#[from] glob::PatternError),

    #[error("no bucket table files match {0}")]
    NoBucketFiles(String),

    #[error("contig {0} missing from the bucket tables, reference/index mismatch?")]
    UnknownContig(String),

    #[error("unexpected synthetic read name: {0}")]
    BadReadName(String),

    #[error("spool is still open for writing")]
    SpoolNotClosed,

    #[error("spool is closed for writing")]
    SpoolClosed,
}
