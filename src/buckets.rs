//! Per-contig bucket tables and the counts accumulated against them.
//!
//! The indexer partitions every contig into equal slices ("buckets") and
//! scores how self-mappable each one is. The estimator loads those tables
//! once, immutable, and attributes every counted alignment to a bucket by
//! position. Tables travel as newline-delimited JSON, one object per
//! contig; multiple files may be concatenated and order is irrelevant.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::open_maybe_gz;

/// Positions per bucket in a freshly built table.
pub const BUCKET_SPAN: usize = 1000;

/// Bucket boundaries and per-bucket self-mappability of one contig.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BucketOks {
    /// Ascending upper boundaries; the last bucket's boundary is implicit.
    #[serde(rename = "Buckets")]
    pub pos: Vec<usize>,
    /// Self-mappable positions per bucket, projected by the read step.
    #[serde(rename = "OK")]
    pub ok: Vec<usize>,
}

impl BucketOks {
    /// The bucket covering a 1-based position: the first whose upper
    /// boundary is >= `pos`, or the last bucket past all boundaries.
    pub fn bucket_of(&self, pos: usize) -> usize {
        self.pos.partition_point(|&b| b < pos)
    }
}

/// One contig's record in a bucket-table file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BucketRecord {
    pub name: String,
    pub all: usize,
    pub ok: usize,
    pub buckets: BucketOks,
}

/// A contig's bucket table plus the counts collected during a pass.
#[derive(Debug, Clone)]
pub struct ContigEntry {
    /// Total self-mappable positions.
    pub ok: usize,
    /// Contig length.
    pub all: usize,
    pub buckets: BucketOks,
    /// Allocated on the first hit, discarded between passes.
    pub counts: Option<Vec<u32>>,
}

impl ContigEntry {
    pub fn new(record: BucketRecord) -> ContigEntry {
        ContigEntry {
            ok: record.ok,
            all: record.all,
            buckets: record.buckets,
            counts: None,
        }
    }

    /// Counts one alignment at the given 1-based position.
    pub fn add_pos(&mut self, pos: usize) {
        let n = self.buckets.ok.len();
        let counts = self.counts.get_or_insert_with(|| vec![0; n]);
        counts[self.buckets.bucket_of(pos)] += 1;
    }

    pub fn clear_counts(&mut self) {
        self.counts = None;
    }
}

/// Loads every bucket-table file matching the glob into one map keyed by
/// contig name. An empty match is an error: without tables there is
/// nothing to count against.
pub fn load_buckets(pattern: &str) -> Result<HashMap<String, ContigEntry>> {
    let files: Vec<_> = glob::glob(pattern)?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Io(e.into_error()))?;
    if files.is_empty() {
        return Err(Error::NoBucketFiles(pattern.to_string()));
    }

    let mut entries = HashMap::new();
    for file in files {
        for line in open_maybe_gz(&file)?.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: BucketRecord = serde_json::from_str(&line)?;
            entries.insert(record.name.clone(), ContigEntry::new(record));
        }
    }
    Ok(entries)
}

/// Builds a contig's bucket table from the positions its synthetic reads
/// mapped back to. Boundaries are evenly spaced; each observed position
/// adds `read_step` to its bucket, projecting the subsampled reads back
/// to full coverage.
pub fn pos_to_buckets(all: usize, ok_pos: &HashSet<usize>, read_step: usize) -> BucketOks {
    let n_buckets = std::cmp::max(1, all / BUCKET_SPAN);
    let pos: Vec<usize> = (1..n_buckets).map(|i| all * i / n_buckets).collect();
    let mut ok = vec![0; n_buckets];
    for &p in ok_pos {
        let i = pos.partition_point(|&b| b < p);
        ok[i] += read_step;
    }
    BucketOks { pos, ok }
}
