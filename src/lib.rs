//! # bundy
//!
//! Estimates the relative abundance of microbial genomes in a short-read
//! sequencing sample.
//!
//! The sample is mapped against a prebuilt reference with bowtie2, every
//! alignment is attributed to a bucket of its contig, and the per-bucket
//! counts are collapsed into one normalized number per species.
//!
//! # Basics of the library
//! The pipeline around which everything is arranged:
//!
//! 1. [`bowtie`] runs the aligner and yields a lazy stream of
//!    [`sam::SamRecord`]s.
//! 2. [`spool::SamSpool`] captures the records during mapping so later
//!    passes replay them without rerunning the aligner.
//! 3. [`buckets`] holds the per-contig bucket tables produced by the
//!    `bundyx` indexer and counts alignments into them.
//! 4. [`abundance`] groups contigs into species, runs the dense-sum
//!    estimator with the binomial-error veto, and writes the final
//!    TSV/JSON table.
//!
//! The `bundy` binary drives two counting passes over the same spool: a
//! strict pass picks a whitelist of credible species, a lenient pass
//! re-attributes reads to them for the final estimate.
//!
//! ## Counting into bucket tables
//! ```rust, no_run
//! # use bundy::buckets::load_buckets;
//! let mut entries = load_buckets("refs/*.jsons").unwrap();
//! entries.get_mut("speciesA_ctg1").unwrap().add_pos(1500);
//! ```
//!
//! ## From counts to abundances
//! ```rust, no_run
//! # use std::collections::HashMap;
//! # use bundy::abundance::entries_to_abundances;
//! # use bundy::config::PassParams;
//! # let entries = HashMap::new();
//! let re = regex::Regex::new("^[^_]+").unwrap();
//! let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), false);
//! ```

pub mod abundance;
pub mod bowtie;
pub mod buckets;
pub mod config;
pub mod error;
pub mod sam;
pub mod spool;
pub mod utils;
