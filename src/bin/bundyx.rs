//! Creates the mappability bucket tables consumed by bundy.
//!
//! Every reference contig is shredded into overlapping synthetic reads
//! by the aligner's `-F <len,step>` mode and mapped back against the
//! full reference. The rate at which a region's reads find their way
//! home is its self-mappability score.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::bail;
use clap::Parser;
use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

use bundy::bowtie;
use bundy::buckets::{pos_to_buckets, BucketRecord};
use bundy::error::{Error, Result};
use bundy::sam::SamRecord;
use bundy::utils::{get_spinner, open_maybe_gz, FileWriter};

/// Synthetic reads mapping back below this quality do not count.
const QUAL_THRESH: u8 = 2;
/// Step between consecutive synthetic reads; counts are projected back
/// to full coverage by this factor.
const READ_STEP: usize = 4;

/// Builds bundy's bucket tables from reference genomes.
#[derive(Parser)]
#[clap(version, about)]
struct Cli {
    /// Input genome files glob (fasta)
    #[clap(short = 'i')]
    input: String,

    /// Bowtie2 reference index prefix
    #[clap(short = 'r')]
    reference: String,

    /// Output bucket-table file
    #[clap(short = 'o')]
    output: PathBuf,

    /// Synthetic read length
    #[clap(short = 'l')]
    read_len: usize,

    /// Part number, 1-based
    #[clap(short = 'p', default_value_t = 1)]
    part: u64,

    /// Total number of parts
    #[clap(long = "np", default_value_t = 1)]
    nparts: u64,

    /// Number of bowtie2 threads
    #[clap(short = 't', default_value_t = 1)]
    threads: usize,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(2);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.read_len == 0 {
        bail!("bad read length (-l): 0");
    }
    if cli.part == 0 || cli.part > cli.nparts {
        bail!("bad part number (-p): {}/{}", cli.part, cli.nparts);
    }
    let files: Vec<PathBuf> = glob::glob(&cli.input)?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Io(e.into_error()))?;
    if files.is_empty() {
        bail!("no input files found (-i)");
    }

    eprintln!("Found {} input files", files.len());
    eprintln!("Read length: {}", cli.read_len);
    eprintln!("Read step: {READ_STEP}");
    eprintln!("Qual: {QUAL_THRESH}");
    eprintln!("Part: {}/{}", cli.part, cli.nparts);

    eprintln!("Starting");
    let t = Instant::now();
    let (part, nparts) = (cli.part, cli.nparts);
    let shred = vec!["-F".to_string(), format!("{},{}", cli.read_len, READ_STEP)];
    let sams = bowtie::map_feed(
        move |w: &mut dyn Write| feed_fasta(&files, part, nparts, w),
        &cli.reference,
        cli.threads,
        &shred,
    )?;

    check_sam(sams, &cli.output)?;
    eprintln!("Took {:.1?}", t.elapsed());
    eprintln!("Done");
    Ok(())
}

/// Streams the contigs of this shard as fasta into the aligner.
fn feed_fasta(files: &[PathBuf], part: u64, nparts: u64, w: &mut dyn Write) -> Result<()> {
    let mut out = bio::io::fasta::Writer::new(w);
    for file in files {
        let reader = bio::io::fasta::Reader::new(open_maybe_gz(file)?);
        for record in reader.records() {
            let record =
                record.map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            if xxh3_64(record.id().as_bytes()) % nparts != part - 1 {
                continue;
            }
            out.write(record.id(), None, record.seq())?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Aggregates the self-mapping results per origin contig and writes the
/// bucket-table records.
fn check_sam<I>(sams: I, output: &PathBuf) -> anyhow::Result<()>
where
    I: Iterator<Item = Result<SamRecord>>,
{
    let mut all: HashMap<String, usize> = HashMap::new();
    let mut ok: HashMap<String, usize> = HashMap::new();
    let mut ok_pos: HashMap<String, HashSet<usize>> = HashMap::new();

    // Synthetic read names are "<contig>_<offset>".
    let name_re = Regex::new(r"^(.*)_(\d+)$").unwrap();

    let bar = get_spinner("reads");
    for rec in sams {
        let rec = rec?;
        bar.inc(1);
        let caps = name_re
            .captures(&rec.qname)
            .ok_or_else(|| Error::BadReadName(rec.qname.clone()))?;
        let rname = caps[1].to_string();
        *all.entry(rname.clone()).or_insert(0) += 1;
        if rec.is_unmapped() {
            continue;
        }
        if rec.mapq < QUAL_THRESH {
            continue;
        }
        *ok.entry(rname.clone()).or_insert(0) += 1;
        ok_pos.entry(rname).or_default().insert(rec.pos);
    }
    bar.finish();

    let empty = HashSet::new();
    let mut out = FileWriter::create(output)?;
    for (name, n_all) in all {
        let n_all = n_all * READ_STEP;
        let record = BucketRecord {
            all: n_all,
            ok: ok.get(&name).copied().unwrap_or(0) * READ_STEP,
            buckets: pos_to_buckets(n_all, ok_pos.get(&name).unwrap_or(&empty), READ_STEP),
            name,
        };
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
    }
    out.finish()?;
    eprintln!("Wrote to: {}", output.display());
    Ok(())
}
