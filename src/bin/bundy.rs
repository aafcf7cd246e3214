//! Calculates relative abundances.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use regex::Regex;

use bundy::abundance::{entries_to_abundances, species_key, to_sum1, write_json, write_tsv};
use bundy::bowtie;
use bundy::buckets::{load_buckets, ContigEntry};
use bundy::config::EstimatorConfig;
use bundy::error::Error;
use bundy::sam::SamRecord;
use bundy::spool::SamSpool;
use bundy::utils::{get_spinner, percf, FileWriter};

/// Estimates relative genome abundances in a fastq sample.
#[derive(Parser)]
#[clap(version, about)]
struct Cli {
    /// Input fastq file
    #[clap(short = 'i')]
    input: String,

    /// Second input fastq file for paired-end
    #[clap(long = "i2")]
    input2: Option<String>,

    /// Input fastq has interleaved paired-end reads
    #[clap(long)]
    interleaved: bool,

    /// Bowtie2 reference index prefix
    #[clap(short = 'r')]
    reference: String,

    /// Bucket-table files glob, as produced by bundyx
    #[clap(short = 'x')]
    buckets: String,

    /// Output file
    #[clap(short = 'o')]
    output: String,

    /// Output JSON instead of TSV
    #[clap(short = 'j')]
    json: bool,

    /// Pattern by which to group contigs of the same species
    #[clap(short = 'n', default_value = ".*")]
    name_pattern: String,

    /// Number of bowtie2 threads
    #[clap(short = 't', default_value_t = 1)]
    threads: usize,

    /// Quick run, loses some accuracy
    #[clap(long)]
    fast: bool,

    /// Ignore genome lengths in normalization
    #[clap(long = "ignlen")]
    ignore_length: bool,

    /// Spool SAM to this directory instead of compressed memory
    #[clap(long = "diskmode")]
    disk_mode: Option<PathBuf>,

    /// Dump unused reads to this fastq
    #[clap(short = 'u')]
    unused_fastq: Option<PathBuf>,

    /// Dump used reads to this fastq
    #[clap(long = "uu")]
    used_fastq: Option<PathBuf>,

    /// Dump unused reads to this SAM file
    #[clap(long = "us")]
    unused_sam: Option<PathBuf>,

    /// Dump used reads to this SAM file
    #[clap(long = "uus")]
    used_sam: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(2);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    fs::metadata(&cli.input)
        .with_context(|| format!("unable to access input file: {}", cli.input))?;
    let name_re =
        Regex::new(&cli.name_pattern).context("invalid species pattern (-n)")?;
    let config = EstimatorConfig::new(name_re, cli.ignore_length);

    eprintln!("Running with:");
    eprintln!("\tRef:\t{}", cli.reference);
    eprintln!("\tOKs:\t{}", cli.buckets);
    eprintln!("\tRegex:\t{}", config.name_pattern);
    eprintln!();

    eprintln!("Loading bucket tables");
    let mut entries = load_buckets(&cli.buckets)?;
    eprintln!("Loaded {} contigs", entries.len());

    let mut spool = match &cli.disk_mode {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            SamSpool::on_disk(dir.join("spool.sam"))?
        }
        None => SamSpool::in_memory()?,
    };

    eprintln!("Mapping");
    let extra: Vec<String> = if cli.fast {
        vec!["--very-fast".to_string()]
    } else {
        Vec::new()
    };
    let sams = if let Some(fq2) = &cli.input2 {
        bowtie::map_paired(&cli.input, fq2, &cli.reference, cli.threads, &extra)?
    } else if cli.interleaved {
        bowtie::map_interleaved(&cli.input, &cli.reference, cli.threads, &extra)?
    } else {
        bowtie::map_file(&cli.input, &cli.reference, cli.threads, &extra)?
    };

    let mut stats = PassStats::default();
    let bar = get_spinner("reads processed");
    for rec in sams {
        let rec = rec?;
        bar.inc(1);
        spool.write_record(&rec)?;
        count_record(&rec, &mut entries, config.pass1.qual_thresh, &mut stats)?;
    }
    bar.finish();
    spool.close()?;
    stats.report();

    // The strict pass picks the candidate genomes; everything else is
    // masked out of the final table.
    let whitelist: HashSet<String> = entries_to_abundances(
        &entries,
        &config.name_pattern,
        &config.pass1,
        config.ignore_length,
    )
    .into_keys()
    .collect();
    eprintln!("Found {} candidate genomes", whitelist.len());

    for e in entries.values_mut() {
        e.clear_counts();
    }

    let mut stats = PassStats::default();
    let bar = get_spinner("reads processed");
    for rec in spool.iter()? {
        let rec = rec?;
        bar.inc(1);
        count_record(&rec, &mut entries, config.pass2.qual_thresh, &mut stats)?;
    }
    bar.finish();
    stats.report();

    let mut abnd = entries_to_abundances(
        &entries,
        &config.name_pattern,
        &config.pass2,
        config.ignore_length,
    );
    abnd.retain(|k, _| whitelist.contains(k));
    to_sum1(&mut abnd);
    eprintln!("Grouped to {} genomes", abnd.len());

    eprintln!("Saving");
    if cli.json {
        write_json(&cli.output, &abnd)?;
    } else {
        write_tsv(&cli.output, &abnd)?;
    }

    dump_reads(&cli, &config, &spool, &abnd, stats.all)?;

    eprintln!("Done");
    Ok(())
}

#[derive(Default)]
struct PassStats {
    all: usize,
    unmapped: usize,
    low_quality: usize,
}

impl PassStats {
    fn report(&self) {
        eprintln!(
            "Mapped OK {} | Low quality {} | Unmapped {}",
            percf(self.all - self.unmapped - self.low_quality, self.all),
            percf(self.low_quality, self.all),
            percf(self.unmapped, self.all),
        );
    }
}

fn count_record(
    rec: &SamRecord,
    entries: &mut HashMap<String, ContigEntry>,
    qual_thresh: u8,
    stats: &mut PassStats,
) -> Result<(), Error> {
    stats.all += 1;
    if rec.is_unmapped() {
        stats.unmapped += 1;
        return Ok(());
    }
    if rec.mapq < qual_thresh {
        stats.low_quality += 1;
        return Ok(());
    }
    entries
        .get_mut(&rec.rname)
        .ok_or_else(|| Error::UnknownContig(rec.rname.clone()))?
        .add_pos(rec.pos);
    Ok(())
}

/// Replays the spool once more and splits the reads into used (properly
/// aligned at lenient quality, to a species with final abundance) and
/// unused, dumping either set as fastq and/or SAM.
fn dump_reads(
    cli: &Cli,
    config: &EstimatorConfig,
    spool: &SamSpool,
    abnd: &HashMap<String, f64>,
    total: usize,
) -> anyhow::Result<()> {
    let mut unused_fq = create_opt(&cli.unused_fastq)?;
    let mut used_fq = create_opt(&cli.used_fastq)?;
    let mut unused_sam = create_opt(&cli.unused_sam)?;
    let mut used_sam = create_opt(&cli.used_sam)?;
    if unused_fq.is_none() && used_fq.is_none() && unused_sam.is_none() && used_sam.is_none() {
        return Ok(());
    }

    eprintln!("Collecting used and unused reads");
    let mut n_unused = 0;
    let bar = get_spinner("reads processed");
    for rec in spool.iter()? {
        let rec = rec?;
        bar.inc(1);
        let abundance = abnd
            .get(&species_key(&config.name_pattern, &rec.rname))
            .copied()
            .unwrap_or(0.0);
        let used = rec.is_properly_aligned()
            && rec.mapq >= config.pass2.qual_thresh
            && abundance > 0.0;

        let (fq, sam) = if used {
            (&mut used_fq, &mut used_sam)
        } else {
            n_unused += 1;
            (&mut unused_fq, &mut unused_sam)
        };
        if let Some(w) = fq {
            rec.write_as_fastq(w)?;
        }
        if let Some(w) = sam {
            writeln!(w, "{}", rec.to_line())?;
        }
    }
    bar.finish();
    eprintln!("Dumped {}", percf(n_unused, total));

    for w in [unused_fq, used_fq, unused_sam, used_sam].into_iter().flatten() {
        w.finish()?;
    }
    Ok(())
}

fn create_opt(path: &Option<PathBuf>) -> anyhow::Result<Option<FileWriter>> {
    Ok(match path {
        Some(p) => Some(FileWriter::create(p)?),
        None => None,
    })
}
