//! From per-contig counts to a normalized species abundance table.
//!
//! Contigs are grouped into species by a name regex. Each contig
//! contributes one coverage-corrected rate per bucket; buckets too
//! unmappable to trust are dropped together with their share of the
//! species totals. The flat per-species rate vector is then collapsed by
//! the dense-sum estimator, vetoed by the binomial-error filter, length
//! normalized and finally scaled to sum to 1.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use itertools::Itertools;
use regex::Regex;

use crate::buckets::ContigEntry;
use crate::config::PassParams;
use crate::error::Result;
use crate::utils::FileWriter;

/// A bucket is dropped when its self-mappability is below this fraction
/// of the bucket size.
const MIN_OK_FRACTION: usize = 10;

/// The species key of a contig: the regex's first match in its name.
/// Unmatched contigs share the empty key.
pub fn species_key(name_re: &Regex, contig: &str) -> String {
    name_re
        .find(contig)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

struct SpeciesAggregate {
    /// Self-mappable positions over retained buckets.
    ok: usize,
    /// Positions over retained buckets.
    all: usize,
    /// Bucket population before any dropping.
    n_buckets: usize,
    /// Coverage-corrected per-bucket rates of all member contigs.
    norm_counts: Vec<f64>,
}

/// Collapses the populated contig map into per-species abundances.
///
/// The returned map holds only species with a positive estimate and is
/// normalized to sum to 1.
pub fn entries_to_abundances(
    entries: &HashMap<String, ContigEntry>,
    name_re: &Regex,
    params: &PassParams,
    ignore_length: bool,
) -> HashMap<String, f64> {
    let mut aggs: HashMap<String, SpeciesAggregate> = HashMap::new();

    for (name, e) in entries {
        let agg = aggs
            .entry(species_key(name_re, name))
            .or_insert_with(|| SpeciesAggregate {
                ok: 0,
                all: 0,
                n_buckets: 0,
                norm_counts: Vec::new(),
            });

        let n = e.buckets.ok.len();
        agg.n_buckets += n;
        let bucket_size = e.all / n;
        // The contig contributes its totals minus the dropped buckets'
        // share, which equals summing only retained buckets.
        let mut kept_ok = e.ok;
        let mut kept_all = e.all;
        for (i, &ok_i) in e.buckets.ok.iter().enumerate() {
            if ok_i < bucket_size / MIN_OK_FRACTION {
                kept_ok -= ok_i;
                kept_all -= bucket_size;
                continue;
            }
            let cnt = e.counts.as_ref().map_or(0, |c| c[i]);
            let rate = cnt as f64 * bucket_size as f64 / ok_i as f64;
            if rate.is_finite() {
                agg.norm_counts.push(rate);
            }
        }
        agg.ok += kept_ok;
        agg.all += kept_all;
    }

    let mut abnd = HashMap::new();
    let mut filtered_binom = 0;
    for (key, mut agg) in aggs {
        let mut sum = dense_sum(
            &mut agg.norm_counts,
            params.dense_sum_ratio,
            params.min_nonzero,
        );
        if sum > 0.0
            && params.max_binomial_err > 0.0
            && binomial_error(&agg.norm_counts, agg.n_buckets) > params.max_binomial_err
        {
            sum = 0.0;
            filtered_binom += 1;
        }
        if sum == 0.0 || agg.ok == 0 {
            continue;
        }
        let a = if ignore_length {
            sum * agg.all as f64 / agg.ok as f64
        } else {
            sum / agg.all as f64
        };
        abnd.insert(key, a);
    }
    if params.max_binomial_err > 0.0 {
        eprintln!("Filtered binom: {filtered_binom}");
    }
    to_sum1(&mut abnd);
    abnd
}

/// The outlier-robust sum of a species' rate vector.
///
/// Sorts, slides a window of `(ratio-1)/ratio` of the length over the
/// sorted values, takes the narrowest-spread window and scales its sum
/// back to the full length. `nz` is a quantile guard: if the value at
/// the top `nz` quantile is still zero the species is considered absent.
pub fn dense_sum(a: &mut [f64], ratio: usize, nz: f64) -> f64 {
    // No use for a window. For len=2 it would return the lower value.
    if a.len() <= 1 {
        return a.iter().sum();
    }

    a.sort_by(f64::total_cmp);
    let n = a.len();
    if nz != 0.0 {
        let i = n - 1 - ((n - 1) as f64 * nz).round() as usize;
        if a[i] == 0.0 {
            return 0.0; // Too many zeros.
        }
    }

    let mut winlen = n;
    if ratio > 1 {
        winlen = n * (ratio - 1) / ratio;
        if winlen == n {
            winlen -= 1;
        }
    }

    let mut min_diff = f64::INFINITY;
    let mut start = 0;
    for i in 0..=(n - winlen) {
        let diff = a[i + winlen - 1] - a[i];
        if diff < min_diff {
            min_diff = diff;
            start = i;
        }
    }
    a[start..start + winlen].iter().sum::<f64>() * n as f64 / winlen as f64
}

/// A relative-noise heuristic on a species' rate vector: sqrt of the
/// dropped-bucket fraction over the summed rates. Large values mean the
/// estimate rests on too few observations.
pub fn binomial_error(a: &[f64], n_buckets: usize) -> f64 {
    let n = a.len() as f64;
    let k: f64 = a.iter().sum();
    let q = (n_buckets as f64 - n) / n_buckets as f64;
    (q / k).sqrt()
}

/// Scales the map's values to sum to 1.
pub fn to_sum1(m: &mut HashMap<String, f64>) {
    let sum: f64 = m.values().sum();
    for v in m.values_mut() {
        *v /= sum;
    }
}

/// Writes `species<TAB>abundance` lines, descending by abundance.
pub fn write_tsv<P: AsRef<Path>>(path: P, abnd: &HashMap<String, f64>) -> Result<()> {
    let mut w = FileWriter::create(path.as_ref())?;
    let sorted = abnd
        .iter()
        .sorted_by(|a, b| b.1.total_cmp(a.1).then(a.0.cmp(b.0)));
    for (k, v) in sorted {
        writeln!(w, "{k}\t{v}")?;
    }
    w.finish()?;
    Ok(())
}

/// Writes the abundances as a single JSON object.
pub fn write_json<P: AsRef<Path>>(path: P, abnd: &HashMap<String, f64>) -> Result<()> {
    let mut w = FileWriter::create(path.as_ref())?;
    serde_json::to_writer(&mut w, abnd)?;
    w.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::BucketOks;
    use statrs::assert_almost_eq;

    const TOL: f64 = 1e-12;

    fn contig(all: usize, ok_total: usize, pos: Vec<usize>, ok: Vec<usize>) -> ContigEntry {
        ContigEntry {
            ok: ok_total,
            all,
            buckets: BucketOks { pos, ok },
            counts: None,
        }
    }

    #[test]
    fn test_dense_sum_short_vectors() {
        let mut a: [f64; 0] = [];
        assert_eq!(dense_sum(&mut a, 20, 0.01), 0.0);
        let mut a = [7.5];
        assert_eq!(dense_sum(&mut a, 20, 0.01), 7.5);
    }

    #[test]
    fn test_dense_sum_ratio_one_is_plain_sum() {
        let mut a = [3.0, 1.0, 2.0, 4.0];
        assert_almost_eq!(dense_sum(&mut a, 1, 0.0), 10.0, TOL);
    }

    #[test]
    fn test_dense_sum_scales_uniformly() {
        let base = [0.5, 1.0, 1.5, 2.0, 8.0, 1.2, 0.9, 1.1, 30.0, 1.3];
        let mut a = base;
        let s1 = dense_sum(&mut a, 5, 0.0);
        let mut scaled: Vec<f64> = base.iter().map(|x| x * 3.0).collect();
        let s3 = dense_sum(&mut scaled, 5, 0.0);
        assert_almost_eq!(s3, 3.0 * s1, 1e-9);
    }

    #[test]
    fn test_dense_sum_excludes_outliers() {
        // 8 well-behaved buckets around 1.0 plus two wild outliers; the
        // window (ratio 5 -> winlen 8) must cover exactly the tight part.
        let mut a = [1.0, 1.1, 0.9, 1.0, 1.05, 0.95, 1.0, 1.0, 50.0, 0.0];
        let sum = dense_sum(&mut a, 5, 0.0);
        let tight: f64 = 8.0 * 1.0; // roughly
        assert!((sum - tight * 10.0 / 8.0).abs() < 0.5, "sum = {sum}");
    }

    #[test]
    fn test_dense_sum_nonzero_guard() {
        // 2 of 10 entries non-zero; the 0.66 quantile value is 0.
        let mut a = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 5.0];
        assert_eq!(dense_sum(&mut a, 20, 0.66), 0.0);

        // same data passes with the loose pass-1 guard
        let mut a2 = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 5.0];
        assert!(dense_sum(&mut a2, 20, 0.01) > 0.0);
    }

    #[test]
    fn test_binomial_error() {
        // no dropped buckets, some counts -> zero error
        assert_eq!(binomial_error(&[1.0, 1.0], 2), 0.0);

        // monotonically decreasing in k with n and N fixed
        let e1 = binomial_error(&[1.0, 1.0, 0.0, 0.0], 8);
        let e2 = binomial_error(&[2.0, 2.0, 0.0, 0.0], 8);
        let e3 = binomial_error(&[4.0, 4.0, 0.0, 0.0], 8);
        assert!(e1 > e2 && e2 > e3);
        assert_almost_eq!(e1, (0.5_f64 / 2.0).sqrt(), TOL);

        // k = 0: no signal at all
        assert!(binomial_error(&[0.0, 0.0], 2).is_nan());
        assert!(binomial_error(&[0.0, 0.0], 4).is_infinite());
    }

    #[test]
    fn test_to_sum1() {
        let mut m = HashMap::from([("a".to_string(), 1.0), ("b".to_string(), 3.0)]);
        to_sum1(&mut m);
        assert_almost_eq!(m["a"], 0.25, TOL);
        assert_almost_eq!(m["b"], 0.75, TOL);
        assert_almost_eq!(m.values().sum::<f64>(), 1.0, TOL);
    }

    #[test]
    fn test_single_species_is_one() {
        let mut e = contig(2000, 2000, vec![1000], vec![1000, 1000]);
        for _ in 0..10 {
            e.add_pos(10);
            e.add_pos(1500);
        }
        let entries = HashMap::from([("speciesA_ctg1".to_string(), e)]);
        let re = Regex::new("^speciesA").unwrap();
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), false);
        assert_eq!(abnd.len(), 1);
        assert_almost_eq!(abnd["speciesA"], 1.0, TOL);
    }

    #[test]
    fn test_unmappable_bucket_dropped() {
        // second bucket far below bucket_size/10, reads only in the first
        let mut e = contig(2000, 1050, vec![1000], vec![1000, 50]);
        e.add_pos(500);
        let entries = HashMap::from([("s_ctg".to_string(), e)]);
        let re = Regex::new("^s").unwrap();

        // run the aggregation once with a params set that keeps everything
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), true);
        // with ignlen: abundance = sum * all / ok over *retained* totals,
        // all = 2000-1000, ok = 1050-50; sum = 1 * 1000/1000 = 1 (n=1)
        assert_eq!(abnd.len(), 1);
        assert_almost_eq!(abnd["s"], 1.0, TOL); // normalized to 1 anyway

        // the retained bookkeeping shows through without normalization:
        // a second species with no dropped buckets and equal rates
        let mut e1 = contig(2000, 1050, vec![1000], vec![1000, 50]);
        e1.add_pos(500);
        let mut e2 = contig(1000, 1000, vec![], vec![1000]);
        e2.add_pos(500);
        let entries = HashMap::from([
            ("a_ctg".to_string(), e1),
            ("b_ctg".to_string(), e2),
        ]);
        let re = Regex::new("^[ab]").unwrap();
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), false);
        // both species end up with rate 1 read per retained 1000 positions
        assert_almost_eq!(abnd["a"], abnd["b"], TOL);
    }

    #[test]
    fn test_binomial_veto() {
        // Both species have 10 buckets of which 5 are unmappable, so the
        // error term sqrt(0.5/k) is live. The weak species has k = 5
        // (err 0.32), the strong one k = 500 (err 0.03) at the same mean
        // spread, so only the weak one is vetoed.
        let ok = vec![1000, 1000, 1000, 1000, 1000, 10, 10, 10, 10, 10];
        let bounds: Vec<usize> = (1..10).map(|i| i * 1000).collect();

        let mut weak = contig(10_000, 5050, bounds.clone(), ok.clone());
        let mut strong = contig(10_000, 5050, bounds, ok);
        for i in 0..5 {
            weak.add_pos(i * 1000 + 500);
            for _ in 0..100 {
                strong.add_pos(i * 1000 + 500);
            }
        }
        let entries = HashMap::from([
            ("weak_ctg".to_string(), weak),
            ("strong_ctg".to_string(), strong),
        ]);
        let re = Regex::new("^[a-z]+").unwrap();
        let abnd = entries_to_abundances(&entries, &re, &PassParams::lenient(), false);
        assert!(abnd.contains_key("strong"));
        assert!(!abnd.contains_key("weak"));

        // the same weak species passes with the filter disabled
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), false);
        assert!(abnd.contains_key("weak"));
    }

    #[test]
    fn test_ignore_length_changes_ratio() {
        // speciesA: 20kb, 300 reads; speciesB: 10kb, 100 reads, uniform
        let mut a = contig(20_000, 20_000, (1..20).map(|i| i * 1000).collect(), vec![1000; 20]);
        for i in 0..20 {
            for _ in 0..15 {
                a.add_pos(i * 1000 + 1);
            }
        }
        let mut b = contig(10_000, 10_000, (1..10).map(|i| i * 1000).collect(), vec![1000; 10]);
        for i in 0..10 {
            for _ in 0..10 {
                b.add_pos(i * 1000 + 1);
            }
        }
        let entries = HashMap::from([
            ("speciesA_c1".to_string(), a),
            ("speciesB_c1".to_string(), b),
        ]);
        let re = Regex::new("^species[AB]").unwrap();

        // length-normalized: per-position rates 300/20k vs 100/10k = 3:2
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), false);
        assert_almost_eq!(abnd["speciesA"] / abnd["speciesB"], 1.5, 1e-9);

        // raw: dense sums proportional to read counts, 3:1
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), true);
        assert_almost_eq!(abnd["speciesA"] / abnd["speciesB"], 3.0, 1e-9);
    }

    #[test]
    fn test_unallocated_counts_are_zero() {
        let e = contig(2000, 2000, vec![1000], vec![1000, 1000]);
        let entries = HashMap::from([("x_ctg".to_string(), e)]);
        let re = Regex::new("^x").unwrap();
        let abnd = entries_to_abundances(&entries, &re, &PassParams::strict(), false);
        assert!(abnd.is_empty());
    }

    #[test]
    fn test_write_tsv_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abnd.tsv");
        let m = HashMap::from([
            ("low".to_string(), 0.25),
            ("high".to_string(), 0.75),
        ]);
        write_tsv(&path, &m).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "high\t0.75\nlow\t0.25\n");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abnd.json");
        let m = HashMap::from([("a".to_string(), 1.0)]);
        write_json(&path, &m).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: HashMap<String, f64> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }
}
