//! Run-wide configuration of the abundance estimator.
//!
//! One immutable record is built from the command line and threaded
//! through both counting passes and the aggregation, instead of keeping
//! the thresholds as scattered globals.

use regex::Regex;

/// Thresholds and estimator parameters of a single counting pass.
#[derive(Debug, Clone)]
pub struct PassParams {
    /// Minimum mapping quality for a read to be counted.
    pub qual_thresh: u8,
    /// Window ratio of the dense-sum estimator.
    pub dense_sum_ratio: usize,
    /// Non-zero-quantile guard of the dense-sum estimator.
    pub min_nonzero: f64,
    /// Binomial-error veto threshold; 0 disables the filter.
    pub max_binomial_err: f64,
}

impl PassParams {
    /// The strict detection pass: high quality, no binomial veto.
    pub fn strict() -> PassParams {
        PassParams {
            qual_thresh: 30,
            dense_sum_ratio: 20,
            min_nonzero: 0.01,
            max_binomial_err: 0.0,
        }
    }

    /// The lenient recount pass.
    pub fn lenient() -> PassParams {
        PassParams {
            qual_thresh: 2,
            dense_sum_ratio: 20,
            min_nonzero: 0.66,
            max_binomial_err: 0.05,
        }
    }
}

/// Everything the two-pass pipeline needs to know about a run.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub pass1: PassParams,
    pub pass2: PassParams,
    /// Skip the division by genome length in the final normalization.
    pub ignore_length: bool,
    /// Groups contigs of the same species by their first match.
    pub name_pattern: Regex,
}

impl EstimatorConfig {
    pub fn new(name_pattern: Regex, ignore_length: bool) -> EstimatorConfig {
        EstimatorConfig {
            pass1: PassParams::strict(),
            pass2: PassParams::lenient(),
            ignore_length,
            name_pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_defaults() {
        let p1 = PassParams::strict();
        assert_eq!(p1.qual_thresh, 30);
        assert_eq!(p1.max_binomial_err, 0.0);

        let p2 = PassParams::lenient();
        assert_eq!(p2.qual_thresh, 2);
        assert_eq!(p2.min_nonzero, 0.66);
    }
}
