//! Weighted discrete sampler built with Vose's alias method: O(n)
//! construction, O(1) draw.

use crate::rng::RngSource;

/// A precomputed alias table over `n` weighted outcomes (indices `0..n`).
///
/// Once built, drawing a sample costs one RNG draw for the bucket and one
/// for the coin flip -- no scan, no binary search.
#[derive(Debug, Clone)]
pub struct AliasTable {
    /// `prob[i]`: probability outcome `i`'s own slot is kept on a coin flip.
    prob: Vec<f64>,
    /// `alias[i]`: the outcome redirected to when the coin flip at slot `i`
    /// misses.
    alias: Vec<usize>,
}

impl AliasTable {
    /// Builds a table over `weights`. Entries with weight `0` are valid and
    /// simply never drawn unless they're the sole nonzero mass (the weight
    /// normalization falls out naturally; no special-casing is needed).
    ///
    /// Returns `None` for an empty slice or a slice whose weights sum to
    /// zero -- there is no well-defined distribution to sample from.
    pub fn build(weights: &[u32]) -> Option<Self> {
        let n = weights.len();
        if n == 0 {
            return None;
        }
        let total: f64 = weights.iter().map(|&w| w as f64).sum();
        if total <= 0.0 {
            return None;
        }

        // Scale each weight by n / total so the average scaled weight is 1;
        // this is the standard Vose normalization.
        let scaled: Vec<f64> = weights
            .iter()
            .map(|&w| (w as f64) * (n as f64) / total)
            .collect();

        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        let mut prob = vec![0.0f64; n];
        let mut alias = vec![0usize; n];
        let mut scaled = scaled;

        while let (Some(l), Some(g)) = (small.pop(), large.pop()) {
            prob[l] = scaled[l];
            alias[l] = g;
            scaled[g] = (scaled[g] + scaled[l]) - 1.0;
            if scaled[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }
        // Leftover entries from floating-point drift: treat as certain.
        for i in large {
            prob[i] = 1.0;
        }
        for i in small {
            prob[i] = 1.0;
        }

        Some(Self { prob, alias })
    }

    pub fn len(&self) -> usize {
        self.prob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }

    /// Draws an outcome index in `[0, len())`.
    pub fn sample(&self, rng: &mut dyn RngSource) -> usize {
        let n = self.prob.len();
        let slot = rng.uniform(n);
        if rng.uniform01() < self.prob[slot] {
            slot
        } else {
            self.alias[slot]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn empty_weights_build_none() {
        assert!(AliasTable::build(&[]).is_none());
    }

    #[test]
    fn all_zero_weights_build_none() {
        assert!(AliasTable::build(&[0, 0, 0]).is_none());
    }

    #[test]
    fn single_nonzero_weight_always_drawn() {
        let table = AliasTable::build(&[0, 5, 0]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            assert_eq!(table.sample(&mut rng), 1);
        }
    }

    #[test]
    fn draws_approximate_weight_proportions() {
        let weights = [1u32, 3, 6];
        let table = AliasTable::build(&weights).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let mut counts = [0u32; 3];
        let trials = 100_000;
        for _ in 0..trials {
            counts[table.sample(&mut rng)] += 1;
        }
        let total: u32 = weights.iter().sum();
        for i in 0..3 {
            let expected = trials as f64 * (weights[i] as f64 / total as f64);
            let observed = counts[i] as f64;
            assert!(
                (observed - expected).abs() / expected < 0.1,
                "outcome {i}: expected ~{expected}, got {observed}"
            );
        }
    }
}
