//! Auxiliary locators a `SortedRun` builds over its sorted key array to
//! accelerate `lower_bound`/`upper_bound` beyond a plain binary search.
//!
//! `IsamIndex` is a sparse directory of fanout pointers into the data
//! array, one entry every `FANOUT` keys. `SplineIndex` is the learned-index
//! alternative (PGM-index style): a piecewise-linear model of
//! `position(key)`, useful when `K` is numeric and the key distribution is
//! smooth enough that a few line segments predict the position within a
//! small, bounded window.

use std::marker::PhantomData;

const FANOUT: usize = 64;

/// Keys that can be projected onto `f64` for spline interpolation. Blanket
/// implemented for the primitive integer/float types; `IsamIndex` has no
/// such requirement and works for any `Ord + Copy` key.
pub trait SplineKey {
    fn to_f64(&self) -> f64;
}

macro_rules! impl_spline_key_int {
    ($($t:ty),*) => {
        $(impl SplineKey for $t {
            fn to_f64(&self) -> f64 { *self as f64 }
        })*
    };
}
impl_spline_key_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);
impl SplineKey for f32 {
    fn to_f64(&self) -> f64 {
        *self as f64
    }
}
impl SplineKey for f64 {
    fn to_f64(&self) -> f64 {
        *self
    }
}

/// Sparse directory: `entries[i] = (key at position i*FANOUT, i*FANOUT)`.
#[derive(Debug, Clone)]
pub struct IsamIndex<K> {
    entries: Vec<(K, usize)>,
}

impl<K: Ord + Copy> IsamIndex<K> {
    pub fn build(keys: &[K]) -> Self {
        let entries = keys
            .iter()
            .enumerate()
            .step_by(FANOUT)
            .map(|(i, k)| (*k, i))
            .collect();
        Self { entries }
    }

    /// Narrows a full-array binary search down to `[start, end]`, the block
    /// bracketing where `key` could live.
    pub fn bracket(&self, key: &K, len: usize) -> (usize, usize) {
        if self.entries.is_empty() {
            return (0, len);
        }
        match self.entries.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(i) => {
                let start = self.entries[i].1;
                let end = self
                    .entries
                    .get(i + 1)
                    .map(|(_, p)| *p)
                    .unwrap_or(len);
                (start, end)
            }
            Err(i) => {
                let start = if i == 0 { 0 } else { self.entries[i - 1].1 };
                let end = self.entries.get(i).map(|(_, p)| *p).unwrap_or(len);
                (start, end)
            }
        }
    }
}

/// A single line segment `position ≈ slope * key + intercept`, valid for
/// keys in `[key_lo, key_hi]` with a guaranteed max error of `max_error`
/// positions either side of the estimate.
#[derive(Debug, Clone, Copy)]
struct Segment {
    key_lo: f64,
    key_hi: f64,
    slope: f64,
    intercept: f64,
    max_error: usize,
}

/// Greedily-fit piecewise-linear model of key -> position, exhaustively
/// checked per segment so the error bound is exact, not probabilistic.
#[derive(Debug, Clone)]
pub struct SplineIndex<K> {
    segments: Vec<Segment>,
    _marker: PhantomData<fn(&K)>,
}

impl<K: SplineKey + Copy> SplineIndex<K> {
    pub fn build(keys: &[K], max_error_budget: usize) -> Self {
        if keys.is_empty() {
            return Self {
                segments: Vec::new(),
                _marker: PhantomData,
            };
        }

        let points: Vec<(f64, usize)> = keys.iter().map(|k| k.to_f64()).zip(0..).collect();
        let mut segments = Vec::new();
        let mut start = 0usize;

        while start < points.len() {
            let mut end = start + 1;
            // Grow the segment while a single line still predicts every
            // point in [start, end) within max_error_budget.
            while end < points.len() {
                if let Some((slope, intercept)) = fit_line(&points[start..=end]) {
                    let ok = points[start..=end].iter().all(|(x, y)| {
                        let pred = slope * x + intercept;
                        (pred - *y as f64).abs() <= max_error_budget as f64
                    });
                    if ok {
                        end += 1;
                        continue;
                    }
                }
                break;
            }
            let (slope, intercept) = fit_line(&points[start..end]).unwrap_or((0.0, start as f64));
            let max_error = points[start..end]
                .iter()
                .map(|(x, y)| ((slope * x + intercept) - *y as f64).abs().ceil() as usize)
                .max()
                .unwrap_or(0);
            segments.push(Segment {
                key_lo: points[start].0,
                key_hi: points[end - 1].0,
                slope,
                intercept,
                max_error,
            });
            start = end;
        }

        Self {
            segments,
            _marker: PhantomData,
        }
    }

    /// Predicts the `[lo, hi]` index window (clamped to `[0, len]`) in which
    /// `key` must fall, if present.
    pub fn bracket(&self, key: &K, len: usize) -> (usize, usize) {
        if self.segments.is_empty() {
            return (0, len);
        }
        let x = key.to_f64();
        let seg = self
            .segments
            .iter()
            .find(|s| x <= s.key_hi)
            .or_else(|| self.segments.last())
            .unwrap();
        let pred = (seg.slope * x + seg.intercept).round() as isize;
        let lo = (pred - seg.max_error as isize).max(0) as usize;
        let hi = (pred + seg.max_error as isize + 1).max(0) as usize;
        (lo.min(len), hi.min(len))
    }
}

fn fit_line(points: &[(f64, usize)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if n < 2.0 {
        return points.first().map(|(_, y)| (0.0, *y as f64));
    }
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| *y as f64).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * (*y as f64)).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return Some((0.0, sum_y / n));
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

/// Either locator, selected per `IndexKind` at run-construction time.
///
/// Both variants are generic over the same `K`, which is why `K` must
/// satisfy `SplineKey` everywhere in this crate (even runs built with
/// `IndexKind::Isam`, which doesn't itself need the projection): the
/// reference key type is a plain integer, and requiring the bound crate-wide
/// keeps the two locators interchangeable without a trait-object detour.
#[derive(Debug, Clone)]
pub enum RunIndex<K> {
    Isam(IsamIndex<K>),
    Spline(SplineIndex<K>),
}

impl<K: Ord + Copy + SplineKey> RunIndex<K> {
    pub fn bracket(&self, key: &K, len: usize) -> (usize, usize) {
        match self {
            RunIndex::Isam(idx) => idx.bracket(key, len),
            RunIndex::Spline(idx) => idx.bracket(key, len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isam_brackets_contain_key() {
        let keys: Vec<i64> = (0..500).collect();
        let idx = IsamIndex::build(&keys);
        for &k in &[0i64, 1, 63, 64, 65, 200, 499] {
            let (lo, hi) = idx.bracket(&k, keys.len());
            assert!(lo <= k as usize && (k as usize) < hi, "key {k}: [{lo},{hi})");
        }
    }

    #[test]
    fn spline_brackets_contain_key_for_linear_data() {
        let keys: Vec<i64> = (0..1000).map(|i| i * 3).collect();
        let idx = SplineIndex::build(&keys, 4);
        for (pos, &k) in keys.iter().enumerate() {
            let (lo, hi) = idx.bracket(&k, keys.len());
            assert!(lo <= pos && pos < hi, "key {k} at pos {pos}: [{lo},{hi})");
        }
    }
}
