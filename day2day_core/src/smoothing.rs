//! Centered moving average.

use crate::error::{Result, SimError};

/// Centered running mean with a window of `width` points.
///
/// The window around index `i` spans `i - (width-1)/2 ..= i + width/2` and
/// is truncated at both ends of the sequence, so edge values average over
/// fewer points. The output has the same length as `values`.
pub fn runmean(values: &[f64], width: usize) -> Result<Vec<f64>> {
    if width == 0 {
        return Err(SimError::invalid("runmean: width must be at least 1"));
    }
    let n = values.len();
    let before = (width - 1) / 2;
    let after = width / 2;

    // prefix[i] = values[0] + ... + values[i-1]
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    let mut acc = 0.0;
    for v in values {
        acc += v;
        prefix.push(acc);
    }

    Ok((0..n)
        .map(|i| {
            let lo = i.saturating_sub(before);
            let hi = (i + after).min(n - 1);
            (prefix[hi + 1] - prefix[lo]) / (hi + 1 - lo) as f64
        })
        .collect())
}
