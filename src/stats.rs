//! Central tendency, dispersion and photometric magnitude.

use crate::model::CentralTendency;
use std::collections::HashMap;

/// Summarizes `values` with the given estimator. `None` for an empty slice.
pub fn central_tendency(method: CentralTendency, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match method {
        CentralTendency::Mean => Some(mean(values)),
        CentralTendency::Median => Some(low_median(values)),
        CentralTendency::Mode => Some(mode(values)),
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

// Even counts take the lower of the two middle values.
fn low_median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted[(sorted.len() - 1) / 2]
}

// Ties go to the value seen first.
fn mode(values: &[f64]) -> f64 {
    let mut counts: HashMap<u64, usize> = HashMap::with_capacity(values.len());
    for v in values {
        *counts.entry(v.to_bits()).or_insert(0) += 1;
    }
    let mut best = values[0];
    let mut best_count = 0;
    for v in values {
        let count = counts.get(&v.to_bits()).copied().unwrap_or(0);
        if count > best_count {
            best = *v;
            best_count = count;
        }
    }
    best
}

/// Sample standard deviation (n − 1 denominator) of `values` about `center`.
///
/// `center` is whichever estimate was chosen for the set, not necessarily the
/// arithmetic mean. Fewer than two values yield `None`.
pub fn stdev_about(values: &[f64], center: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let ss: f64 = values.iter().map(|v| (v - center).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Instrumental magnitude `zp − 2.5·log10(freq − freq_offset)`.
///
/// `None` when the offset-corrected frequency is not positive.
pub fn magnitude(zp: f64, freq: f64, freq_offset: f64) -> Option<f64> {
    let net = freq - freq_offset;
    if net > 0.0 && net.is_finite() {
        Some(zp - 2.5 * net.log10())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQS: [f64; 5] = [1000.0, 1010.0, 995.0, 1005.0, 1000.0];

    #[test]
    fn median_of_odd_count() {
        assert_eq!(central_tendency(CentralTendency::Median, &FREQS), Some(1000.0));
    }

    #[test]
    fn median_of_even_count_is_low_median() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(central_tendency(CentralTendency::Median, &values), Some(2.0));
    }

    #[test]
    fn mean_and_mode() {
        assert_eq!(central_tendency(CentralTendency::Mean, &FREQS), Some(1002.0));
        assert_eq!(central_tendency(CentralTendency::Mode, &FREQS), Some(1000.0));
    }

    #[test]
    fn mode_ties_resolve_to_first_seen() {
        let values = [7.0, 3.0, 3.0, 7.0, 1.0];
        assert_eq!(central_tendency(CentralTendency::Mode, &values), Some(7.0));
    }

    #[test]
    fn empty_input_has_no_center() {
        assert_eq!(central_tendency(CentralTendency::Mean, &[]), None);
        assert_eq!(stdev_about(&[], 0.0), None);
        assert_eq!(stdev_about(&[1.0], 1.0), None);
    }

    #[test]
    fn stdev_is_referenced_to_given_center() {
        // squared deviations about 1000: 0 + 100 + 25 + 25 + 0 = 150
        let sd = stdev_about(&FREQS, 1000.0).unwrap();
        assert!((sd - (150.0f64 / 4.0).sqrt()).abs() < 1e-12);
        // about the mean (1002) the spread is smaller
        let sd_mean = stdev_about(&FREQS, 1002.0).unwrap();
        assert!(sd_mean < sd);
    }

    #[test]
    fn magnitude_subtracts_offset() {
        let mag = magnitude(20.5, 1000.0, 0.0).unwrap();
        assert!((mag - 13.0).abs() < 1e-12);
        let with_offset = magnitude(20.5, 1000.5, 0.5).unwrap();
        assert!((with_offset - 13.0).abs() < 1e-12);
        assert_eq!(magnitude(20.5, 0.2, 0.5), None);
    }
}
