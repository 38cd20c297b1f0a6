//! Descriptive statistics helpers
//!
//! Quantiles and means over optional values, and evenly spaced sequences.
//! Undefined values are skipped everywhere; an input with no defined value
//! yields `None`, never zero.

/// Quantile with linear interpolation between order statistics
///
/// Algorithm (type 7, the R/NumPy default):
/// 1. Sort defined values x[0..n]
/// 2. h = (n - 1) × p
/// 3. q = x[floor(h)] + (h - floor(h)) × (x[floor(h) + 1] - x[floor(h)])
pub fn quantile(values: &[Option<f64>], p: f64) -> Option<f64> {
    let mut defined: Vec<f64> = values.iter().flatten().copied().filter(|v| v.is_finite()).collect();
    if defined.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    defined.sort_by(|a, b| a.total_cmp(b));

    let h = (defined.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(defined.len() - 1);
    let fraction = h - lo as f64;

    Some(defined[lo] + fraction * (defined[hi] - defined[lo]))
}

/// Mean of the defined values
pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    if defined.is_empty() {
        return None;
    }
    Some(defined.iter().sum::<f64>() / defined.len() as f64)
}

/// `n` evenly spaced values from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quantile_ignores_undefined() {
        assert_eq!(quantile(&[Some(10.0), None, Some(30.0)], 0.5), Some(20.0));
        assert_eq!(quantile(&[Some(3.0), Some(1.0), Some(2.0)], 0.5), Some(2.0));
    }

    #[test]
    fn test_quantile_all_undefined_is_none() {
        assert_eq!(quantile(&[None, None], 0.5), None);
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_quantile_type7() {
        let values: Vec<Option<f64>> = (1..=100).map(|v| Some(v as f64)).collect();
        assert_relative_eq!(quantile(&values, 0.99).unwrap(), 99.01, epsilon = 1e-9);
        assert_relative_eq!(quantile(&values, 0.0).unwrap(), 1.0);
        assert_relative_eq!(quantile(&values, 1.0).unwrap(), 100.0);
        assert!(quantile(&values, 1.5).is_none());
    }

    #[test]
    fn test_linspace_endpoints() {
        let xs = linspace(-2.0, 3.0, 100);
        assert_eq!(xs.len(), 100);
        assert_eq!(xs[0], -2.0);
        assert_eq!(xs[99], 3.0);
        assert_relative_eq!(xs[1] - xs[0], 5.0 / 99.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[Some(1.0), None, Some(5.0)]), Some(3.0));
        assert_eq!(mean(&[None]), None);
    }
}
