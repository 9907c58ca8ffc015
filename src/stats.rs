//! Small statistics helpers shared by the outlier filter and the key price
//! stabilizer.

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Standard score of `value` against a distribution. A zero standard
/// deviation means every sample is identical, in which case nothing is an
/// outlier and the score is 0.
pub fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        return 0.0;
    }
    (value - mean) / std_dev
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values) - 5.0).abs() < 1e-9);
        assert!((std_dev(&values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn z_score_zero_spread_is_not_an_outlier() {
        assert_eq!(z_score(10.0, 10.0, 0.0), 0.0);
    }

    #[test]
    fn empty_input_yields_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(std_dev(&[]), 0.0);
    }
}
