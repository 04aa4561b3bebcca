//! Jenks natural breaks.
//!
//! Dynamic programme over the sorted values minimising the summed within-class
//! squared deviation. Returns `classes + 1` boundaries: the minimum, the upper
//! value of each class but the last, and the maximum.

use crate::error::{ExperimentError, Result};

/// Natural breaks of `values` into `classes` classes
pub fn jenks_breaks(values: &[f32], classes: usize) -> Result<Vec<f32>> {
    if classes < 2 {
        return Err(ExperimentError::config(format!(
            "natural breaks need at least 2 classes, got {}",
            classes
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ExperimentError::shape("natural breaks over non-finite values"));
    }
    if values.len() < classes {
        return Err(ExperimentError::shape(format!(
            "{} values cannot form {} classes",
            values.len(),
            classes
        )));
    }

    let mut data: Vec<f32> = values.to_vec();
    data.sort_by(f32::total_cmp);
    let n = data.len();

    // 1-based tables as in the classic formulation
    let mut lower_class_limits = vec![vec![0usize; classes + 1]; n + 1];
    let mut variance_combinations = vec![vec![0.0f64; classes + 1]; n + 1];
    for j in 1..=classes {
        lower_class_limits[1][j] = 1;
        for row in variance_combinations.iter_mut().skip(2) {
            row[j] = f64::INFINITY;
        }
    }

    for l in 2..=n {
        let mut sum = 0.0f64;
        let mut sum_squares = 0.0f64;
        let mut variance = 0.0f64;

        for m in 1..=l {
            let lower = l - m + 1;
            let value = data[lower - 1] as f64;
            sum += value;
            sum_squares += value * value;
            variance = sum_squares - sum * sum / m as f64;

            let previous = lower - 1;
            if previous != 0 {
                for j in 2..=classes {
                    let candidate = variance + variance_combinations[previous][j - 1];
                    if variance_combinations[l][j] >= candidate {
                        lower_class_limits[l][j] = lower;
                        variance_combinations[l][j] = candidate;
                    }
                }
            }
        }
        lower_class_limits[l][1] = 1;
        variance_combinations[l][1] = variance;
    }

    let mut breaks = vec![0.0f32; classes + 1];
    breaks[0] = data[0];
    breaks[classes] = data[n - 1];
    let mut k = n;
    for class in (2..=classes).rev() {
        let lower = lower_class_limits[k][class];
        // lower >= 2 whenever the table was filled for this class
        let upper_of_previous = lower.saturating_sub(2);
        breaks[class - 1] = data[upper_of_previous];
        k = lower.saturating_sub(1).max(1);
    }
    Ok(breaks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separated_groups() {
        let values = [1.0, 1.1, 0.9, 5.0, 5.2, 4.9, 9.0, 9.1, 8.8];
        let breaks = jenks_breaks(&values, 3).unwrap();
        assert_eq!(breaks, vec![0.9, 1.1, 5.2, 9.1]);
    }

    #[test]
    fn test_breaks_are_sorted_and_span_data() {
        let values: Vec<f32> = (0..60).map(|i| ((i * 37) % 23) as f32 * 0.1).collect();
        let breaks = jenks_breaks(&values, 5).unwrap();
        assert_eq!(breaks.len(), 6);
        assert!(breaks.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(breaks[0], 0.0);
        assert_eq!(breaks[5], 2.2);
    }

    #[test]
    fn test_input_order_is_irrelevant() {
        let values = [3.0, 0.5, 2.5, 0.4, 7.0, 6.5, 0.6, 3.1];
        let mut reversed = values;
        reversed.reverse();
        assert_eq!(jenks_breaks(&values, 3).unwrap(), jenks_breaks(&reversed, 3).unwrap());
    }

    #[test]
    fn test_too_few_values() {
        assert!(jenks_breaks(&[1.0, 2.0], 3).is_err());
        assert!(jenks_breaks(&[1.0, 2.0, 3.0], 1).is_err());
        assert!(jenks_breaks(&[1.0, f32::NAN, 3.0], 2).is_err());
    }
}
