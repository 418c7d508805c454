//! Скользящее среднее по хвостовому окну.

/// Среднее по окну, заканчивающемуся на каждой точке; в начале ряда берутся все доступные
/// значения, так что длина сохраняется.
pub fn trailing_mean(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    (0..values.len())
        .map(|idx| {
            let start = (idx + 1).saturating_sub(window);
            let span = &values[start..=idx];
            span.iter().sum::<f64>() / span.len() as f64
        })
        .collect()
}

/// Среднее только по полному окну; позиции с неполным окном дают `None`.
pub fn trailing_mean_strict(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    (0..values.len())
        .map(|idx| {
            (idx + 1 >= window).then(|| {
                let start = idx + 1 - window;
                values[start..=idx].iter().sum::<f64>() / window as f64
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn trailing_mean_keeps_length_and_leading_points() {
        let result = trailing_mean(&[0.3, 0.6, 0.9, 0.3, 0.3], 3);
        assert_eq!(result.len(), 5);
        assert_relative_eq!(result[0], 0.3, epsilon = 1e-12);
        assert_relative_eq!(result[1], 0.45, epsilon = 1e-12);
        assert_relative_eq!(result[2], 0.6, epsilon = 1e-12);
        assert_relative_eq!(result[3], 0.6, epsilon = 1e-12);
        assert_relative_eq!(result[4], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn trailing_mean_on_constant_is_identity() {
        let values = vec![0.4; 40];
        for value in trailing_mean(&values, 3) {
            assert_relative_eq!(value, 0.4, epsilon = 1e-12);
        }
    }

    #[test]
    fn trailing_mean_empty_and_unit_window() {
        assert!(trailing_mean(&[], 3).is_empty());
        assert_eq!(trailing_mean(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn long_series_stays_exact_per_window() {
        let values: Vec<f64> = (0..730).map(|i| 0.3 + 0.1 * f64::from(i % 7) / 7.0).collect();
        let smoothed = trailing_mean(&values, 3);
        for idx in 2..values.len() {
            let expected = (values[idx - 2] + values[idx - 1] + values[idx]) / 3.0;
            assert_relative_eq!(smoothed[idx], expected, epsilon = 1e-15);
        }
    }

    #[test]
    fn strict_mean_drops_under_populated_prefix() {
        let result = trailing_mean_strict(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_relative_eq!(result[2].unwrap(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(result[4].unwrap(), 4.0, epsilon = 1e-12);
    }
}
