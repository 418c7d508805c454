//! Окно фиксированной длины для входа последовательной модели.

use crate::error::PipelineError;

#[derive(Clone, Debug, PartialEq)]
pub struct Window {
    values: Vec<f64>,
}

impl Window {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn look_back(&self) -> usize {
        self.values.len()
    }

    /// Форма тензора: один батч одномерной последовательности.
    pub fn shape(&self) -> (usize, usize, usize) {
        (1, self.values.len(), 1)
    }

    pub fn to_tensor(&self) -> Vec<Vec<Vec<f64>>> {
        vec![self.values.iter().map(|value| vec![*value]).collect()]
    }

    /// Сдвигает окно вперёд: добавляет новые значения в конец, сохраняя длину.
    pub fn advance(&self, next: &[f64]) -> Self {
        let look_back = self.values.len();
        let mut values: Vec<f64> = self.values.iter().chain(next).copied().collect();
        let drop = values.len().saturating_sub(look_back);
        values.drain(..drop);
        Self { values }
    }
}

/// Последние `look_back` значений ряда; короткий ряд дополняется слева его первым значением.
pub fn build_window(scaled: &[f64], look_back: usize) -> Result<Window, PipelineError> {
    if look_back == 0 {
        return Err(PipelineError::InvalidInput("look_back must be >= 1".into()));
    }
    let first = *scaled.first().ok_or(PipelineError::EmptySeries)?;
    let values = if scaled.len() < look_back {
        let mut padded = vec![first; look_back - scaled.len()];
        padded.extend_from_slice(scaled);
        padded
    } else {
        scaled[scaled.len() - look_back..].to_vec()
    };
    Ok(Window { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_series_keeps_most_recent_values() {
        let series: Vec<f64> = (0..100).map(|i| f64::from(i) / 100.0).collect();
        let window = build_window(&series, 60).unwrap();
        assert_eq!(window.look_back(), 60);
        assert_eq!(window.values()[0], 0.40);
        assert_eq!(window.values()[59], 0.99);
    }

    #[test]
    fn short_series_is_left_padded_with_first_value() {
        let series: Vec<f64> = (1..=10).map(|i| f64::from(i) / 20.0).collect();
        let window = build_window(&series, 60).unwrap();
        assert_eq!(window.look_back(), 60);
        assert!(window.values()[..50].iter().all(|v| *v == series[0]));
        assert_eq!(&window.values()[50..], series.as_slice());
    }

    #[test]
    fn tensor_shape_is_single_batch_univariate() {
        let window = build_window(&[0.2, 0.3], 4).unwrap();
        assert_eq!(window.shape(), (1, 4, 1));
        let tensor = window.to_tensor();
        assert_eq!(tensor.len(), 1);
        assert_eq!(tensor[0].len(), 4);
        assert_eq!(tensor[0][3], vec![0.3]);
    }

    #[test]
    fn advance_slides_and_keeps_length() {
        let window = build_window(&[0.1, 0.2, 0.3], 3).unwrap();
        let next = window.advance(&[0.4, 0.5]);
        assert_eq!(next.values(), &[0.3, 0.4, 0.5]);
    }

    #[test]
    fn empty_series_and_zero_length_are_rejected() {
        assert!(matches!(
            build_window(&[], 60),
            Err(PipelineError::EmptySeries)
        ));
        assert!(matches!(
            build_window(&[0.5], 0),
            Err(PipelineError::InvalidInput(_))
        ));
    }
}
