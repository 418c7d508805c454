//! Районная поправка прогноза: детерминированное псевдослучайное смещение по seed имени.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::constants::{NDVI_MAX, NDVI_MIN};
use crate::district::{DistrictCategory, DistrictProfile};
use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdjustmentParams {
    pub factor_min: f64,
    pub factor_max: f64,
    pub offset: f64,
}

impl AdjustmentParams {
    pub const fn for_category(category: DistrictCategory) -> Self {
        match category {
            DistrictCategory::Urban => Self {
                factor_min: 0.95,
                factor_max: 1.02,
                offset: -0.02,
            },
            DistrictCategory::Suburban => Self {
                factor_min: 0.98,
                factor_max: 1.05,
                offset: 0.01,
            },
            DistrictCategory::Other => Self {
                factor_min: 0.96,
                factor_max: 1.04,
                offset: 0.0,
            },
        }
    }
}

/// `v * factor + offset + N(0, noise_std)` с одним множителем на вызов, затем обрезка в [0, 1].
pub fn adjust_forecast(
    profile: &DistrictProfile,
    values: &[f64],
    noise_std: f64,
) -> Result<Vec<f64>, PipelineError> {
    if !noise_std.is_finite() || noise_std < 0.0 {
        return Err(PipelineError::InvalidInput(format!(
            "noise_std must be a finite value >= 0, got {noise_std}"
        )));
    }
    let params = AdjustmentParams::for_category(profile.category);
    let noise = Normal::new(0.0, noise_std)
        .map_err(|err| PipelineError::InvalidInput(format!("noise_std={noise_std}: {err}")))?;
    let mut rng = StdRng::seed_from_u64(profile.seed());
    let factor = Uniform::new_inclusive(params.factor_min, params.factor_max).sample(&mut rng);

    Ok(values
        .iter()
        .map(|value| {
            let shifted = value.mul_add(factor, params.offset) + noise.sample(&mut rng);
            shifted.clamp(NDVI_MIN, NDVI_MAX)
        })
        .collect())
}

pub fn clamp_forecast(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .map(|value| value.clamp(NDVI_MIN, NDVI_MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_district_gets_same_adjustment() {
        let profile = DistrictProfile::lookup("Tembalang");
        let input = vec![0.5; 30];
        let first = adjust_forecast(&profile, &input, 0.005).unwrap();
        let second = adjust_forecast(&profile, &input, 0.005).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn different_districts_diverge() {
        let input = vec![0.5; 30];
        let a = adjust_forecast(&DistrictProfile::lookup("Tembalang"), &input, 0.005).unwrap();
        let b = adjust_forecast(&DistrictProfile::lookup("Mijen"), &input, 0.005).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn output_is_clamped() {
        let profile = DistrictProfile::lookup("Gayamsari");
        let out = adjust_forecast(&profile, &[0.0, 1.0, 0.999, 0.001], 0.5).unwrap();
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn zero_noise_stays_within_category_band() {
        let profile = DistrictProfile::lookup("Semarang Tengah");
        let params = AdjustmentParams::for_category(profile.category);
        let out = adjust_forecast(&profile, &[0.5; 5], 0.0).unwrap();
        let lo = 0.5f64.mul_add(params.factor_min, params.offset);
        let hi = 0.5f64.mul_add(params.factor_max, params.offset);
        for value in &out {
            assert!(*value >= lo - 1e-12 && *value <= hi + 1e-12);
        }
        assert!(out.windows(2).all(|pair| (pair[0] - pair[1]).abs() < 1e-12));
    }

    #[test]
    fn negative_noise_is_rejected() {
        let profile = DistrictProfile::lookup("Genuk");
        assert!(matches!(
            adjust_forecast(&profile, &[0.5], -1.0),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(adjust_forecast(&profile, &[0.5], f64::NAN).is_err());
        assert!(adjust_forecast(&profile, &[0.5], f64::INFINITY).is_err());
    }

    #[test]
    fn clamp_only_path() {
        assert_eq!(clamp_forecast(&[-0.1, 0.4, 1.2]), vec![0.0, 0.4, 1.0]);
    }
}
