use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::{
    features::generator::{FeatureColumn, NormalisationRule},
    model::ModelError,
};

/// Smallest standard deviation used when scaling.
pub const STD_FLOOR: f32 = 1e-6;

/// Per-feature scaling fitted on training data.
///
/// Only values of [`NormalisationRule::Standardise`] columns are rescaled;
/// every other value passes through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardiser {
    means: Array1<f32>,
    scales: Array1<f32>,
}

impl Standardiser {
    /// Fits means and standard deviations of the standardised columns.
    pub fn fit(features: &Array2<f32>, columns: &[FeatureColumn]) -> Result<Self, ModelError> {
        let active = active_mask(columns);
        if active.len() != features.ncols() {
            return Err(ModelError::DimensionMismatch {
                expected: active.len(),
                found: features.ncols(),
            });
        }
        let width = features.ncols();
        let (means, stds) = if features.nrows() == 0 {
            (Array1::zeros(width), Array1::ones(width))
        } else {
            let means = features.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(width));
            let stds = features.std_axis(Axis(0), 0.0);
            (means, stds)
        };

        let mut fitted = Self {
            means: Array1::zeros(width),
            scales: Array1::ones(width),
        };
        Zip::from(&mut fitted.means)
            .and(&mut fitted.scales)
            .and(&means)
            .and(&stds)
            .and(&Array1::from(active))
            .for_each(|mean, scale, &m, &s, &on| {
                if on {
                    *mean = m;
                    *scale = s.max(STD_FLOOR);
                }
            });
        Ok(fitted)
    }

    /// Number of features this standardiser expects.
    #[must_use]
    pub fn width(&self) -> usize {
        self.means.len()
    }

    /// Applies the fitted scaling.
    pub fn transform(&self, features: &Array2<f32>) -> Result<Array2<f32>, ModelError> {
        if features.ncols() != self.width() {
            return Err(ModelError::DimensionMismatch {
                expected: self.width(),
                found: features.ncols(),
            });
        }
        let mut scaled = features.to_owned();
        scaled -= &self.means;
        scaled /= &self.scales;
        Ok(scaled)
    }
}

fn active_mask(columns: &[FeatureColumn]) -> Vec<bool> {
    columns
        .iter()
        .flat_map(|column| {
            std::iter::repeat(column.rule == NormalisationRule::Standardise).take(column.width)
        })
        .collect()
}
