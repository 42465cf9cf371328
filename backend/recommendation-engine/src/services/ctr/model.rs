/// Logistic Regression Click Model
///
/// Online logistic regression over the concatenated feature vector, trained
/// one event at a time with clipped-gradient SGD and L2 shrinkage.
use crate::config::CtrConfig;
use crate::error::{EngineError, Result};
use crate::utils::sigmoid;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Neutral prediction returned for unusable input
pub const NEUTRAL_CTR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdParams {
    pub learning_rate: f64,
    pub l2_lambda: f64,
    pub gradient_clip: f64,
}

impl From<&CtrConfig> for SgdParams {
    fn from(config: &CtrConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            l2_lambda: config.l2_lambda,
            gradient_clip: config.gradient_clip,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    weights: Array1<f64>,
}

impl LogisticRegression {
    /// Small uniform weights in `[-range, range]` from a fixed seed
    pub fn seeded(dimension: usize, seed: u64, range: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let range = range.abs();
        let weights = if range > 0.0 {
            Array1::from_iter((0..dimension).map(|_| rng.gen_range(-range..=range)))
        } else {
            Array1::zeros(dimension)
        };
        Self { weights }
    }

    pub fn from_weights(weights: Vec<f64>) -> Self {
        Self {
            weights: Array1::from_vec(weights),
        }
    }

    pub fn dimension(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.weights.to_vec()
    }

    fn input(&self, features: &[f64]) -> Result<Array1<f64>> {
        if features.len() != self.weights.len() {
            return Err(EngineError::DimensionMismatch {
                expected: self.weights.len(),
                actual: features.len(),
            });
        }
        Ok(Array1::from_iter(
            features
                .iter()
                .map(|x| if x.is_finite() { *x } else { 0.0 }),
        ))
    }

    /// sigmoid(w . x); errors on dimension mismatch
    pub fn try_predict(&self, features: &[f64]) -> Result<f64> {
        let x = self.input(features)?;
        let z = self.weights.dot(&x);
        if z.is_nan() {
            return Ok(NEUTRAL_CTR);
        }
        Ok(sigmoid(z))
    }

    /// sigmoid(w . x); neutral 0.5 on dimension mismatch
    pub fn predict(&self, features: &[f64]) -> f64 {
        self.try_predict(features).unwrap_or(NEUTRAL_CTR)
    }

    /// One SGD step. Returns the prediction made before the step.
    pub fn update(&mut self, features: &[f64], label: f64, params: &SgdParams) -> Result<f64> {
        let x = self.input(features)?;
        let z = self.weights.dot(&x);
        let prediction = if z.is_nan() { NEUTRAL_CTR } else { sigmoid(z) };
        let error = label - prediction;

        let lr = params.learning_rate;
        let shrink = lr * params.l2_lambda;
        let clip = params.gradient_clip.abs();
        self.weights.zip_mut_with(&x, |w, xi| {
            let gradient = (error * xi).clamp(-clip, clip);
            *w += lr * gradient - shrink * *w;
        });

        Ok(prediction)
    }

    /// Indices of the `k` largest |weight|, descending
    pub fn top_weights(&self, k: usize) -> Vec<(usize, f64)> {
        let mut indexed: Vec<(usize, f64)> = self.weights.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        indexed.truncate(k);
        indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SgdParams {
        SgdParams {
            learning_rate: 0.01,
            l2_lambda: 0.001,
            gradient_clip: 5.0,
        }
    }

    #[test]
    fn test_seeded_init_is_small_and_deterministic() {
        let a = LogisticRegression::seeded(160, 42, 0.01);
        let b = LogisticRegression::seeded(160, 42, 0.01);
        assert_eq!(a, b);
        assert_eq!(a.dimension(), 160);
        assert!(a.weights().iter().all(|w| w.abs() <= 0.01));
        assert_ne!(a, LogisticRegression::seeded(160, 7, 0.01));
    }

    #[test]
    fn test_zero_vector_predicts_exactly_half() {
        let model = LogisticRegression::seeded(160, 42, 0.01);
        assert_eq!(model.predict(&[0.0; 160]), 0.5);
    }

    #[test]
    fn test_dimension_mismatch_is_neutral() {
        let model = LogisticRegression::seeded(160, 42, 0.01);
        assert_eq!(model.predict(&[1.0; 64]), NEUTRAL_CTR);
        assert!(model.try_predict(&[1.0; 64]).is_err());
    }

    #[test]
    fn test_saturation() {
        let model = LogisticRegression::from_weights(vec![1000.0, -1000.0]);
        assert_eq!(model.predict(&[1.0, 0.0]), 1.0);
        assert_eq!(model.predict(&[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_single_update_on_all_ones() {
        let mut model = LogisticRegression::seeded(160, 42, 0.01);
        let before = model.weights().clone();
        let features = [1.0; 160];

        let p = model.update(&features, 1.0, &params()).unwrap();

        for (w0, w1) in before.iter().zip(model.weights().iter()) {
            let expected = 0.01 * (1.0 - p) - 0.01 * 0.001 * w0;
            let delta = w1 - w0;
            assert!((delta - expected).abs() < 1e-12);
            assert!(delta > 0.003 && delta < 0.007, "delta {} not ~0.005", delta);
        }
    }

    #[test]
    fn test_update_moves_prediction_toward_label() {
        let mut model = LogisticRegression::seeded(160, 42, 0.01);
        let features: Vec<f64> = (0..160).map(|i| (i % 7) as f64 / 7.0).collect();

        let before = model.predict(&features);
        model.update(&features, 1.0, &params()).unwrap();
        assert!(model.predict(&features) > before);

        let before = model.predict(&features);
        model.update(&features, 0.0, &params()).unwrap();
        assert!(model.predict(&features) < before);
    }

    #[test]
    fn test_gradient_is_clipped() {
        let mut model = LogisticRegression::from_weights(vec![0.0]);
        let p = SgdParams {
            learning_rate: 1.0,
            l2_lambda: 0.0,
            gradient_clip: 5.0,
        };
        // error 0.5 * feature 100 = 50, clipped to 5
        model.update(&[100.0], 1.0, &p).unwrap();
        assert!((model.weights()[0] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_features_are_ignored() {
        let model = LogisticRegression::from_weights(vec![0.3, 0.2]);
        assert_eq!(model.predict(&[f64::NAN, f64::INFINITY]), 0.5);
    }

    #[test]
    fn test_top_weights() {
        let model = LogisticRegression::from_weights(vec![0.1, -0.9, 0.5]);
        let top = model.top_weights(2);
        assert_eq!(top, vec![(1, -0.9), (2, 0.5)]);
    }
}
