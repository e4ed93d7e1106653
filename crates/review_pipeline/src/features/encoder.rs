use std::sync::{Arc, OnceLock};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::features::FeatureError;

/// Produces a fixed-length vector summarising free text.
pub trait EncodingProvider: Send + Sync {
    /// Provider name used in logs and cache diagnostics.
    fn name(&self) -> &str;
    /// Length of every vector returned by [`EncodingProvider::encode`].
    fn dimension(&self) -> usize;
    /// Encodes one text.
    fn encode(&self, text: &str) -> Result<Vec<f32>, FeatureError>;
}

/// Serializable description of an encoding provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderConfig {
    /// [`HashingMeanEncoder`].
    HashingMean {
        /// Output dimension.
        dimension: usize,
        /// Seed mixed into every token hash.
        seed: u64,
    },
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::HashingMean {
            dimension: 128,
            seed: 0x5EED,
        }
    }
}

impl EncoderConfig {
    /// Instantiates the provider.
    #[must_use]
    pub fn build(&self) -> Arc<dyn EncodingProvider> {
        match *self {
            Self::HashingMean { dimension, seed } => Arc::new(HashingMeanEncoder::new(dimension, seed)),
        }
    }
}

/// Mean of per-token pseudo-random unit vectors.
///
/// Every lower-cased word token maps to a vector drawn from a generator seeded
/// by the token's FNV-1a hash, so equal texts always encode identically and
/// texts sharing words land close together.
#[derive(Debug, Clone)]
pub struct HashingMeanEncoder {
    dimension: usize,
    seed: u64,
}

impl HashingMeanEncoder {
    /// Creates an encoder producing `dimension`-long vectors (at least one).
    #[must_use]
    pub fn new(dimension: usize, seed: u64) -> Self {
        Self {
            dimension: dimension.max(1),
            seed,
        }
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut rng = SmallRng::seed_from_u64(fnv1a(token.as_bytes()) ^ self.seed);
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl EncodingProvider for HashingMeanEncoder {
    fn name(&self) -> &str {
        "hashing_mean"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, FeatureError> {
        let lowered = text.to_lowercase();
        let mut sum = vec![0.0f32; self.dimension];
        let mut count = 0usize;
        for token in token_pattern().find_iter(&lowered) {
            for (acc, value) in sum.iter_mut().zip(self.token_vector(token.as_str())) {
                *acc += value;
            }
            count += 1;
        }
        if count > 0 {
            let scale = 1.0 / count as f32;
            for value in &mut sum {
                *value *= scale;
            }
        }
        Ok(sum)
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+").expect("token pattern is valid"))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
        dot / (na * nb)
    }

    #[test]
    fn encoding_is_deterministic_and_case_insensitive() {
        let encoder = HashingMeanEncoder::new(32, 7);
        let a = encoder.encode("Great card, fast delivery").unwrap();
        let b = encoder.encode("great CARD fast delivery!").unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
    }

    #[test]
    fn shared_words_are_closer_than_disjoint_ones() {
        let encoder = EncoderConfig::default().build();
        let base = encoder.encode("great gift for my sister").unwrap();
        let near = encoder.encode("great gift for my brother").unwrap();
        let far = encoder.encode("terrible customer service experience").unwrap();
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn empty_text_encodes_to_zeros() {
        let encoder = HashingMeanEncoder::new(8, 1);
        assert_eq!(encoder.encode("  ...  ").unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn fnv1a_matches_reference_vector() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
