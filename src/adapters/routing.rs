//! Weighted model routing.
//!
//! Weights look like `"modelA:0.7,modelB:0.3"`. The draw comes from a digest
//! of the run id, so a resumed run routes to the same model it would have
//! picked the first time.

use sha2::{Digest, Sha256};

/// One parsed `name:weight` pair
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedModel {
    pub name: String,
    pub weight: f64,
}

/// Parse a weights string, skipping entries that do not parse
pub fn parse_weights(weights: &str) -> Vec<WeightedModel> {
    weights
        .split(',')
        .filter_map(|part| {
            let (name, weight) = part.split_once(':')?;
            let name = name.trim();
            let weight: f64 = weight.trim().parse().ok()?;
            if name.is_empty() || !weight.is_finite() || weight < 0.0 {
                return None;
            }
            Some(WeightedModel {
                name: name.to_string(),
                weight,
            })
        })
        .collect()
}

/// Pick a model for a run.
///
/// Empty or unusable weights keep the requested model.
pub fn select_model(run_id: &str, requested: &str, weights: &str) -> String {
    let choices = parse_weights(weights);
    let total: f64 = choices.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return requested.to_string();
    }

    let mut r = draw(run_id) * total;
    for choice in &choices {
        r -= choice.weight;
        if r <= 0.0 {
            return choice.name.clone();
        }
    }

    requested.to_string()
}

/// Uniform value in [0, 1) derived from the run id
fn draw(run_id: &str) -> f64 {
    let digest = Sha256::digest(run_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
