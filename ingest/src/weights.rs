use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// named sums of event weights, keyed by systematic variation
pub type WeightSums = BTreeMap<String, f64>;

#[derive(Debug, Error, PartialEq)]
pub enum WeightsError {
    #[error("Files content are different ({left:?} vs {right:?}). Something really strange happened!")]
    KeyMismatch {
        left: Vec<String>,
        right: Vec<String>,
    },
}

/// Sum two sets of weight sums key by key.
///
/// An empty side counts as zero for every key of the other side. Two
/// non-empty sides must carry the same keys: outputs of the same task are
/// produced by the same configuration.
pub fn sum_dicts(a: &WeightSums, b: &WeightSums) -> Result<WeightSums, WeightsError> {
    if a.is_empty() {
        return Ok(b.clone());
    }
    if b.is_empty() {
        return Ok(a.clone());
    }

    if !a.keys().eq(b.keys()) {
        warn!("Files content are different. This is not a good sign, something really strange happened!");

        return Err(WeightsError::KeyMismatch {
            left: a.keys().cloned().collect(),
            right: b.keys().cloned().collect(),
        });
    }

    Ok(a.iter()
        .zip(b.values())
        .map(|((key, left), right)| (key.clone(), left + right))
        .collect())
}

/// Add `other` into `into`, keeping keys only present on one side.
pub fn accumulate(into: &mut WeightSums, other: &WeightSums) {
    for (key, value) in other {
        *into.entry(key.clone()).or_insert(0.0) += value;
    }
}
