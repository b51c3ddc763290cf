use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Luminosity sections per run, in the compact `{"<run>": [[first, last], ...]}` form
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct LumiMask(BTreeMap<u32, Vec<(u32, u32)>>);

impl LumiMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn runs(&self) -> impl Iterator<Item = (&u32, &Vec<(u32, u32)>)> {
        self.0.iter()
    }

    /// Add a range of sections, keeping the ranges of the run sorted and disjoint
    pub fn insert(&mut self, run: u32, first: u32, last: u32) {
        let (first, last) = if first <= last { (first, last) } else { (last, first) };
        let ranges = self.0.entry(run).or_default();
        ranges.push((first, last));
        coalesce(ranges);
    }

    /// Merge every range of `other` into this mask
    pub fn union_with(&mut self, other: &LumiMask) {
        for (run, ranges) in other.runs() {
            let merged = self.0.entry(*run).or_default();
            merged.extend(ranges.iter().copied());
            coalesce(merged);
        }
    }

    pub fn union(&self, other: &LumiMask) -> LumiMask {
        let mut merged = self.clone();
        merged.union_with(other);
        merged
    }

    /// Compact JSON as stored in the database
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut mask: LumiMask = serde_json::from_str(json)?;
        mask.0.values_mut().for_each(coalesce);
        Ok(mask)
    }
}

// overlapping and adjacent ranges collapse into one
fn coalesce(ranges: &mut Vec<(u32, u32)>) {
    ranges.sort_unstable();

    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for &(first, last) in ranges.iter() {
        match merged.last_mut() {
            Some((_, previous_last)) if first <= previous_last.saturating_add(1) => {
                *previous_last = (*previous_last).max(last);
            }
            _ => merged.push((first, last)),
        }
    }

    *ranges = merged;
}
