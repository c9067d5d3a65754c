//! Weighted consistent hash ring.

use std::collections::HashSet;

use crate::{Hasher, RouteError, Router};

/// Ring points per unit of weight (the libketama default).
pub const POINTS_PER_WEIGHT: usize = 160;

/// Largest weight honoured on the ring; heavier targets are clamped to it.
pub const MAX_WEIGHT: u32 = 4096;

/// Consistent hash ring.
///
/// Each target owns `160 * weight` points (weight clamped to `1..=MAX_WEIGHT`);
/// a key belongs to the first point
/// at or after its hash, wrapping past the top of the ring. The point table
/// is rebuilt wholesale whenever the target set changes.
pub struct Consistent {
    hasher: Box<dyn Hasher>,
    targets: Vec<(String, u32)>,
    /// Sorted (hash_point, target_index) pairs.
    points: Box<[(u32, u32)]>,
}

impl Consistent {
    pub fn new(hasher: Box<dyn Hasher>) -> Self {
        Self {
            hasher,
            targets: Vec::new(),
            points: Box::default(),
        }
    }

    /// Total number of points on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    fn rebuild(&mut self) {
        let mut points = Vec::new();
        for (idx, (identity, weight)) in (0u32..).zip(&self.targets) {
            let count = POINTS_PER_WEIGHT.saturating_mul(clamp_weight(*weight) as usize);
            points.extend(
                self.hasher
                    .points(identity, count)
                    .into_iter()
                    .map(|p| (p, idx)),
            );
        }
        points.sort_unstable();
        self.points = points.into_boxed_slice();
    }

    /// Index into `points` of the owner of `key`.
    #[inline]
    fn position(&self, key: &[u8]) -> usize {
        let hash = self.hasher.hash(key);
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        if idx == self.points.len() { 0 } else { idx }
    }
}

#[inline]
fn clamp_weight(weight: u32) -> u32 {
    weight.clamp(1, MAX_WEIGHT)
}

impl Router for Consistent {
    fn add_target(&mut self, target: &str, weight: u32) {
        if self.targets.iter().any(|(t, _)| t == target) {
            return;
        }
        self.targets.push((target.to_owned(), weight.max(1)));
        self.rebuild();
    }

    fn add_targets(&mut self, targets: &[(&str, u32)]) {
        let before = self.targets.len();
        let mut known: HashSet<String> = self.targets.iter().map(|(t, _)| t.clone()).collect();
        for &(target, weight) in targets {
            if known.insert(target.to_owned()) {
                self.targets.push((target.to_owned(), weight.max(1)));
            }
        }
        if self.targets.len() != before {
            self.rebuild();
        }
    }

    fn remove_target(&mut self, target: &str) -> Result<(), RouteError> {
        let idx = self
            .targets
            .iter()
            .position(|(t, _)| t == target)
            .ok_or_else(|| RouteError::NotFound(target.to_owned()))?;
        self.targets.remove(idx);
        self.rebuild();
        Ok(())
    }

    fn targets(&self) -> Vec<&str> {
        self.targets.iter().map(|(t, _)| t.as_str()).collect()
    }

    fn lookup(&self, key: &[u8]) -> Result<&str, RouteError> {
        match self.targets.len() {
            0 => Err(RouteError::NoServers),
            1 => Ok(&self.targets[0].0),
            _ => {
                let owner = self.points[self.position(key)].1;
                Ok(&self.targets[owner as usize].0)
            }
        }
    }

    fn lookup_list(&self, key: &[u8], count: usize) -> Result<Vec<&str>, RouteError> {
        if count == 0 {
            return Err(RouteError::InvalidArgument("requested count must be positive"));
        }
        let wanted = count.min(self.targets.len());
        let mut owners: Vec<u32> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let start = self.position(key);
        let n = self.points.len();
        for step in 0..n {
            let owner = self.points[(start + step) % n].1;
            if !owners.contains(&owner) {
                owners.push(owner);
                if owners.len() == wanted {
                    break;
                }
            }
        }

        Ok(owners
            .into_iter()
            .map(|o| self.targets[o as usize].0.as_str())
            .collect())
    }
}
