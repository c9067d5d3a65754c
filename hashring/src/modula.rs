//! Modula distribution: `hash(key) mod count`.

use crate::{Hasher, RouteError, Router};

/// Insertion-ordered target list; weights are ignored.
pub struct Modula {
    hasher: Box<dyn Hasher>,
    targets: Vec<String>,
}

impl Modula {
    pub fn new(hasher: Box<dyn Hasher>) -> Self {
        Self {
            hasher,
            targets: Vec::new(),
        }
    }

    fn index_of(&self, key: &[u8]) -> Result<usize, RouteError> {
        if self.targets.is_empty() {
            return Err(RouteError::NoServers);
        }
        Ok(self.hasher.hash(key) as usize % self.targets.len())
    }
}

impl Router for Modula {
    fn add_target(&mut self, target: &str, _weight: u32) {
        if !self.targets.iter().any(|t| t == target) {
            self.targets.push(target.to_owned());
        }
    }

    fn remove_target(&mut self, target: &str) -> Result<(), RouteError> {
        let idx = self
            .targets
            .iter()
            .position(|t| t == target)
            .ok_or_else(|| RouteError::NotFound(target.to_owned()))?;
        self.targets.remove(idx);
        Ok(())
    }

    fn targets(&self) -> Vec<&str> {
        self.targets.iter().map(String::as_str).collect()
    }

    fn lookup(&self, key: &[u8]) -> Result<&str, RouteError> {
        let idx = self.index_of(key)?;
        Ok(&self.targets[idx])
    }

    fn lookup_list(&self, key: &[u8], count: usize) -> Result<Vec<&str>, RouteError> {
        if count == 0 {
            return Err(RouteError::InvalidArgument("requested count must be positive"));
        }
        if self.targets.is_empty() {
            return Ok(Vec::new());
        }

        // Primary first, then walk forward and wrap around.
        let start = self.index_of(key)?;
        let n = self.targets.len();
        Ok((0..n.min(count))
            .map(|i| self.targets[(start + i) % n].as_str())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashKind;

    fn router(targets: &[&str]) -> Modula {
        let mut m = Modula::new(HashKind::Crc32.hasher());
        for t in targets {
            m.add_target(t, 1);
        }
        m
    }

    #[test]
    fn hash_mod_count() {
        let m = router(&["s0", "s1", "s2"]);
        let h = crc32fast::hash(b"some-key") as usize;
        assert_eq!(m.lookup(b"some-key").unwrap(), ["s0", "s1", "s2"][h % 3]);
    }

    #[test]
    fn lookup_list_wraps_from_primary() {
        let m = router(&["s0", "s1", "s2", "s3"]);
        for i in 0..50 {
            let key = format!("key-{i}");
            let list = m.lookup_list(key.as_bytes(), 4).unwrap();
            let primary = m.lookup(key.as_bytes()).unwrap();
            let start = m.targets.iter().position(|t| t == primary).unwrap();
            let expected: Vec<&str> = (0..4).map(|j| m.targets[(start + j) % 4].as_str()).collect();
            assert_eq!(list, expected);
        }
    }

    #[test]
    fn lookup_list_truncates() {
        let m = router(&["s0", "s1", "s2"]);
        assert_eq!(m.lookup_list(b"k", 2).unwrap().len(), 2);
        let single = router(&["only"]);
        assert_eq!(single.lookup_list(b"k", 3).unwrap(), vec!["only"]);
    }

    #[test]
    fn weight_is_ignored() {
        let mut a = Modula::new(HashKind::Crc32.hasher());
        a.add_target("s0", 1);
        a.add_target("s1", 1);
        let mut b = Modula::new(HashKind::Crc32.hasher());
        b.add_target("s0", 5);
        b.add_target("s1", 1);
        for i in 0..100 {
            let key = format!("k{i}");
            assert_eq!(a.lookup(key.as_bytes()), b.lookup(key.as_bytes()));
        }
    }

    #[test]
    fn removal_reindexes() {
        let mut m = router(&["s0", "s1", "s2"]);
        m.remove_target("s1").unwrap();
        assert_eq!(m.targets(), vec!["s0", "s2"]);
    }
}
