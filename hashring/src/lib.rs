//! Key to server routing for memcache pools.
//!
//! Two interchangeable strategies implement [`Router`]:
//!
//! - [`Modula`]: `hash(key) mod count` over an insertion-ordered target list.
//! - [`Consistent`]: a weighted hash ring. Adding or removing a server remaps
//!   only ~1/N of keys instead of all keys. With the [`Md5`](hasher::Md5)
//!   hasher the ring is libketama/twemproxy compatible.
//!
//! ```
//! use hashring::{Distribution, HashKind};
//!
//! let mut router = Distribution::Consistent.router(HashKind::Md5);
//! router.add_target("10.0.0.1:11211:1", 1);
//! router.add_target("10.0.0.2:11211:1", 1);
//!
//! let owner = router.lookup(b"user:42").unwrap();
//! assert_eq!(router.lookup(b"user:42").unwrap(), owner);
//! ```

mod consistent;
pub mod hasher;
pub mod md5;
mod modula;

pub use consistent::{Consistent, MAX_WEIGHT, POINTS_PER_WEIGHT};
pub use hasher::{HashKind, Hasher};
pub use modula::Modula;

/// Errors returned by [`Router`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The target is not part of the router.
    #[error("target '{0}' does not exist")]
    NotFound(String),

    /// A lookup was attempted on an empty router.
    #[error("no targets exist")]
    NoServers,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Maps keys to target identities.
///
/// For a fixed set of targets `lookup` is deterministic.
pub trait Router: Send + Sync {
    /// Add a target. Adding an existing target is a no-op.
    fn add_target(&mut self, target: &str, weight: u32);

    fn add_targets(&mut self, targets: &[(&str, u32)]) {
        for &(target, weight) in targets {
            self.add_target(target, weight);
        }
    }

    fn remove_target(&mut self, target: &str) -> Result<(), RouteError>;

    /// All targets, in insertion order.
    fn targets(&self) -> Vec<&str>;

    /// The target owning `key`.
    fn lookup(&self, key: &[u8]) -> Result<&str, RouteError>;

    /// Up to `count` distinct targets for `key`, in order of precedence.
    ///
    /// Returns an empty list when there are no targets.
    fn lookup_list(&self, key: &[u8], count: usize) -> Result<Vec<&str>, RouteError>;
}

/// Key distribution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    Modula,
    #[default]
    Consistent,
}

impl Distribution {
    /// Build an empty router for this strategy.
    pub fn router(self, hash: HashKind) -> Box<dyn Router> {
        match self {
            Distribution::Modula => Box::new(Modula::new(hash.hasher())),
            Distribution::Consistent => Box::new(Consistent::new(hash.hasher())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> [Box<dyn Router>; 2] {
        [
            Distribution::Modula.router(HashKind::default()),
            Distribution::Consistent.router(HashKind::default()),
        ]
    }

    #[test]
    fn shared_contract() {
        for mut router in both() {
            assert_eq!(router.lookup(b"k"), Err(RouteError::NoServers));
            assert_eq!(router.lookup_list(b"k", 2), Ok(vec![]));
            assert_eq!(
                router.remove_target("nope"),
                Err(RouteError::NotFound("nope".into()))
            );

            router.add_targets(&[("a:1:1", 1), ("b:1:1", 1), ("a:1:1", 1)]);
            assert_eq!(router.targets(), vec!["a:1:1", "b:1:1"]);
            assert!(matches!(
                router.lookup_list(b"k", 0),
                Err(RouteError::InvalidArgument(_))
            ));

            let list = router.lookup_list(b"k", 5).unwrap();
            assert_eq!(list.len(), 2);
            assert_eq!(list[0], router.lookup(b"k").unwrap());

            router.remove_target("a:1:1").unwrap();
            assert_eq!(router.lookup(b"k"), Ok("b:1:1"));
        }
    }
}
