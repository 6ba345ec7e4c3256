//! Zero-sized hash builder for the id sets kept by dependencies and units.
//!
//! Dependency and unit ids are small integers generated by this crate, so
//! HashDoS resistance buys nothing here. `FastHashBuilder` plugs foldhash with
//! a fixed seed into `IndexSet`/`HashMap` without any per-collection state.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` backed by foldhash with a constant seed.
///
/// Every dependency holds an `IndexSet` of subscribers and every unit holds
/// two `IndexSet`s of dependencies, so keeping the hasher zero-sized matters.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e37_79b9_7f4a_7c15).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexSet;

    #[test]
    fn builder_has_no_size() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn index_set_with_fast_hasher_keeps_insertion_order() {
        let mut set: IndexSet<u32, FastHashBuilder> = IndexSet::default();
        for id in [7, 3, 9, 3, 1] {
            set.insert(id);
        }
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![7, 3, 9, 1]);
    }
}
