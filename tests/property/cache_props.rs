//! Cache capacity and round-trip invariants for arbitrary key streams.

use proptest::prelude::*;
use steadfast_cache::Cache;

proptest! {
    #[test]
    fn size_never_exceeds_capacity(
        capacity in 1usize..32,
        keys in prop::collection::vec("[a-z]{1,6}", 1..200),
    ) {
        let cache: Cache<usize> = Cache::<usize>::for_requests("prop")
            .max_size(capacity)
            .build()
            .unwrap();
        for (index, key) in keys.iter().enumerate() {
            cache.insert(key.clone(), index);
            prop_assert!(cache.len() <= capacity);
        }
    }

    #[test]
    fn last_write_wins_within_ttl(
        key in "[a-z]{1,8}",
        values in prop::collection::vec(any::<u32>(), 1..20),
    ) {
        let cache: Cache<u32> = Cache::<u32>::for_requests("prop-rw").build().unwrap();
        for value in &values {
            cache.insert(key.clone(), *value);
        }
        prop_assert_eq!(cache.get(&key), values.last().copied());
    }

    #[test]
    fn fifo_keeps_the_newest_keys(
        capacity in 1usize..16,
        extra in 1usize..16,
    ) {
        let cache: Cache<usize> = Cache::<usize>::for_requests("prop-fifo")
            .max_size(capacity)
            .build()
            .unwrap();
        let total = capacity + extra;
        for i in 0..total {
            cache.insert(format!("k{i}"), i);
        }
        // The newest `capacity` keys survive; everything older is gone.
        for i in 0..total {
            let present = cache.get(&format!("k{i}")).is_some();
            prop_assert_eq!(present, i >= total - capacity);
        }
    }
}
