//! Property-based tests for the identifier maps.
//!
//! # Invariants tested
//!
//! - **Bijection:** every client id maps to exactly one cache id and back.
//! - **No half entries:** a rejected add or a removal never leaves one
//!   direction populated without the other.
//! - **Repointing:** `update` moves the cache side without growing the map.

use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};

use meridian_proxy::{FeatureIdMap, FeatureSetIdMap};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add(u64, u64),
    RemoveClient(u64),
    RemoveCache(u64),
    Update(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Small id ranges force frequent collisions.
    prop_oneof![
        4 => (0u64..16, 100u64..116).prop_map(|(c, k)| Op::Add(c, k)),
        1 => (0u64..16).prop_map(Op::RemoveClient),
        1 => (100u64..116).prop_map(Op::RemoveCache),
        2 => (0u64..16, 100u64..116).prop_map(|(c, k)| Op::Update(c, k)),
    ]
}

fn assert_consistent(map: &FeatureSetIdMap, model: &BTreeMap<u64, u64>) {
    assert_eq!(&map.client_ids(), model);
    assert_eq!(map.len(), model.len());
    for (&client_id, &cache_id) in model {
        assert_eq!(map.cache_id(client_id), Ok(cache_id));
        assert_eq!(map.client_id(cache_id), Ok(client_id));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the map always agrees with a plain forward model and stays
    /// a bijection under any sequence of operations.
    #[test]
    fn operations_preserve_the_bijection(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let map = FeatureSetIdMap::new();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Add(client_id, cache_id) => {
                    let taken = model.contains_key(&client_id)
                        || model.values().any(|&mapped| mapped == cache_id);
                    let added = map.add(client_id, cache_id);
                    prop_assert_eq!(added.is_ok(), !taken);
                    if added.is_ok() {
                        model.insert(client_id, cache_id);
                    }
                }
                Op::RemoveClient(client_id) => {
                    prop_assert_eq!(map.remove_client_id(client_id), model.remove(&client_id));
                }
                Op::RemoveCache(cache_id) => {
                    let owner = model
                        .iter()
                        .find_map(|(&client, &cache)| (cache == cache_id).then_some(client));
                    if let Some(client_id) = owner {
                        model.remove(&client_id);
                    }
                    prop_assert_eq!(map.remove_cache_id(cache_id), owner);
                }
                Op::Update(client_id, new_cache_id) => {
                    let Some(&old_cache_id) = model.get(&client_id) else {
                        prop_assert!(map.update(client_id, client_id + 100, new_cache_id).is_err());
                        continue;
                    };
                    let taken = new_cache_id != old_cache_id
                        && model.values().any(|&mapped| mapped == new_cache_id);
                    let updated = map.update(client_id, old_cache_id, new_cache_id);
                    prop_assert_eq!(updated.is_ok(), !taken);
                    if updated.is_ok() {
                        model.insert(client_id, new_cache_id);
                    }
                }
            }
            assert_consistent(&map, &model);
        }
    }

    /// Property: repointing a feature carries the new stale time and frees
    /// the old cache id.
    #[test]
    fn feature_updates_move_the_stale_time(
        client_id in 0u64..1_000,
        old_cache_id in 1_000u64..2_000,
        new_cache_id in 2_000u64..3_000,
        delay in 1u64..10_000,
    ) {
        let map = FeatureIdMap::new();
        let first = SystemTime::UNIX_EPOCH + Duration::from_secs(300);
        let later = first + Duration::from_secs(delay);
        map.add(client_id, old_cache_id, first).expect("add");
        map.update(client_id, old_cache_id, new_cache_id, later).expect("update");

        prop_assert_eq!(map.cache_id(client_id), Ok(new_cache_id));
        prop_assert_eq!(map.cache_stale_time(new_cache_id), Ok(later));
        prop_assert!(map.client_id(old_cache_id).is_err());
        prop_assert!(map.cache_stale_time(old_cache_id).is_err());
        prop_assert_eq!(map.len(), 1);
    }
}
