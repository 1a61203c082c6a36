//! Integration tests driving `ClientCacheProxy` through the public store
//! contract.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use geo::{Coord, Rect};
use meridian_core::{
    Feature, FeatureDataStore, FeatureQuery, FeatureSetId, FeatureSetQuery, FeatureSetUpdate,
    FeatureStoreError, FeatureUpdate, MemoryFeatureStore,
    test_support::{CountingStore, feature_set, point_feature},
};
use meridian_proxy::{ClientCacheProxy, ManualClock, ProxyConfig};
use rstest::{fixture, rstest};

const IDLE: Duration = Duration::from_secs(10);

fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Rect<f64> {
    Rect::new(Coord { x: x1, y: y1 }, Coord { x: x2, y: y2 })
}

struct Setup {
    client: Arc<MemoryFeatureStore>,
    client_calls: CountingStore,
    cache: Arc<MemoryFeatureStore>,
    cache_calls: CountingStore,
    clock: Arc<ManualClock>,
    proxy: ClientCacheProxy,
    harbour: FeatureSetId,
    features: Vec<Feature>,
}

impl Setup {
    fn settle(&self) {
        assert!(self.proxy.wait_for_idle(IDLE), "proxy did not go idle");
    }

    fn warm(&self) {
        self.proxy
            .query_features(&FeatureQuery::default())
            .expect("schedule full pull")
            .for_each(drop);
        self.settle();
    }

    fn proxied(&self, query: &FeatureQuery) -> Vec<Feature> {
        self.proxy
            .query_features(query)
            .expect("query proxy")
            .collect::<Result<_, _>>()
            .expect("readable rows")
    }
}

#[fixture]
fn setup() -> Setup {
    let client = Arc::new(MemoryFeatureStore::with_first_id("memory://client", 1));
    let cache = Arc::new(MemoryFeatureStore::with_first_id("memory://cache", 1000));
    let harbour = client
        .insert_feature_set(&feature_set("harbour"))
        .expect("client set");
    let features = [("buoy", 1.0, 1.0), ("pier", 2.0, 2.0), ("lighthouse", 8.0, 8.0)]
        .into_iter()
        .map(|(name, x, y)| {
            client
                .insert_feature(harbour.id, &point_feature(name, x, y))
                .expect("client feature")
        })
        .collect();
    let client_calls = CountingStore::new(client.clone());
    let cache_calls = CountingStore::new(cache.clone());
    let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
    let proxy = ClientCacheProxy::with_clock(
        Arc::new(client_calls.clone()),
        Arc::new(cache_calls.clone()),
        ProxyConfig::default(),
        clock.clone(),
    );
    Setup {
        client,
        client_calls,
        cache,
        cache_calls,
        clock,
        proxy,
        harbour: harbour.id,
        features,
    }
}

#[rstest]
fn reads_are_translated_back_into_client_ids(setup: Setup) {
    setup.warm();

    let found = setup.proxied(&FeatureQuery::default());
    assert_eq!(found, setup.features, "proxy should echo the client rows");

    let cached: Vec<_> = setup
        .cache
        .query_features(&FeatureQuery::default())
        .expect("cache query")
        .collect::<Result<_, _>>()
        .expect("cache rows");
    assert_eq!(cached.len(), 3);
    assert!(cached.iter().all(|feature| feature.id >= 1000));

    let set = setup.proxy.get_feature_set(setup.harbour).expect("set");
    assert_eq!(set.id, setup.harbour);
    assert_eq!(set.name, "harbour");
}

#[rstest]
fn id_queries_and_paging_follow_client_ids(setup: Setup) {
    setup.warm();
    let ids: Vec<_> = setup.features.iter().map(|feature| feature.id).collect();

    let picked = setup.proxied(&FeatureQuery::by_ids([ids[2], 4242]));
    assert_eq!(picked.iter().map(|f| f.id).collect::<Vec<_>>(), vec![ids[2]]);

    let first = setup.proxied(&FeatureQuery::default().with_limit(1));
    assert_eq!(first.iter().map(|f| f.id).collect::<Vec<_>>(), vec![ids[0]]);

    let in_set = setup.proxied(&FeatureQuery::in_feature_set(setup.harbour));
    assert_eq!(in_set.len(), 3);
    assert_eq!(
        setup
            .proxy
            .query_features_count(&FeatureQuery::in_feature_set(setup.harbour))
            .expect("count"),
        3
    );
}

#[rstest]
fn repeated_full_scans_reach_the_client_once(setup: Setup) {
    for _ in 0..2 {
        setup
            .proxy
            .query_features(&FeatureQuery::default())
            .expect("query")
            .for_each(drop);
        setup.settle();
    }
    assert_eq!(setup.client_calls.counts().query_features, 1);
    assert_eq!(setup.cache_calls.counts().query_features, 2);

    setup.clock.advance(Duration::from_secs(300));
    setup
        .proxy
        .query_features(&FeatureQuery::default())
        .expect("query")
        .for_each(drop);
    setup.settle();
    assert_eq!(setup.client_calls.counts().query_features, 2);
}

#[rstest]
fn contained_regions_are_served_from_the_cache_until_stale(setup: Setup) {
    let outer = FeatureQuery::in_envelope(rect(0.0, 0.0, 10.0, 10.0));
    let inner = FeatureQuery::in_envelope(rect(0.5, 0.5, 2.5, 2.5));

    setup.proxied(&outer);
    setup.settle();
    assert_eq!(setup.client_calls.counts().query_features, 1);

    setup.clock.advance(Duration::from_secs(10));
    setup.proxied(&inner);
    setup.settle();
    assert_eq!(setup.client_calls.counts().query_features, 1);
    assert_eq!(setup.proxied(&inner).len(), 2);

    setup.clock.advance(Duration::from_secs(291));
    setup.proxied(&inner);
    setup.settle();
    assert_eq!(setup.client_calls.counts().query_features, 2);
}

#[rstest]
fn a_paged_region_query_still_caches_the_whole_region(setup: Setup) {
    let area = rect(0.0, 0.0, 10.0, 10.0);
    setup.proxied(&FeatureQuery::in_envelope(area).with_limit(1));
    setup.settle();

    setup.clock.advance(Duration::from_secs(10));
    setup.proxied(&FeatureQuery::in_envelope(area));
    setup.settle();
    assert_eq!(setup.proxied(&FeatureQuery::in_envelope(area)).len(), 3);
    assert_eq!(setup.client_calls.counts().query_features, 1);
}

#[rstest]
fn a_name_filtered_region_query_still_caches_the_whole_region(setup: Setup) {
    let area = rect(0.0, 0.0, 10.0, 10.0);
    let lighthouse_only = FeatureQuery {
        names: Some(["lighthouse".to_owned()].into()),
        ..FeatureQuery::in_envelope(area)
    };
    setup.proxied(&lighthouse_only);
    setup.settle();
    assert_eq!(setup.proxied(&lighthouse_only).len(), 1);
    assert_eq!(setup.proxied(&FeatureQuery::in_envelope(area)).len(), 3);
}

#[rstest]
fn a_failed_full_scan_does_not_hold_back_the_next_one() {
    let client = Arc::new(MemoryFeatureStore::with_first_id("memory://client", 1));
    let client_calls = CountingStore::new(client.clone());
    let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
    let proxy = ClientCacheProxy::with_clock(
        Arc::new(client_calls.clone()),
        Arc::new(MemoryFeatureStore::with_first_id("memory://cache", 1000)),
        ProxyConfig::default(),
        clock.clone(),
    );
    let refused = proxy.query_features(&FeatureQuery::default());
    assert!(matches!(refused, Err(FeatureStoreError::IllegalState(_))));

    let harbour = client
        .insert_feature_set(&feature_set("harbour"))
        .expect("client set");
    let buoy = client
        .insert_feature(harbour.id, &point_feature("buoy", 1.0, 1.0))
        .expect("client feature");
    clock.advance(Duration::from_secs(1));

    proxy
        .query_features(&FeatureQuery::default())
        .expect("schedule full pull")
        .for_each(drop);
    assert!(proxy.wait_for_idle(IDLE));
    assert_eq!(client_calls.counts().query_features, 1);
    assert_eq!(proxy.get_feature(buoy.id).expect("cached").id, buoy.id);
}

#[rstest]
fn evicted_rows_are_reported_under_client_ids(setup: Setup) {
    setup.warm();
    let buoy = setup.features[0].id;
    let cached: Vec<_> = setup
        .cache
        .query_features(&FeatureQuery::default())
        .expect("cache query")
        .collect::<Result<_, _>>()
        .expect("cache rows");
    for feature in &cached {
        setup.cache.delete_feature(feature.id).expect("evict row");
    }
    let cache_set = setup
        .cache
        .query_feature_sets(&FeatureSetQuery::default())
        .expect("cache sets")
        .next()
        .expect("one cached set")
        .expect("readable set");
    setup.cache.delete_feature_set(cache_set.id).expect("evict set");

    let expected_feature = FeatureStoreError::feature_not_found(buoy);
    let expected_set = FeatureStoreError::feature_set_not_found(setup.harbour);
    assert_eq!(
        setup.proxy.get_feature(buoy).expect_err("evicted").to_string(),
        expected_feature.to_string()
    );
    assert_eq!(
        setup.proxy.is_feature_visible(buoy).expect_err("evicted").to_string(),
        expected_feature.to_string()
    );
    assert_eq!(
        setup
            .proxy
            .get_feature_set(setup.harbour)
            .expect_err("evicted")
            .to_string(),
        expected_set.to_string()
    );
    assert_eq!(
        setup
            .proxy
            .set_feature_set_read_only(setup.harbour, true)
            .expect_err("evicted")
            .to_string(),
        expected_set.to_string()
    );
}

#[rstest]
fn content_writes_are_rejected_without_side_effects(setup: Setup) {
    setup.warm();
    let before = setup.cache_calls.counts().writes;

    let insert = setup
        .proxy
        .insert_feature(setup.harbour, &point_feature("dock", 3.0, 3.0));
    assert!(matches!(insert, Err(FeatureStoreError::Unsupported { .. })));
    let rename = setup.proxy.update_feature(
        setup.features[0].id,
        &FeatureUpdate::Name("renamed".to_owned()),
    );
    assert!(matches!(rename, Err(FeatureStoreError::Unsupported { .. })));
    let new_set = setup.proxy.insert_feature_set(&feature_set("marina"));
    assert!(matches!(new_set, Err(FeatureStoreError::Unsupported { .. })));
    let retitle = setup.proxy.update_feature_set(
        setup.harbour,
        &FeatureSetUpdate::Name("marina".to_owned()),
    );
    assert!(matches!(retitle, Err(FeatureStoreError::Unsupported { .. })));
    assert_eq!(
        setup.proxy.get_feature_set(setup.harbour).expect("set").name,
        "harbour"
    );

    assert_eq!(setup.cache_calls.counts().writes, before);
    assert_eq!(setup.client_calls.counts().writes, 0);
}

#[rstest]
fn deleting_a_set_drops_it_and_its_features_from_the_cache(setup: Setup) {
    setup.warm();
    setup
        .proxy
        .delete_feature_set(setup.harbour)
        .expect("delete set");

    let missing = setup.proxy.get_feature_set(setup.harbour);
    assert!(missing.is_err_and(|err| err.is_not_found()));
    let feature = setup.proxy.get_feature(setup.features[0].id);
    assert!(feature.is_err_and(|err| err.is_not_found()));
    assert_eq!(
        setup
            .cache
            .query_features_count(&FeatureQuery::default())
            .expect("count"),
        0
    );
    assert!(setup.client.get_feature_set(setup.harbour).is_ok());
}

#[rstest]
fn deleting_a_feature_only_touches_the_cache(setup: Setup) {
    setup.warm();
    let buoy = setup.features[0].id;
    setup.proxy.delete_feature(buoy).expect("delete");
    assert!(setup.proxy.get_feature(buoy).is_err());
    assert!(setup.client.get_feature(buoy).is_ok());
    assert!(setup.proxy.delete_feature(buoy).is_err_and(|err| err.is_not_found()));
}

#[rstest]
fn delete_all_feature_sets_empties_the_cache(setup: Setup) {
    setup.warm();
    setup.proxy.delete_all_feature_sets().expect("wipe");
    assert_eq!(
        setup
            .cache
            .query_feature_sets_count(&FeatureSetQuery::default())
            .expect("count"),
        0
    );
    assert_eq!(
        setup
            .proxy
            .query_features_count(&FeatureQuery::default())
            .expect("count"),
        0
    );
    assert!(setup.proxy.get_feature(setup.features[0].id).is_err());
}

#[rstest]
fn visibility_and_read_only_toggles_apply_to_the_cache(setup: Setup) {
    setup.warm();
    let buoy = setup.features[0].id;

    setup.proxy.set_feature_visible(buoy, false).expect("hide");
    assert!(!setup.proxy.is_feature_visible(buoy).expect("visibility"));
    assert!(setup.client.is_feature_visible(buoy).expect("client visibility"));

    setup
        .proxy
        .set_feature_set_read_only(setup.harbour, true)
        .expect("lock set");
    assert!(setup
        .proxy
        .is_feature_set_read_only(setup.harbour)
        .expect("read only"));
    assert!(!setup
        .client
        .is_feature_set_read_only(setup.harbour)
        .expect("client read only"));

    assert!(setup.proxy.is_feature_visible(9999).is_err_and(|err| err.is_not_found()));
}

#[rstest]
fn availability_and_uri_come_from_the_client(setup: Setup) {
    assert_eq!(setup.proxy.uri(), "memory://client");
    assert!(setup.proxy.is_available());
    setup.client.set_available(false);
    assert!(!setup.proxy.is_available());
}

#[rstest]
fn an_unavailable_client_leaves_cached_rows_in_place(setup: Setup) {
    setup.warm();
    setup.client.set_available(false);
    setup
        .client
        .delete_feature(setup.features[1].id)
        .expect("client delete");

    setup.proxy.refresh().expect("schedule refresh");
    setup.settle();
    assert_eq!(setup.proxied(&FeatureQuery::default()).len(), 3);

    setup.client.set_available(true);
    setup.proxy.refresh().expect("schedule refresh");
    setup.settle();
    let remaining: Vec<_> = setup
        .proxied(&FeatureQuery::default())
        .into_iter()
        .map(|feature| feature.id)
        .collect();
    assert_eq!(remaining, vec![setup.features[0].id, setup.features[2].id]);
}

#[rstest]
fn a_client_without_feature_sets_cannot_start_workers() {
    let client = Arc::new(MemoryFeatureStore::new("memory://empty"));
    let cache = Arc::new(MemoryFeatureStore::new("memory://cache"));
    let proxy = ClientCacheProxy::new(client, cache, ProxyConfig::default());
    let result = proxy.query_features(&FeatureQuery::default());
    assert!(matches!(result, Err(FeatureStoreError::IllegalState(_))));
}

#[rstest]
fn shut_down_proxies_refuse_new_work(setup: Setup) {
    setup.warm();
    setup.proxy.shutdown();
    let result = setup
        .proxy
        .query_features(&FeatureQuery::in_envelope(rect(0.0, 0.0, 1.0, 1.0)));
    assert!(matches!(result, Err(FeatureStoreError::IllegalState(_))));
    assert!(setup.proxy.get_feature(setup.features[0].id).is_ok());
}

#[rstest]
fn bulk_scopes_are_forwarded_to_the_cache(setup: Setup) {
    setup.proxy.begin_bulk_modification().expect("begin");
    assert!(setup.cache.is_in_bulk_modification());
    assert!(setup.proxy.is_in_bulk_modification());
    setup.proxy.end_bulk_modification(true).expect("end");
    assert!(!setup.cache.is_in_bulk_modification());
}
