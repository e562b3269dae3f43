use super::*;
use proptest::prelude::*;
use serde_json::json;

fn tool(n: usize) -> ToolId {
    ToolId::new("srv", format!("tool_{n}"))
}

#[test]
fn test_get_miss_then_hit() {
    let cache = SchemaCache::new(4);
    assert!(cache.get(&tool(0)).is_none());
    cache.set(tool(0), json!({"a": 1}));
    assert_eq!(cache.get(&tool(0)).unwrap(), json!({"a": 1}));

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
}

#[test]
fn test_eviction_removes_least_recently_accessed() {
    let cache = SchemaCache::new(3);
    for i in 0..3 {
        cache.set(tool(i), json!(i));
    }
    // Touch 0 and 1 so 2 becomes the LRU entry.
    cache.get(&tool(0));
    cache.get(&tool(1));
    cache.set(tool(3), json!(3));

    assert!(cache.get(&tool(2)).is_none());
    assert!(cache.get(&tool(0)).is_some());
    assert_eq!(cache.stats().size, 3);
}

#[test]
fn test_overflow_drops_first_never_reaccessed_key() {
    // max_size+1 distinct inserts: exactly max_size survive, and the first
    // inserted (never re-accessed) key is the one gone.
    let max = 50;
    let cache = SchemaCache::new(max);
    for i in 0..=max {
        cache.set(tool(i), json!(i));
    }
    assert_eq!(cache.stats().size, max);
    assert!(cache.get(&tool(0)).is_none());
    for i in 1..=max {
        assert!(cache.get(&tool(i)).is_some(), "tool_{i} missing");
    }
}

#[test]
fn test_top_tools_by_hit_count() {
    let cache = SchemaCache::new(8);
    for i in 0..3 {
        cache.set(tool(i), json!(i));
    }
    for _ in 0..5 {
        cache.get(&tool(2));
    }
    cache.get(&tool(1));

    let top = cache.top_tools(2);
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].0, tool(2));
    assert_eq!(top[0].1, 5);
    assert_eq!(top[1].0, tool(1));
}

#[test]
fn test_set_refreshes_existing_entry() {
    let cache = SchemaCache::new(2);
    cache.set(tool(0), json!("old"));
    cache.set(tool(0), json!("new"));
    assert_eq!(cache.stats().size, 1);
    assert_eq!(cache.get(&tool(0)).unwrap(), json!("new"));
}

#[test]
fn test_version_map_detects_change() {
    let versions = ToolVersionMap::new();
    let id = tool(0);
    assert!(versions.set(&id, &json!({"v": 1})));
    assert!(!versions.set(&id, &json!({"v": 1})));
    assert!(versions.set(&id, &json!({"v": 2})));

    let tag = versions.get(&id).unwrap();
    assert_eq!(tag.len(), 12);
    assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
}

proptest! {
    /// LRU invariant: after any interleaving of sets over a bounded key
    /// space, the cache never exceeds its capacity.
    #[test]
    fn lru_never_exceeds_capacity(ops in prop::collection::vec(0usize..20, 1..200), cap in 1usize..8) {
        let cache = SchemaCache::new(cap);
        for key in ops {
            cache.set(tool(key), json!(key));
            prop_assert!(cache.stats().size <= cap);
        }
    }
}
