//! Property tests for update sequences against the engine

mod common;

use std::collections::BTreeMap;

use common::{builder, EventLog, ValueLog};
use proptest::prelude::*;
use reactive_state::{FlushMode, SelectorOptions, SetStateOptions, StoreConfig, Value};
use serde_json::json;

fn update() -> impl Strategy<Value = (String, i64)> {
    (prop::sample::select(vec!["a", "b", "c"]).prop_map(str::to_string), 0i64..4)
}

fn sum_of(s: &reactive_state::Tracked<'_>) -> Result<Value, reactive_state::ComputeError> {
    let total: f64 = ["a", "b", "c"].iter().filter_map(|key| s.get(key).as_f64()).sum();
    Ok(Value::from(total))
}

proptest! {
    #[test]
    fn deferred_updates_settle_in_one_batch(updates in prop::collection::vec(update(), 1..20)) {
        let engine = builder(json!({ "a": 0, "b": 0, "c": 0 }))
            .config(StoreConfig::testing().with_flush_mode(FlushMode::Deferred))
            .computed("sum", sum_of)
            .build()
            .unwrap();
        let log = EventLog::new();
        let _sub = engine.subscribe(&[], log.callback()).unwrap();

        let mut expected: BTreeMap<String, i64> = ["a", "b", "c"].iter().map(|k| (k.to_string(), 0)).collect();
        let mut any_change = false;
        for (key, n) in &updates {
            let changed = engine.set_state(Value::object([(key.clone(), Value::from(*n))]), SetStateOptions::default()).unwrap();
            prop_assert_eq!(changed, expected[key] != *n);
            any_change |= changed;
            expected.insert(key.clone(), *n);
        }
        engine.flush();

        prop_assert_eq!(log.len(), usize::from(any_change));
        for (key, n) in &expected {
            prop_assert_eq!(engine.get_path(key).unwrap(), Some(Value::from(*n)));
        }
        let total: i64 = expected.values().sum();
        prop_assert_eq!(engine.get_computed("sum").unwrap(), Value::from(total));
    }

    #[test]
    fn selector_fires_once_per_distinct_value(updates in prop::collection::vec(update(), 1..20)) {
        let engine = builder(json!({ "a": 0, "b": 0, "c": 0 })).build().unwrap();
        let log = ValueLog::new();
        let _sub = engine.subscribe_selector(sum_of, SelectorOptions::default(), log.callback());

        let mut state: BTreeMap<String, i64> = ["a", "b", "c"].iter().map(|k| (k.to_string(), 0)).collect();
        let mut last = 0;
        let mut expected = Vec::new();
        for (key, n) in &updates {
            engine.set_state(Value::object([(key.clone(), Value::from(*n))]), SetStateOptions::default()).unwrap();
            state.insert(key.clone(), *n);
            let total: i64 = state.values().sum();
            if total != last {
                expected.push(Value::from(total));
                last = total;
            }
        }

        prop_assert_eq!(log.values(), expected);
    }
}
