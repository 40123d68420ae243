use proptest::prelude::*;

use crate::changeset::Changeset;
use crate::paths;
use crate::value::Value;

pub fn arb_key() -> impl Strategy<Value = String> {
    "[a-c]{1,2}(/[a-c]{1,2}){0,2}".prop_map(|rel| format!("/{}", rel))
}

pub fn arb_path() -> impl Strategy<Value = String> {
    (arb_key(), any::<bool>()).prop_map(|(key, dir)| if dir { format!("{}/", key) } else { key })
}

pub fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<u8>().prop_map(Value::Byte),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        (-1.0e9f64..1.0e9).prop_map(Value::Double),
        "[a-z]{0,6}".prop_map(Value::Str),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Tuple),
            (inner.clone(), inner.clone())
                .prop_map(|(k, v)| Value::DictEntry(Box::new(k), Box::new(v))),
            inner.prop_map(|v| Value::Variant(Box::new(v))),
        ]
    })
}

type Ops = Vec<(String, Option<Value>)>;

fn build(ops: Ops) -> Changeset {
    let mut change = Changeset::new();
    for (path, value) in ops {
        if path.ends_with('/') {
            change.set(&path, None);
        } else {
            change.set(&path, value);
        }
    }
    change
}

pub fn arb_changeset() -> impl Strategy<Value = Changeset> {
    prop::collection::vec((arb_path(), prop::option::of(arb_value())), 0..8).prop_map(build)
}

pub fn arb_database() -> impl Strategy<Value = Changeset> {
    prop::collection::vec((arb_key(), arb_value()), 0..8).prop_map(|entries| {
        let mut db = Changeset::new_database();
        for (key, value) in entries {
            db.set(&key, Some(value));
        }
        db
    })
}

proptest! {
    #[test]
    fn path_classification(s in "[/a-b]{0,6}") {
        let path = s.starts_with('/') && !s.contains("//");
        prop_assert_eq!(paths::is_path(&s), path);
        prop_assert_eq!(paths::is_key(&s), path && !s.ends_with('/'));
        prop_assert_eq!(paths::is_dir(&s), path && s.ends_with('/'));
    }

    #[test]
    fn apply_to_empty_matches_bindings(change in arb_changeset(), key in arb_key()) {
        let mut db = Changeset::new_database();
        db.change(&change);
        let expected = match change.binding(&key) {
            Some(Some(value)) => Some(Some(value)),
            _ => None,
        };
        prop_assert_eq!(db.get(&key), expected);
    }

    #[test]
    fn diff_reconstructs(a in arb_database(), b in arb_database()) {
        let mut rebuilt = a.clone();
        if let Some(delta) = a.diff(&b) {
            rebuilt.change(&delta);
        }
        prop_assert_eq!(rebuilt, b);
    }

    #[test]
    fn wire_round_trip(change in arb_changeset()) {
        let restored = Changeset::deserialize(&change.serialize()).unwrap();
        prop_assert_eq!(restored, change);
    }

    #[test]
    fn describe_is_idempotent(change in arb_changeset()) {
        change.seal();
        prop_assert_eq!(change.describe(), change.describe());
    }

    #[test]
    fn similarity_laws(ops in prop::collection::vec((arb_path(), prop::option::of(arb_value())), 0..8),
                       other_values in prop::collection::vec(prop::option::of(arb_value()), 8)) {
        let a = build(ops.clone());
        let revalued: Ops = ops
            .iter()
            .zip(other_values)
            .map(|((path, _), value)| (path.clone(), value))
            .collect();
        let b = build(revalued);

        prop_assert!(a.is_similar_to(&a));
        prop_assert!(a.is_similar_to(&b));
        prop_assert!(b.is_similar_to(&a));
    }
}
