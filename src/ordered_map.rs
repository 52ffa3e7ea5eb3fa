// agentry/src/ordered_map.rs

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use std::{collections::BTreeSet, fmt, marker::PhantomData};

/// A string-keyed mapping that keeps declaration order and rejects repeated keys.
///
/// `BTreeMap`/`HashMap` both lose the order in which a document declared its
/// entries; permission rules and provider listings need it.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self { Self(Vec::new()) }
}

impl<V> OrderedMap<V> {
    pub fn into_inner(self) -> Vec<(String, V)> { self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

struct OrderedMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a mapping with unique string keys")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut seen = BTreeSet::new();
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some(key) = map.next_key::<String>()? {
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format!("duplicate key `{key}`")));
            }
            let value = map.next_value::<V>()?;
            entries.push((key, value));
        }
        Ok(OrderedMap(entries))
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Deserialize into an `OrderedMap` from a visitor that has already seen a map.
pub(crate) fn from_map_access<'de, A, V>(map: A) -> Result<OrderedMap<V>, A::Error>
where
    A: MapAccess<'de>,
    V: Deserialize<'de>,
{
    OrderedMapVisitor(PhantomData).visit_map(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_declaration_order() {
        let m: OrderedMap<u32> = serde_yml::from_str("zeta: 1\nalpha: 2\nmid: 3\n").unwrap();
        let keys: Vec<_> = m.0.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn rejects_duplicate_keys_in_json() {
        let err = serde_json::from_str::<OrderedMap<u32>>(r#"{"a":1,"b":2,"a":3}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate key `a`"), "{err}");
    }
}
