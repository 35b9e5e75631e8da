use std::collections::BTreeMap;

/// Dynamic-typed extrinsic call parameter, per the "dynamic-typed extrinsic
/// payloads" design note. `Object` uses a `BTreeMap` so key order is always
/// deterministic, which canonical JSON serialization then preserves.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Bool(bool),
    Int(i128),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Param>),
    Object(BTreeMap<String, Param>),
}

impl Param {
    /// Serializes to a canonical JSON string: object keys sorted, no whitespace.
    /// Two `Param` values that are `==` always produce the same string, which is
    /// what the uniqueness and idempotence invariants over `params` rely on.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.to_value()).expect("Param serializes to valid JSON")
    }

    fn to_value(&self) -> serde_json::Value {
        match self {
            Param::Bool(b) => serde_json::Value::Bool(*b),
            Param::Int(i) => serde_json::Value::String(i.to_string()).into_number_or_string(),
            Param::String(s) => serde_json::Value::String(s.clone()),
            Param::Bytes(b) => serde_json::Value::String(format!("0x{}", hex::encode(b))),
            Param::Array(items) => {
                serde_json::Value::Array(items.iter().map(Param::to_value).collect())
            }
            Param::Object(map) => {
                let mut obj = serde_json::Map::new();
                // BTreeMap iteration is already key-sorted.
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_value());
                }
                serde_json::Value::Object(obj)
            }
        }
    }
}

trait IntoNumberOrString {
    fn into_number_or_string(self) -> serde_json::Value;
}

impl IntoNumberOrString for serde_json::Value {
    /// `i128` doesn't always fit `serde_json::Number` (which is backed by `i64`/`u64`
    /// /`f64`); fall back to its decimal string form when it doesn't, rather than lose
    /// precision or panic.
    fn into_number_or_string(self) -> serde_json::Value {
        let s = match self {
            serde_json::Value::String(s) => s,
            other => return other,
        };
        match s.parse::<i64>() {
            Ok(n) => serde_json::Value::Number(n.into()),
            Err(_) => serde_json::Value::String(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_sorted_regardless_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), Param::Int(2));
        a.insert("a".to_string(), Param::Int(1));
        let param = Param::Object(a);
        assert_eq!(param.to_canonical_json(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn bytes_render_as_hex() {
        let param = Param::Bytes(vec![0xde, 0xad]);
        assert_eq!(param.to_canonical_json(), r#""0xdead""#);
    }

    #[test]
    fn equal_params_produce_identical_json() {
        let a = Param::Array(vec![Param::Int(1), Param::String("x".into())]);
        let b = Param::Array(vec![Param::Int(1), Param::String("x".into())]);
        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
    }
}
