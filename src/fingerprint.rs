//! Deterministic cache keys for outbound calls.
//!
//! A fingerprint has the shape
//! `{client}.{method}.{endpoint}.{params_hash}.{version}` where the method is
//! lowercased and `params_hash` is the SHA-256 of the normalized parameters.
//! Normalization drops `null` entries, orders keys, and coerces every value to a
//! canonical string, so `{"page": 2}` and `{"page": "2"}` share a key. An absent
//! parameter map and an empty one normalize identically.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::client::{Method, Params};

/// Everything that identifies a logical request for caching purposes
#[derive(Debug, Clone, Copy)]
pub struct RequestIdentity<'a> {
    pub client_name: &'a str,
    pub endpoint: &'a str,
    pub params: Option<&'a Params>,
    pub method: Method,
    pub version: &'a str,
}

impl RequestIdentity<'_> {
    pub fn fingerprint(&self) -> String {
        fingerprint(
            self.client_name,
            self.endpoint,
            self.params,
            self.method,
            self.version,
        )
    }
}

/// Compute the cache key for a call
pub fn fingerprint(
    client_name: &str,
    endpoint: &str,
    params: Option<&Params>,
    method: Method,
    version: &str,
) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        client_name,
        method.as_str().to_ascii_lowercase(),
        endpoint,
        hash_params(params),
        version
    )
}

/// SHA-256 (hex) of the normalized parameter map
pub fn hash_params(params: Option<&Params>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_params(params).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Serialize params as a JSON array of `[key, value]` string pairs in key order.
pub fn normalize_params(params: Option<&Params>) -> String {
    let pairs: Vec<(&str, String)> = params
        .into_iter()
        .flatten()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.as_str(), canonical_value(value)))
        .collect();

    // Serializing a Vec of string tuples cannot fail.
    serde_json::to_string(&pairs).unwrap_or_default()
}

/// Canonical string form of a parameter value
pub fn canonical_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonical_number(n),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => canonical_json(value),
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// JSON with object keys sorted at every depth
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Number(n) => canonical_number(n),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_fingerprint_shape() {
        let p = params(&[("q", json!("rust"))]);
        let key = fingerprint("search", "v2/query", Some(&p), Method::Post, "2024-01");

        let parts: Vec<&str> = key.split('.').collect();
        assert_eq!(parts[0], "search");
        assert_eq!(parts[1], "post");
        assert_eq!(parts[2], "v2/query");
        assert_eq!(parts[3].len(), 64);
        assert_eq!(parts[4], "2024-01");
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let p = params(&[("b", json!(2)), ("a", json!("x"))]);
        let first = fingerprint("c", "e", Some(&p), Method::Get, "1");
        for _ in 0..10 {
            assert_eq!(fingerprint("c", "e", Some(&p), Method::Get, "1"), first);
        }
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let mut forward = Params::new();
        forward.insert("alpha".to_string(), json!(1));
        forward.insert("beta".to_string(), json!({"y": 1, "x": [1, 2]}));

        let reversed = params(&[("beta", json!({"x": [1, 2], "y": 1})), ("alpha", json!(1))]);

        assert_eq!(
            fingerprint("c", "e", Some(&forward), Method::Get, "1"),
            fingerprint("c", "e", Some(&reversed), Method::Get, "1")
        );
    }

    #[test]
    fn test_values_are_coerced() {
        let numeric = params(&[("page", json!(2)), ("render", json!(true))]);
        let textual = params(&[("page", json!("2")), ("render", json!("true"))]);
        let float = params(&[("page", json!(2.0)), ("render", json!(true))]);

        assert_eq!(hash_params(Some(&numeric)), hash_params(Some(&textual)));
        assert_eq!(hash_params(Some(&numeric)), hash_params(Some(&float)));
    }

    #[test]
    fn test_null_entries_are_dropped() {
        let with_null = params(&[("a", json!(1)), ("b", Value::Null)]);
        let without = params(&[("a", json!(1))]);
        assert_eq!(hash_params(Some(&with_null)), hash_params(Some(&without)));
    }

    #[test]
    fn test_absent_and_empty_params_match() {
        let empty = Params::new();
        let only_nulls = params(&[("unused", Value::Null)]);

        assert_eq!(
            fingerprint("c", "e", None, Method::Get, "1"),
            fingerprint("c", "e", Some(&empty), Method::Get, "1")
        );
        assert_eq!(hash_params(None), hash_params(Some(&only_nulls)));
    }

    #[test]
    fn test_identity_components_change_key() {
        let p = params(&[("a", json!(1))]);
        let base = fingerprint("c", "e", Some(&p), Method::Get, "1");

        assert_ne!(base, fingerprint("other", "e", Some(&p), Method::Get, "1"));
        assert_ne!(base, fingerprint("c", "f", Some(&p), Method::Get, "1"));
        assert_ne!(base, fingerprint("c", "e", Some(&p), Method::Post, "1"));
        assert_ne!(base, fingerprint("c", "e", Some(&p), Method::Get, "2"));
        assert_ne!(base, fingerprint("c", "e", None, Method::Get, "1"));
    }

    #[test]
    fn test_separators_in_values_do_not_collide() {
        let joined = params(&[("a", json!("1&b=2"))]);
        let split = params(&[("a", json!("1")), ("b", json!("2"))]);
        assert_ne!(hash_params(Some(&joined)), hash_params(Some(&split)));
    }

    #[test]
    fn test_request_identity() {
        let p = params(&[("id", json!(7))]);
        let identity = RequestIdentity {
            client_name: "c",
            endpoint: "items",
            params: Some(&p),
            method: Method::Delete,
            version: "v3",
        };
        assert_eq!(
            identity.fingerprint(),
            fingerprint("c", "items", Some(&p), Method::Delete, "v3")
        );
    }
}
