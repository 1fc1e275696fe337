//! Deterministic fingerprints.
//!
//! A fingerprint identifies "the same request" or "the same function call"
//! across time: method + URL + selected headers + body for transports,
//! function identity + canonical argument JSON for calls. The default
//! hashes the canonical material; callers can override per cache with
//! [`KeyGenerator`](crate::config::KeyGenerator).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// The material a request fingerprint is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Transport verb, e.g. `"GET"`.
    pub method: String,
    /// Full URL including query.
    pub url: String,
    /// Serialised body, if any.
    pub body: Option<String>,
    /// Headers selected into the fingerprint, already filtered to the
    /// configured whitelist. Order-sensitive; callers sort before hashing.
    pub headers: Vec<(String, String)>,
}

impl KeyMaterial {
    fn canonical(&self) -> String {
        let mut out = format!("{} {}", self.method, self.url);
        for (name, value) in &self.headers {
            out.push('\n');
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        if let Some(body) = &self.body {
            out.push('\n');
            out.push_str(body);
        }
        out
    }
}

/// Default request fingerprint: a hash of the canonical material.
pub fn request_fingerprint(material: &KeyMaterial) -> String {
    let mut hasher = DefaultHasher::new();
    material.canonical().hash(&mut hasher);
    format!("req:{:016x}", hasher.finish())
}

/// Function fingerprint: identity plus canonical argument JSON.
pub fn function_fingerprint(identity: &str, args: &serde_json::Value) -> String {
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    args.to_string().hash(&mut hasher);
    format!("fn:{:016x}", hasher.finish())
}
