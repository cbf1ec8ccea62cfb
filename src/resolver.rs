//! Four-level configuration resolution.
//!
//! Layers, lowest to highest precedence: built-in global defaults,
//! registered provider defaults, publisher overrides, per-call override.
//! Nested maps deep-merge, scalars replace, and lists replace unless the
//! override wraps them as `{"append": [...]}`. Resolved configs are memoized
//! by a fingerprint of the four inputs.

use crate::config::ClientConfig;
use crate::error::{Result, VastError};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Resolves client configuration through the 4-level hierarchy.
pub struct ConfigResolver {
    global_defaults: Value,
    provider_defaults: DashMap<String, Value>,
    cache: DashMap<u64, ClientConfig>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    pub fn new() -> Self {
        let global = serde_json::to_value(ClientConfig::default())
            .expect("default config serializes");
        Self {
            global_defaults: global,
            provider_defaults: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Replace the built-in global defaults layer.
    pub fn with_global_defaults(mut self, defaults: Value) -> Result<Self> {
        validate_layer(&defaults)?;
        self.global_defaults = deep_merge(self.global_defaults.clone(), &defaults);
        Ok(self)
    }

    /// Register (or replace) a provider defaults layer.
    pub fn register_provider(&self, name: impl Into<String>, overrides: Value) -> Result<()> {
        validate_layer(&overrides)?;
        self.provider_defaults.insert(name.into(), overrides);
        Ok(())
    }

    /// Resolve the effective config for a provider, publisher overrides, and
    /// a per-call override (any of which may be absent).
    pub fn resolve(
        &self,
        provider: Option<&str>,
        publisher_overrides: Option<&Value>,
        call_override: Option<&Value>,
    ) -> Result<ClientConfig> {
        let provider_layer = provider
            .and_then(|name| self.provider_defaults.get(name))
            .map(|entry| entry.value().clone());

        let key = fingerprint(&[
            Some(&self.global_defaults),
            provider_layer.as_ref(),
            publisher_overrides,
            call_override,
        ]);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let mut merged = self.global_defaults.clone();
        for layer in [provider_layer.as_ref(), publisher_overrides, call_override]
            .into_iter()
            .flatten()
        {
            validate_layer(layer)?;
            merged = deep_merge(merged, layer);
        }

        let config: ClientConfig = serde_json::from_value(merged)?;
        config.validate()?;

        debug!(provider = provider.unwrap_or("-"), "config resolved");
        self.cache.insert(key, config.clone());
        Ok(config)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }
}

/// Deep-merge `overlay` onto `base`. Maps merge key-wise, scalars replace,
/// arrays replace unless the overlay is `{"append": [...]}`.
pub fn deep_merge(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                base_map.insert(key.clone(), merged);
            }
            Value::Object(base_map)
        }
        (Value::Array(mut base_items), Value::Object(overlay_map))
            if is_append_marker(overlay_map) =>
        {
            if let Some(Value::Array(extra)) = overlay_map.get("append") {
                base_items.extend(extra.iter().cloned());
            }
            Value::Array(base_items)
        }
        (_, other) => other.clone(),
    }
}

fn is_append_marker(map: &Map<String, Value>) -> bool {
    map.len() == 1 && matches!(map.get("append"), Some(Value::Array(_)))
}

/// Shape checks applied to every layer before merging. The typed
/// deserialization after the merge catches the rest.
fn validate_layer(layer: &Value) -> Result<()> {
    if !layer.is_object() {
        return Err(VastError::Config("config layer must be a JSON object".into()));
    }
    if let Some(sources) = layer.pointer("/sources") {
        match sources.as_array() {
            Some(list) if !list.is_empty() => {}
            Some(_) => {
                return Err(VastError::Config("sources list must not be empty".into()));
            }
            None => return Err(VastError::Config("sources must be a list".into())),
        }
    }
    if let Some(retries) = layer.pointer("/strategy/retries").and_then(Value::as_i64) {
        if retries < 0 {
            return Err(VastError::Config(format!("retries must be >= 0, got {retries}")));
        }
    }
    if let Some(mult) = layer
        .pointer("/strategy/backoff_multiplier")
        .and_then(Value::as_f64)
    {
        if mult < 1.0 {
            return Err(VastError::Config(format!(
                "backoff_multiplier must be >= 1, got {mult}"
            )));
        }
    }
    for key in ["per_source_timeout_secs", "overall_timeout_secs"] {
        if let Some(secs) = layer
            .pointer(&format!("/strategy/{key}"))
            .and_then(Value::as_f64)
        {
            if secs <= 0.0 {
                return Err(VastError::Config(format!("{key} must be positive, got {secs}")));
            }
        }
    }
    if let Some(depth) = layer.pointer("/wrapper_depth_limit").and_then(Value::as_i64) {
        if depth < 0 {
            return Err(VastError::Config(format!(
                "wrapper_depth_limit must be >= 0, got {depth}"
            )));
        }
    }
    if let Some(Value::Object(rules)) = layer.pointer("/playback/interruption_rules") {
        for (event, rule) in rules {
            if let Some(probability) = rule.pointer("/probability").and_then(Value::as_f64) {
                if !(0.0..=1.0).contains(&probability) {
                    return Err(VastError::Config(format!(
                        "interruption probability for '{event}' must be in [0, 1], got {probability}"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn fingerprint(layers: &[Option<&Value>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for layer in layers {
        match layer {
            // serde_json maps iterate sorted, so to_string is canonical
            Some(value) => value.to_string().hash(&mut hasher),
            None => 0u8.hash(&mut hasher),
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchMode;
    use serde_json::json;

    #[test]
    fn scalars_replace_and_maps_merge() {
        let base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let overlay = json!({"nested": {"y": 3}});
        let merged = deep_merge(base, &overlay);
        assert_eq!(merged, json!({"a": 1, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn lists_replace_unless_append() {
        let base = json!({"sources": ["a", "b"]});
        let replaced = deep_merge(base.clone(), &json!({"sources": ["c"]}));
        assert_eq!(replaced, json!({"sources": ["c"]}));

        let appended = deep_merge(base, &json!({"sources": {"append": ["c"]}}));
        assert_eq!(appended, json!({"sources": ["a", "b", "c"]}));
    }

    #[test]
    fn merge_is_idempotent() {
        let layer = json!({"strategy": {"mode": "race", "retries": 1}, "sources": ["a"]});
        let once = deep_merge(json!({}), &layer);
        let twice = deep_merge(once.clone(), &layer);
        assert_eq!(once, twice);
    }

    #[test]
    fn four_level_precedence() {
        let resolver = ConfigResolver::new();
        resolver
            .register_provider(
                "tiger",
                json!({
                    "strategy": {"mode": "sequential", "retries": 5},
                    "playback": {"interruption_rules": {"start": {"probability": 0.08, "jitter": [0.0, 1.0]}}}
                }),
            )
            .unwrap();

        let publisher = json!({"strategy": {"retries": 1}});
        let call = json!({"sources": ["https://ads.example/vast"], "strategy": {"mode": "race"}});

        let config = resolver
            .resolve(Some("tiger"), Some(&publisher), Some(&call))
            .unwrap();

        // per-call wins over provider
        assert_eq!(config.strategy.mode, FetchMode::Race);
        // publisher wins over provider
        assert_eq!(config.strategy.retries, 1);
        // provider layer survives where unoverridden
        assert_eq!(
            config.playback.interruption_rules["start"].probability,
            0.08
        );
        // global defaults survive everywhere else
        assert_eq!(config.wrapper_depth_limit, 5);
    }

    #[test]
    fn resolution_is_cached_until_cleared() {
        let resolver = ConfigResolver::new();
        let call = json!({"sources": ["https://ads.example/vast"]});
        resolver.resolve(None, None, Some(&call)).unwrap();
        resolver.resolve(None, None, Some(&call)).unwrap();
        assert_eq!(resolver.cache_size(), 1);

        let other = json!({"sources": ["https://other.example/vast"]});
        resolver.resolve(None, None, Some(&other)).unwrap();
        assert_eq!(resolver.cache_size(), 2);

        resolver.clear_cache();
        assert_eq!(resolver.cache_size(), 0);
    }

    #[test]
    fn bad_layers_are_rejected_pre_merge() {
        let resolver = ConfigResolver::new();
        let empty_sources = json!({"sources": []});
        assert!(resolver.resolve(None, None, Some(&empty_sources)).is_err());

        let bad_probability =
            json!({"playback": {"interruption_rules": {"midpoint": {"probability": 2.0}}}});
        assert!(resolver.resolve(None, None, Some(&bad_probability)).is_err());

        let bad_multiplier = json!({"strategy": {"backoff_multiplier": 0.5}});
        assert!(resolver.resolve(None, None, Some(&bad_multiplier)).is_err());
    }
}
