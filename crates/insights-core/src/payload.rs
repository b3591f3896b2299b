//! Merge-patch applied to `ingestion_queue.payload`.

use serde_json::{Map, Value as JsonValue};

/// Status code the item returns to after a single-step or full re-enrichment.
pub const RETURN_STATUS_KEY: &str = "_return_status";
/// Name of the step dispatched in isolation.
pub const SINGLE_STEP_KEY: &str = "_single_step";
/// Set by full re-enrichment so the agent can transition straight to review.
pub const MANUAL_OVERRIDE_KEY: &str = "_manual_override";

/// Partial payload update: drop `remove`, then overwrite the keys in `set`.
///
/// Stores apply this server-side (`(payload - remove) || set` on Postgres) so fields written
/// concurrently by other steps survive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadPatch {
    pub set: Map<String, JsonValue>,
    pub remove: Vec<String>,
}

impl PayloadPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let key = key.into();
        self.remove.retain(|k| k != &key);
        self.set.insert(key, value.into());
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.set.remove(&key);
        if !self.remove.contains(&key) {
            self.remove.push(key);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn set_object(&self) -> JsonValue {
        JsonValue::Object(self.set.clone())
    }

    pub fn apply(&self, payload: &mut JsonValue) {
        if !payload.is_object() {
            *payload = JsonValue::Object(Map::new());
        }
        if let Some(map) = payload.as_object_mut() {
            for key in &self.remove {
                map.remove(key);
            }
            for (key, value) in &self.set {
                map.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_untouched_fields() {
        let mut payload = json!({"title": "Basel IV", "summary": {"short": "s"}, "_single_step": "tag"});
        PayloadPatch::new()
            .set(RETURN_STATUS_KEY, 300)
            .remove(SINGLE_STEP_KEY)
            .apply(&mut payload);
        assert_eq!(
            payload,
            json!({"title": "Basel IV", "summary": {"short": "s"}, "_return_status": 300})
        );
    }

    #[test]
    fn non_object_payload_becomes_object() {
        let mut payload = JsonValue::Null;
        PayloadPatch::new().set("a", 1).apply(&mut payload);
        assert_eq!(payload, json!({"a": 1}));
    }

    #[test]
    fn last_operation_on_a_key_wins() {
        let patch = PayloadPatch::new().remove("k").set("k", true);
        assert!(patch.remove.is_empty());
        let patch = patch.remove("k");
        assert!(patch.set.is_empty());
        assert_eq!(patch.remove, vec!["k".to_string()]);
    }
}
