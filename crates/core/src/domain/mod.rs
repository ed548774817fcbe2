pub mod agent;
pub mod journey;
pub mod workflow;

/// Open key-value bag carried by journeys, workflows and step payloads.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Shallow merge: keys in `patch` overwrite keys in `target`.
pub fn merge_context(target: &mut Context, patch: Context) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}
