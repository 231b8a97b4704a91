use serde::{Deserialize, Serialize};

/// The client-reported context that drives tool availability.
///
/// Every field is optional; arbitrary extension data belongs in `metadata`.
/// Validation is strict at the top level — an unknown field rejects the
/// whole payload rather than being silently swallowed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_tab: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ClientContext {
    /// Parse and validate a raw JSON payload.
    pub fn parse(value: serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_empty(&self) -> bool {
        self.page_id.is_none()
            && self.active_tab.is_none()
            && self.capabilities.is_empty()
            && self.metadata.is_empty()
    }
}
