//! ComfyUI prompt history types and parser.
//!
//! `GET /history/{prompt_id}` answers with
//! `{"<prompt_id>": {"status": {...}, "outputs": {...}}}` once the prompt
//! has been picked up, and `{}` before that. This module deserializes one
//! entry into a strongly-typed [`PromptHistory`].

use std::collections::HashMap;

use serde::Deserialize;

/// History entry for one prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptHistory {
    pub status: PromptStatus,
    /// Outputs keyed by node id.
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptStatus {
    #[serde(default)]
    pub completed: bool,
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: String,
    /// Event log as `[event_name, payload]` pairs.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

/// Files produced by one node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Reference to a file served by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder kind, usually `output` or `temp`.
    #[serde(rename = "type", default)]
    pub folder_type: String,
}

impl PromptHistory {
    /// True once the prompt completed or failed.
    pub fn is_finished(&self) -> bool {
        self.status.completed || self.is_error()
    }

    pub fn is_error(&self) -> bool {
        self.status.status_str == "error"
    }

    /// Description of the first error event, if the prompt failed.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        let detail = self
            .status
            .messages
            .iter()
            .find(|(event, _)| event.contains("error"))
            .map(|(_, payload)| {
                payload
                    .get("exception_message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string())
            });
        Some(detail.unwrap_or_else(|| "ComfyUI reported an execution error".to_string()))
    }

    /// First image written by node `node_id`.
    pub fn first_image(&self, node_id: &str) -> Option<&ImageRef> {
        self.outputs.get(node_id).and_then(|out| out.images.first())
    }
}

/// Extract the entry for `prompt_id` from a `/history` response.
///
/// Returns `Ok(None)` while the prompt is not listed yet. Returns `Err`
/// for an entry that does not match the expected shape.
pub fn parse_history(
    prompt_id: &str,
    body: &serde_json::Value,
) -> Result<Option<PromptHistory>, serde_json::Error> {
    match body.get(prompt_id) {
        Some(entry) => PromptHistory::deserialize(entry).map(Some),
        None => Ok(None),
    }
}
