//! Editing and validation of ComfyUI API-format workflows.
//!
//! An API-format workflow is a JSON object keyed by node id, each node
//! carrying `class_type`, `inputs` and `_meta.title`. Nodes are
//! addressed by title everywhere in pixaris.

use std::path::Path;

use pixaris_core::executor::ExecutorError;
use pixaris_core::types::ParamAssignment;
use serde_json::{Map, Value};

/// Node class of preview outputs, stripped on load.
const PREVIEW_IMAGE_CLASS: &str = "PreviewImage";

/// Node class that loads an input image.
pub const LOAD_IMAGE_CLASS: &str = "LoadImage";

/// Title of the sole loader in single-input workflows.
pub const DEFAULT_LOAD_IMAGE_NODE: &str = "Load Image";

/// Nodes that fan a prompt out into an XY plot of many images.
const XY_PLOT_NODES: &[&str] = &[
    "XY Input: Sampler/Scheduler",
    "XY Input: Seeds++ Batch",
    "XY Plot",
];

/// A parsed API-format workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct ComfyWorkflow {
    nodes: Map<String, Value>,
}

/// Errors raised while editing a workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("Node {0} does not exist in the workflow")]
    NodeNotFound(String),

    #[error("Node {node} does not have input {input}")]
    InputNotFound { node: String, input: String },

    #[error("Node {node} input {input} has the wrong type")]
    TypeMismatch { node: String, input: String },

    #[error("Malformed workflow: {0}")]
    Malformed(String),
}

impl From<WorkflowError> for ExecutorError {
    fn from(e: WorkflowError) -> Self {
        ExecutorError::Validation(e.to_string())
    }
}

impl ComfyWorkflow {
    /// Parse a workflow document, dropping preview nodes.
    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        let Value::Object(mut nodes) = value else {
            return Err(WorkflowError::Malformed(
                "workflow must be a JSON object keyed by node id".to_string(),
            ));
        };
        if let Some((id, _)) = nodes.iter().find(|(_, node)| !node.is_object()) {
            return Err(WorkflowError::Malformed(format!("node {id} is not an object")));
        }
        nodes.retain(|_, node| class_of(node) != Some(PREVIEW_IMAGE_CLASS));
        Ok(Self { nodes })
    }

    /// Read and parse a workflow file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Malformed(format!("cannot read {}: {e}", path.display()))
        })?;
        let value = serde_json::from_str(&text).map_err(|e| {
            WorkflowError::Malformed(format!("cannot parse {}: {e}", path.display()))
        })?;
        Self::from_value(value)
    }

    /// Id of the first node titled `node_name`.
    pub fn node_id_for_name(&self, node_name: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, node)| title_of(node) == Some(node_name))
            .map(|(id, _)| id.as_str())
    }

    pub fn has_node(&self, node_name: &str) -> bool {
        self.node_id_for_name(node_name).is_some()
    }

    /// Number of nodes of class `class_type`.
    pub fn count_class(&self, class_type: &str) -> usize {
        self.nodes
            .values()
            .filter(|node| class_of(node) == Some(class_type))
            .count()
    }

    pub fn get_value(&self, node_name: &str, input: &str) -> Option<&Value> {
        let id = self.node_id_for_name(node_name)?;
        self.nodes.get(id)?.get("inputs")?.get(input)
    }

    /// Overwrite an existing input of a node.
    pub fn set_value(&mut self, node_name: &str, input: &str, value: Value) -> Result<(), WorkflowError> {
        let slot = self.input_slot(node_name, input)?;
        *slot = value;
        Ok(())
    }

    /// Check that `assignment` names an existing input and keeps its
    /// JSON type (integers and floats are distinct).
    pub fn check_assignment(&self, assignment: &ParamAssignment) -> Result<(), WorkflowError> {
        let node = &assignment.target_name;
        let input = &assignment.input_name;
        if !self.has_node(node) {
            return Err(WorkflowError::NodeNotFound(node.clone()));
        }
        let current = self
            .get_value(node, input)
            .ok_or_else(|| WorkflowError::InputNotFound {
                node: node.clone(),
                input: input.clone(),
            })?;
        if !same_kind(current, &assignment.value) {
            return Err(WorkflowError::TypeMismatch {
                node: node.clone(),
                input: input.clone(),
            });
        }
        Ok(())
    }

    /// Check and apply assignments in order.
    pub fn apply_assignments(&mut self, assignments: &[ParamAssignment]) -> Result<(), WorkflowError> {
        for assignment in assignments {
            self.check_assignment(assignment)?;
            self.set_value(
                &assignment.target_name,
                &assignment.input_name,
                assignment.value.clone(),
            )?;
        }
        Ok(())
    }

    /// Point a loader node at an uploaded file.
    pub fn set_image(&mut self, node_name: &str, uploaded_path: &str) -> Result<(), WorkflowError> {
        let inputs = self.inputs_mut(node_name)?;
        inputs.insert("image".to_string(), Value::String(uploaded_path.to_string()));
        Ok(())
    }

    /// Remove the node titled `node_name` along with every input linking to it.
    pub fn remove_node(&mut self, node_name: &str) -> Result<(), WorkflowError> {
        let id = self
            .node_id_for_name(node_name)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_name.to_string()))?
            .to_string();
        self.nodes.remove(&id);

        for node in self.nodes.values_mut() {
            if let Some(Value::Object(inputs)) = node.get_mut("inputs") {
                inputs.retain(|_, value| !links_to(value, &id));
            }
        }
        Ok(())
    }

    /// Reduce an XY-plot workflow to one that renders a single image.
    ///
    /// No-op when the workflow has no `XY Plot` node.
    pub fn collapse_xy_plot(&mut self) {
        if !self.has_node("XY Plot") {
            return;
        }
        for name in XY_PLOT_NODES {
            if self.has_node(name) {
                // Existence was checked just above.
                let _ = self.remove_node(name);
            }
        }
    }

    /// The workflow as the `prompt` payload for `/prompt`.
    pub fn to_prompt(&self) -> Value {
        Value::Object(self.nodes.clone())
    }

    // ---- private helpers ----

    fn inputs_mut(&mut self, node_name: &str) -> Result<&mut Map<String, Value>, WorkflowError> {
        let id = self
            .node_id_for_name(node_name)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_name.to_string()))?
            .to_string();
        let node = self
            .nodes
            .get_mut(&id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| WorkflowError::Malformed(format!("node {id} is not an object")))?;
        let inputs = node
            .entry("inputs")
            .or_insert_with(|| Value::Object(Map::new()));
        inputs
            .as_object_mut()
            .ok_or_else(|| WorkflowError::Malformed(format!("node {id} inputs are not an object")))
    }

    fn input_slot(&mut self, node_name: &str, input: &str) -> Result<&mut Value, WorkflowError> {
        let inputs = self.inputs_mut(node_name)?;
        inputs.get_mut(input).ok_or_else(|| WorkflowError::InputNotFound {
            node: node_name.to_string(),
            input: input.to_string(),
        })
    }
}

fn title_of(node: &Value) -> Option<&str> {
    node.get("_meta")?.get("title")?.as_str()
}

fn class_of(node: &Value) -> Option<&str> {
    node.get("class_type")?.as_str()
}

/// Inputs wired to another node are `[node_id, output_index]`.
fn links_to(value: &Value, node_id: &str) -> bool {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(id), Value::Number(_)]) => id == node_id,
        _ => false,
    }
}

fn same_kind(current: &Value, new: &Value) -> bool {
    match (current, new) {
        (Value::Null, Value::Null)
        | (Value::Bool(_), Value::Bool(_))
        | (Value::String(_), Value::String(_))
        | (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_)) => true,
        (Value::Number(a), Value::Number(b)) => a.is_f64() == b.is_f64(),
        _ => false,
    }
}
