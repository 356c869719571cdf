//! In-memory model of a ComfyUI workflow graph.
//!
//! A workflow document maps string node ids to `{class_type, inputs}`
//! records, where inputs hold either literal values or `[producer_id, slot]`
//! references. The model owns a copy of the node map, so the caller's
//! document is never aliased and stays valid when a patch fails partway.
use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};

/// Well-known `class_type` strings the patch engine operates on. Nodes of any
/// other class pass through unmodified.
pub mod roles {
    pub const TEXT_ENCODER: &str = "CLIPTextEncode";
    pub const LORA_LOADER: &str = "LoraLoader";
    pub const CLIP_LAYER: &str = "CLIPSetLastLayer";
    pub const CONTROLNET_LOADER: &str = "ControlNetLoader";
    pub const IMAGE_LOADER: &str = "LoadImage";
    pub const CONTROLNET_APPLY: &str = "ControlNetApplyAdvanced";
    pub const IPADAPTER_LOADER: &str = "IPAdapterUnifiedLoader";
    pub const IPADAPTER_LOADER_COMMUNITY: &str = "IPAdapterUnifiedLoaderCommunity";
    pub const IPADAPTER_ADVANCED: &str = "IPAdapterAdvanced";
    pub const SAMPLER: &str = "KSampler";
}

/// Build a `[producer_id, slot]` input reference.
pub fn node_ref(id: &str, slot: u64) -> Value {
    json!([id, slot])
}

pub struct WorkflowGraph {
    nodes: Map<String, Value>,
    next_id: u64,
}

impl WorkflowGraph {
    /// Snapshot `document` into a mutable graph. The id counter is seeded
    /// from the current maximum numeric id; ids that do not parse as
    /// integers are left alone and never collide with allocated ones.
    pub fn from_value(document: &Value) -> AppResult<Self> {
        let nodes = document
            .as_object()
            .cloned()
            .ok_or_else(|| {
                AppError::Configuration("workflow document is not a JSON object".to_string())
            })?;
        let next_id = nodes
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);
        Ok(WorkflowGraph { nodes, next_id })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First node of `role` in document order.
    pub fn find_role(&self, role: &str) -> Option<&str> {
        self.nodes.iter().find_map(|(id, node)| {
            (node_role(node) == Some(role)).then_some(id.as_str())
        })
    }

    pub fn get(&self, id: &str) -> AppResult<&Value> {
        self.nodes
            .get(id)
            .ok_or_else(|| AppError::NodeNotFound(format!("node {} not found in workflow", id)))
    }

    pub fn role_of(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).and_then(node_role)
    }

    pub fn input_of(&self, id: &str, key: &str) -> Option<&Value> {
        self.nodes.get(id)?.get("inputs")?.get(key)
    }

    /// Overwrite one input of an existing node.
    pub fn set_input(&mut self, id: &str, key: &str, value: Value) -> AppResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| AppError::NodeNotFound(format!("node {} not found in workflow", id)))?;
        let inputs = inputs_mut(node).ok_or_else(|| {
            AppError::Configuration(format!("node {} is not an object record", id))
        })?;
        inputs.insert(key.to_string(), value);
        Ok(())
    }

    /// Create-or-update a whole node record. An existing node keeps its
    /// class and untouched inputs; provided keys are added or overwritten. A
    /// new node is created with exactly the given inputs.
    pub fn upsert(&mut self, id: &str, role: &str, inputs: Map<String, Value>) {
        match self.nodes.get_mut(id) {
            Some(node) => {
                if !node.is_object() {
                    // A malformed record is replaced wholesale.
                    *node = json!({"class_type": role, "inputs": inputs});
                } else if let Some(node_inputs) = inputs_mut(node) {
                    for (key, value) in inputs {
                        node_inputs.insert(key, value);
                    }
                }
            }
            None => {
                if let Ok(numeric) = id.parse::<u64>() {
                    if numeric >= self.next_id {
                        self.next_id = numeric + 1;
                    }
                }
                self.nodes.insert(
                    id.to_string(),
                    json!({"class_type": role, "inputs": inputs}),
                );
            }
        }
    }

    /// Reserve and return the next unused node id. Monotonic within a
    /// session; never reuses an id already present, including ids allocated
    /// earlier in the same session.
    pub fn allocate_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.nodes)
    }
}

fn node_role(node: &Value) -> Option<&str> {
    node.get("class_type").and_then(|v| v.as_str())
}

fn inputs_mut(node: &mut Value) -> Option<&mut Map<String, Value>> {
    let record = node.as_object_mut()?;
    if !record.get("inputs").map(Value::is_object).unwrap_or(false) {
        record.insert("inputs".to_string(), Value::Object(Map::new()));
    }
    record.get_mut("inputs").and_then(Value::as_object_mut)
}

/// Role → first node id, built in a single document-order pass so repeated
/// lookups cannot disagree about first-match order.
pub struct RoleIndex {
    first: HashMap<String, String>,
}

impl RoleIndex {
    pub fn build(graph: &WorkflowGraph) -> Self {
        let mut first = HashMap::new();
        for (id, node) in graph.nodes.iter() {
            if let Some(role) = node_role(node) {
                first
                    .entry(role.to_string())
                    .or_insert_with(|| id.clone());
            }
        }
        RoleIndex { first }
    }

    pub fn get(&self, role: &str) -> Option<&str> {
        self.first.get(role).map(String::as_str)
    }

    /// Register a node created during the session so later lookups find it.
    pub fn register(&mut self, role: &str, id: &str) {
        self.first
            .entry(role.to_string())
            .or_insert_with(|| id.to_string());
    }
}
