//! Managed object inspector seam.
//!
//! Addresses are opaque 64-bit integers into the dump's managed heap; the
//! inspector decodes one object graph at a time with hard depth, array and
//! string caps so a cyclic or huge graph can never run away.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectLimits {
    pub max_depth: u32,
    pub max_array_elements: usize,
    pub max_string_length: usize,
}

impl Default for InspectLimits {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_array_elements: 10,
            max_string_length: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInspection {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_table: Option<String>,
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fields: Vec<InspectionField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_elements: Option<Vec<ObjectInspection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ObjectInspection {
    /// Inspection result for a closed or missing inspector.
    pub fn unavailable(address: u64) -> Self {
        Self {
            address: format!("{address:#x}"),
            type_name: String::new(),
            error: Some("dump is not open".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InspectionField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Box<ObjectInspection>>,
}

/// Decoder for managed objects in the dump. Thread-safe for reads once the
/// dump is open.
pub trait ManagedObjectInspector: Send + Sync {
    fn is_open(&self) -> bool;

    /// Returns `None` when the address does not resolve to a managed object.
    fn inspect_object(
        &self,
        address: u64,
        method_table: Option<u64>,
        limits: &InspectLimits,
    ) -> Option<ObjectInspection>;
}
