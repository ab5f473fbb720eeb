//! Per-session scene edit accumulation.
//!
//! A [`ChangeSetAccumulator`] records edits made in one viewer session and
//! serializes them on demand for the authoring process.
//!
//! # Payload
//!
//! ```json
//! {
//!   "attributes":    [{"nodeId": 12, "Material": "Steel"}],
//!   "colors":        [{"nodeId": 7, "color": {"r": 255, "g": 0, "b": 0}, "scInstanceId": [1, 42]}],
//!   "meshes":        [{"nodeId": 30, "parentNodeId": 2, "mesh": {"faces": {"position": [...]}}}],
//!   "defaultCamera": null,
//!   "nodeNames":     [{"nodeId": 30, "nodeName": "bracket"}]
//! }
//! ```
//!
//! # Edit history
//!
//! Every bucket except `defaultCamera` is an append-only log. Two attribute
//! updates for the same node produce two records, applied in order by the
//! authoring process. Sending does not clear anything; each send carries the
//! whole session history. Call [`ChangeSetAccumulator::clear`] to start over.

pub mod mesh;

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

pub use mesh::{
    FlattenedGroup, GroupKind, MeshData, MeshRecord, MeshUpdate, MeshVertexGroup, Vertex,
    VertexCapabilities, VertexList, Winding,
};

/// Scene-graph node identifier assigned by the viewer.
pub type NodeId = u32;

/// Property name reserved for the node identifier in attribute records.
const NODE_ID_KEY: &str = "nodeId";

/// Payload keys holding append-only record lists.
const LIST_BUCKETS: [&str; 4] = ["attributes", "colors", "meshes", "nodeNames"];

// ============================================================================
// Records
// ============================================================================

/// A named attribute value. Passed through uninterpreted.
///
/// Any JSON value is accepted and re-serialized as written, so `3` stays
/// `3` and `true` stays `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeValue(pub serde_json::Value);

impl AttributeValue {
    /// The raw JSON value.
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self(serde_json::Value::from(value))
    }
}

/// One attribute edit: a node plus the properties set on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeUpdate {
    /// Edited node.
    pub node_id: NodeId,
    /// Properties, serialized alongside `nodeId`.
    #[serde(flatten)]
    pub properties: BTreeMap<String, AttributeValue>,
}

/// RGB color as reported by the viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    /// Red.
    pub r: f64,
    /// Green.
    pub g: f64,
    /// Blue.
    pub b: f64,
}

impl Rgb {
    /// Build a color from its components.
    pub fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }
}

/// Opaque instance identifier the authoring side uses to find a mesh instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScInstanceId(pub serde_json::Value);

/// One color edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorUpdate {
    /// Recolored node.
    pub node_id: NodeId,
    /// New color.
    pub color: Rgb,
    /// Instance the node resolves to.
    pub sc_instance_id: ScInstanceId,
}

/// One node rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeNameUpdate {
    /// Renamed node.
    pub node_id: NodeId,
    /// New name.
    pub node_name: String,
}

/// Everything a session has edited so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeSet {
    /// Attribute edits, in call order.
    pub attributes: Vec<AttributeUpdate>,
    /// Color edits, in call order.
    pub colors: Vec<ColorUpdate>,
    /// Inserted meshes, in call order.
    pub meshes: Vec<MeshUpdate>,
    /// Camera snapshot to store as the model's default view.
    pub default_camera: Option<serde_json::Value>,
    /// Node renames, in call order.
    pub node_names: Vec<NodeNameUpdate>,
}

impl ChangeSet {
    /// True when no bucket holds anything.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.colors.is_empty()
            && self.meshes.is_empty()
            && self.default_camera.is_none()
            && self.node_names.is_empty()
    }

    /// Serialize to the JSON payload sent to the authoring process.
    pub fn to_payload(&self) -> Result<String, ChangeSetError> {
        serde_json::to_string(self).map_err(|e| ChangeSetError::MalformedPayload(e.to_string()))
    }

    /// Parse a JSON payload. Missing buckets are treated as empty.
    pub fn from_payload(payload: &str) -> Result<Self, ChangeSetError> {
        serde_json::from_str(payload).map_err(|e| ChangeSetError::MalformedPayload(e.to_string()))
    }

    /// Check that `payload` has the shape of a change set without
    /// interpreting its contents.
    ///
    /// The payload must be a JSON object. Each list bucket that is present
    /// must be an array of objects, and `defaultCamera` must be an object or
    /// null. Attribute values, mesh arrays and unknown keys are not inspected,
    /// so anything the viewer sends in a well-formed record reaches the
    /// authoring process byte for byte.
    pub fn validate_payload(payload: &str) -> Result<(), ChangeSetError> {
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ChangeSetError::MalformedPayload(e.to_string()))?;
        let Some(root) = value.as_object() else {
            return Err(ChangeSetError::MalformedPayload(
                "change set must be a JSON object".to_string(),
            ));
        };

        for bucket in LIST_BUCKETS {
            let Some(records) = root.get(bucket) else {
                continue;
            };
            let Some(records) = records.as_array() else {
                return Err(ChangeSetError::MalformedPayload(format!(
                    "{bucket} must be an array"
                )));
            };
            if let Some(index) = records.iter().position(|r| !r.is_object()) {
                return Err(ChangeSetError::MalformedPayload(format!(
                    "{bucket}[{index}] must be an object"
                )));
            }
        }

        match root.get("defaultCamera") {
            None | Some(serde_json::Value::Null | serde_json::Value::Object(_)) => Ok(()),
            Some(_) => Err(ChangeSetError::MalformedPayload(
                "defaultCamera must be an object or null".to_string(),
            )),
        }
    }
}

// ============================================================================
// Collaborator seams
// ============================================================================

/// Resolves a node to the instance id the authoring side knows it by.
pub trait InstanceIdLookup {
    /// Instance id for `node_id`, or `None` if the viewer has none.
    fn instance_id(&self, node_id: NodeId) -> Option<ScInstanceId>;
}

impl<S: BuildHasher> InstanceIdLookup for HashMap<NodeId, ScInstanceId, S> {
    fn instance_id(&self, node_id: NodeId) -> Option<ScInstanceId> {
        self.get(&node_id).cloned()
    }
}

impl InstanceIdLookup for BTreeMap<NodeId, ScInstanceId> {
    fn instance_id(&self, node_id: NodeId) -> Option<ScInstanceId> {
        self.get(&node_id).cloned()
    }
}

/// Outbound side of a session's transport.
///
/// Implementations queue the payload and return without waiting for the
/// server to acknowledge it.
pub trait SubmissionSink {
    /// Queue one serialized change set for delivery.
    fn submit_payload(&self, payload: String) -> Result<(), TransportError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from recording or sending edits.
///
/// None of these poison the accumulator: the failing update is dropped and
/// everything recorded before it is kept.
#[derive(Debug)]
pub enum ChangeSetError {
    /// A color edit named a node the lookup could not resolve.
    MissingInstanceId(NodeId),
    /// An attribute edit tried to set the reserved `nodeId` property.
    ReservedProperty(String),
    /// A vertex lacked an attribute its group's capability flags promised.
    MissingVertexAttribute {
        /// Mesh node being captured.
        node_id: NodeId,
        /// Group the vertex belongs to.
        group: GroupKind,
        /// Vertex index within the group.
        vertex: usize,
        /// Missing attribute name.
        attribute: &'static str,
    },
    /// Serialization or parsing failed.
    MalformedPayload(String),
    /// The payload could not be handed to the transport.
    Transport(TransportError),
}

impl std::fmt::Display for ChangeSetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInstanceId(node) => write!(f, "No instance id for node {node}"),
            Self::ReservedProperty(name) => write!(f, "Property name is reserved: {name}"),
            Self::MissingVertexAttribute {
                node_id,
                group,
                vertex,
                attribute,
            } => write!(
                f,
                "Mesh {node_id}: {group} vertex {vertex} is missing its {attribute}"
            ),
            Self::MalformedPayload(msg) => write!(f, "Malformed payload: {msg}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ChangeSetError {}

impl From<TransportError> for ChangeSetError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ============================================================================
// Accumulator
// ============================================================================

/// Owns one session's pending edits.
///
/// Mutations take `&mut self` and [`send`](Self::send) takes `&self`, so a
/// send always serializes a consistent snapshot.
#[derive(Debug, Default)]
pub struct ChangeSetAccumulator {
    changes: ChangeSet,
}

impl ChangeSetAccumulator {
    /// Empty accumulator for a new session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously recorded change set.
    pub fn from_change_set(changes: ChangeSet) -> Self {
        Self { changes }
    }

    /// Append an attribute record for `node_id`.
    ///
    /// Earlier records for the same node are left alone.
    pub fn update_attributes<I, K, V>(&mut self, node_id: NodeId, props: I) -> Result<(), ChangeSetError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let mut properties = BTreeMap::new();
        for (key, value) in props {
            let key = key.into();
            if key == NODE_ID_KEY {
                return Err(ChangeSetError::ReservedProperty(key));
            }
            properties.insert(key, value.into());
        }

        self.changes.attributes.push(AttributeUpdate {
            node_id,
            properties,
        });
        Ok(())
    }

    /// Replace the default camera snapshot.
    pub fn update_default_camera_view(&mut self, camera: serde_json::Value) {
        self.changes.default_camera = Some(camera);
    }

    /// Append one color record per assignment.
    ///
    /// Every node is resolved before anything is appended; if any lookup
    /// misses, nothing from this call is recorded. Returns the number of
    /// records appended.
    pub fn update_colors<I, L>(&mut self, assignments: I, lookup: &L) -> Result<usize, ChangeSetError>
    where
        I: IntoIterator<Item = (NodeId, Rgb)>,
        L: InstanceIdLookup + ?Sized,
    {
        let resolved = assignments
            .into_iter()
            .map(|(node_id, color)| {
                lookup
                    .instance_id(node_id)
                    .map(|sc_instance_id| ColorUpdate {
                        node_id,
                        color,
                        sc_instance_id,
                    })
                    .ok_or(ChangeSetError::MissingInstanceId(node_id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let appended = resolved.len();
        self.changes.colors.extend(resolved);
        Ok(appended)
    }

    /// Flatten `mesh` and append it as inserted under `parent_node_id`.
    ///
    /// Groups reporting zero vertices are left out of the record.
    pub fn update_meshes<G: MeshVertexGroup>(
        &mut self,
        node_id: NodeId,
        parent_node_id: NodeId,
        mesh: &MeshData<G>,
    ) -> Result<(), ChangeSetError> {
        let record = MeshRecord::capture(node_id, mesh)?;
        self.changes.meshes.push(MeshUpdate {
            node_id,
            parent_node_id,
            mesh: record,
        });
        Ok(())
    }

    /// Append a rename of `node_id`.
    pub fn update_node_name(&mut self, node_id: NodeId, name: impl Into<String>) {
        self.changes.node_names.push(NodeNameUpdate {
            node_id,
            node_name: name.into(),
        });
    }

    /// The live change set.
    pub fn current_change_set(&self) -> &ChangeSet {
        &self.changes
    }

    /// Serialize the current change set.
    pub fn to_payload(&self) -> Result<String, ChangeSetError> {
        self.changes.to_payload()
    }

    /// Serialize everything recorded so far and queue it on `sink`.
    ///
    /// Does not wait for the server and does not clear the accumulator.
    pub fn send<S: SubmissionSink + ?Sized>(&self, sink: &S) -> Result<(), ChangeSetError> {
        let payload = self.to_payload()?;
        log::debug!("[ChangeSet] Sending change set ({} bytes)", payload.len());
        sink.submit_payload(payload)?;
        Ok(())
    }

    /// Drop every recorded edit.
    pub fn clear(&mut self) {
        self.changes = ChangeSet::default();
    }
}
