//! Mesh geometry capture.
//!
//! The viewer exposes inserted geometry as up to three vertex groups
//! (faces, lines, points). Each group reports a vertex count and a set of
//! capability flags, and yields a fresh vertex iterator on every call.
//!
//! Flattening turns one group into parallel numeric arrays:
//!
//! ```text
//! position: [x0, y0, z0, x1, y1, z1, ...]
//! normal:   [nx0, ny0, nz0, ...]        (only when the group has normals)
//! rgba:     [r0, g0, b0, a0, ...]       (only when the group has colors)
//! uv:       [u0, v0, u1, v1, ...]       (only when the group has UVs)
//! ```
//!
//! Capability flags are read once per group. A vertex that lacks an attribute
//! its group promised is a collaborator bug and rejects the whole mesh.

use serde::{Deserialize, Serialize};

use super::{ChangeSetError, NodeId};

/// Geometry subset a vertex group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Triangle faces.
    Faces,
    /// Polylines.
    Lines,
    /// Point cloud.
    Points,
}

impl GroupKind {
    /// All kinds, in record order.
    pub const ALL: [GroupKind; 3] = [GroupKind::Faces, GroupKind::Lines, GroupKind::Points];

    /// JSON key used for this group in a mesh record.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Faces => "faces",
            Self::Lines => "lines",
            Self::Points => "points",
        }
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-vertex attributes a group carries in addition to `position`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexCapabilities {
    /// Every vertex carries a normal.
    pub normals: bool,
    /// Every vertex carries an RGBA color.
    pub rgba: bool,
    /// Every vertex carries a texture coordinate.
    pub uvs: bool,
}

impl VertexCapabilities {
    /// Position only.
    pub const POSITION_ONLY: Self = Self {
        normals: false,
        rgba: false,
        uvs: false,
    };
}

/// One vertex as produced by the viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vertex {
    /// Position, always present.
    pub position: [f32; 3],
    /// Normal, meaningful only if the group has normals.
    pub normal: Option<[f32; 3]>,
    /// RGBA color, meaningful only if the group has colors.
    pub rgba: Option<[u8; 4]>,
    /// Texture coordinate, meaningful only if the group has UVs.
    pub uv: Option<[f32; 2]>,
}

impl Vertex {
    /// Vertex with only a position.
    pub fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Attach a normal.
    pub fn with_normal(mut self, normal: [f32; 3]) -> Self {
        self.normal = Some(normal);
        self
    }

    /// Attach an RGBA color.
    pub fn with_rgba(mut self, rgba: [u8; 4]) -> Self {
        self.rgba = Some(rgba);
        self
    }

    /// Attach a texture coordinate.
    pub fn with_uv(mut self, uv: [f32; 2]) -> Self {
        self.uv = Some(uv);
        self
    }
}

/// A finite, restartable vertex sequence supplied by the viewer.
///
/// `vertices()` must return a fresh iterator from the first vertex on every
/// call. Flattening consumes it exactly once.
pub trait MeshVertexGroup {
    /// Number of vertices the group reports.
    fn vertex_count(&self) -> usize;

    /// Attributes present on every vertex of this group.
    fn capabilities(&self) -> VertexCapabilities;

    /// Iterate the group's vertices from the start.
    fn vertices(&self) -> impl Iterator<Item = Vertex> + '_;
}

/// In-memory vertex group.
///
/// Used when geometry is already materialized, e.g. when replaying a saved
/// change set or in tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexList {
    capabilities: VertexCapabilities,
    vertices: Vec<Vertex>,
}

impl VertexList {
    /// Create a group from its capability flags and vertices.
    pub fn new(capabilities: VertexCapabilities, vertices: Vec<Vertex>) -> Self {
        Self {
            capabilities,
            vertices,
        }
    }
}

impl MeshVertexGroup for VertexList {
    fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    fn capabilities(&self) -> VertexCapabilities {
        self.capabilities
    }

    fn vertices(&self) -> impl Iterator<Item = Vertex> + '_ {
        self.vertices.iter().copied()
    }
}

/// Triangle winding order of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Winding {
    /// Clockwise front faces.
    Clockwise,
    /// Counter-clockwise front faces.
    CounterClockwise,
    /// Not specified by the viewer.
    Unknown,
}

/// Mesh geometry handed to [`ChangeSetAccumulator::update_meshes`].
///
/// [`ChangeSetAccumulator::update_meshes`]: super::ChangeSetAccumulator::update_meshes
#[derive(Debug, Clone)]
pub struct MeshData<G> {
    /// Face group, if the mesh has one.
    pub faces: Option<G>,
    /// Line group, if the mesh has one.
    pub lines: Option<G>,
    /// Point group, if the mesh has one.
    pub points: Option<G>,
    /// Whether the face set is closed.
    pub is_manifold: Option<bool>,
    /// Whether back faces are rendered.
    pub is_two_sided: Option<bool>,
    /// Front-face winding.
    pub winding: Option<Winding>,
}

impl<G> MeshData<G> {
    /// Mesh with no groups and no metadata.
    pub fn new() -> Self {
        Self {
            faces: None,
            lines: None,
            points: None,
            is_manifold: None,
            is_two_sided: None,
            winding: None,
        }
    }

    fn group(&self, kind: GroupKind) -> Option<&G> {
        match kind {
            GroupKind::Faces => self.faces.as_ref(),
            GroupKind::Lines => self.lines.as_ref(),
            GroupKind::Points => self.points.as_ref(),
        }
    }
}

impl<G> Default for MeshData<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// One vertex group flattened into parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlattenedGroup {
    /// `x, y, z` per vertex.
    pub position: Vec<f32>,
    /// `x, y, z` per vertex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<Vec<f32>>,
    /// `r, g, b, a` per vertex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rgba: Option<Vec<u8>>,
    /// `u, v` per vertex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uv: Option<Vec<f32>>,
}

impl FlattenedGroup {
    fn with_capacity(count: usize, caps: VertexCapabilities) -> Self {
        Self {
            position: Vec::with_capacity(count * 3),
            normal: caps.normals.then(|| Vec::with_capacity(count * 3)),
            rgba: caps.rgba.then(|| Vec::with_capacity(count * 4)),
            uv: caps.uvs.then(|| Vec::with_capacity(count * 2)),
        }
    }
}

/// Flattened geometry for one inserted mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshRecord {
    /// Face arrays, absent when the group was empty or missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faces: Option<FlattenedGroup>,
    /// Line arrays, absent when the group was empty or missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<FlattenedGroup>,
    /// Point arrays, absent when the group was empty or missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<FlattenedGroup>,
    /// See [`MeshData::is_manifold`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_manifold: Option<bool>,
    /// See [`MeshData::is_two_sided`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_two_sided: Option<bool>,
    /// See [`MeshData::winding`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winding: Option<Winding>,
}

impl MeshRecord {
    /// Flattened arrays for `kind`, if present.
    pub fn group(&self, kind: GroupKind) -> Option<&FlattenedGroup> {
        match kind {
            GroupKind::Faces => self.faces.as_ref(),
            GroupKind::Lines => self.lines.as_ref(),
            GroupKind::Points => self.points.as_ref(),
        }
    }

    fn set_group(&mut self, kind: GroupKind, group: FlattenedGroup) {
        match kind {
            GroupKind::Faces => self.faces = Some(group),
            GroupKind::Lines => self.lines = Some(group),
            GroupKind::Points => self.points = Some(group),
        }
    }

    /// Flatten every non-empty group of `mesh`.
    pub(crate) fn capture<G: MeshVertexGroup>(
        node_id: NodeId,
        mesh: &MeshData<G>,
    ) -> Result<Self, ChangeSetError> {
        let mut record = Self {
            is_manifold: mesh.is_manifold,
            is_two_sided: mesh.is_two_sided,
            winding: mesh.winding,
            ..Self::default()
        };

        for kind in GroupKind::ALL {
            let Some(group) = mesh.group(kind) else {
                continue;
            };
            if let Some(flat) = flatten_group(node_id, kind, group)? {
                record.set_group(kind, flat);
            }
        }

        Ok(record)
    }
}

/// An inserted mesh attached under a parent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshUpdate {
    /// Node created for the mesh instance.
    pub node_id: NodeId,
    /// Node the mesh was inserted under.
    pub parent_node_id: NodeId,
    /// Flattened geometry.
    pub mesh: MeshRecord,
}

/// Flatten one group, or `None` when it reports zero vertices.
fn flatten_group<G: MeshVertexGroup>(
    node_id: NodeId,
    kind: GroupKind,
    group: &G,
) -> Result<Option<FlattenedGroup>, ChangeSetError> {
    let count = group.vertex_count();
    if count == 0 {
        return Ok(None);
    }

    let caps = group.capabilities();
    let vertices = group.vertices();
    // The reported count comes from the viewer; only trust what the
    // iterator promises to yield.
    let mut flat = FlattenedGroup::with_capacity(count.min(vertices.size_hint().0), caps);
    let missing = |vertex: usize, attribute: &'static str| ChangeSetError::MissingVertexAttribute {
        node_id,
        group: kind,
        vertex,
        attribute,
    };

    let mut seen = 0usize;
    for (index, vertex) in vertices.enumerate() {
        flat.position.extend_from_slice(&vertex.position);
        if let Some(normals) = flat.normal.as_mut() {
            normals.extend_from_slice(&vertex.normal.ok_or_else(|| missing(index, "normal"))?);
        }
        if let Some(colors) = flat.rgba.as_mut() {
            colors.extend_from_slice(&vertex.rgba.ok_or_else(|| missing(index, "rgba"))?);
        }
        if let Some(uvs) = flat.uv.as_mut() {
            uvs.extend_from_slice(&vertex.uv.ok_or_else(|| missing(index, "uv"))?);
        }
        seen += 1;
    }

    if seen != count {
        log::warn!(
            "Mesh {} {} group reported {} vertices but yielded {}",
            node_id,
            kind,
            count,
            seen
        );
    }

    Ok(Some(flat))
}
