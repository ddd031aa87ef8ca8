//! The mesh-map tree: a rooted tree of triangulated link meshes joined
//! by rigid frame transforms. Nodes live in an arena
//! (`Vec<MeshMapTreeNode>`) indexed by integer `map_id`; only the transform
//! fields ever mutate after construction.

use nalgebra::{Isometry3, Vector3};
use rustc_hash::FxHashMap;

use crate::error::{ArmclError, Result};

/// One mesh vertex: a position and a (normalised) outward normal, in the
/// link's own frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: Vector3<f64>,
    pub normal: Vector3<f64>,
}

/// An undirected mesh edge with its cached rest length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub v0: usize,
    pub v1: usize,
    pub length: f64,
}

/// A triangulated surface: vertices with normals, undirected edges with
/// cached lengths, and a precomputed 1-ring adjacency list per vertex.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub edges: Vec<Edge>,
    adjacency: Vec<Vec<usize>>,
}

impl Mesh {
    /// Builds a mesh from vertices and `(v0, v1)` edge index pairs,
    /// computing edge lengths and vertex adjacency lists.
    pub fn new(vertices: Vec<Vertex>, edge_pairs: Vec<(usize, usize)>) -> Result<Self> {
        let mut adjacency = vec![Vec::new(); vertices.len()];
        let mut edges = Vec::with_capacity(edge_pairs.len());
        for (v0, v1) in edge_pairs {
            if v0 >= vertices.len() || v1 >= vertices.len() {
                return Err(ArmclError::InvalidInput(format!(
                    "edge ({v0}, {v1}) references a vertex out of range for a mesh with {} vertices",
                    vertices.len()
                )));
            }
            let length = (vertices[v1].position - vertices[v0].position).norm();
            edges.push(Edge { v0, v1, length });
            adjacency[v0].push(v1);
            adjacency[v1].push(v0);
        }
        Ok(Mesh {
            vertices,
            edges,
            adjacency,
        })
    }

    pub fn neighbours(&self, vertex: usize) -> &[usize] {
        &self.adjacency[vertex]
    }

    pub fn degree(&self, vertex: usize) -> usize {
        self.adjacency[vertex].len()
    }

    pub fn sum_edge_length(&self) -> f64 {
        self.edges.iter().map(|e| e.length).sum()
    }

    /// Index of the edge joining `a` and `b`, direction-agnostic.
    pub fn edge_between(&self, a: usize, b: usize) -> Option<usize> {
        self.edges
            .iter()
            .position(|e| (e.v0 == a && e.v1 == b) || (e.v0 == b && e.v1 == a))
    }
}

/// One node of the mesh-map tree: a link's mesh plus its transform chain.
#[derive(Debug, Clone)]
pub struct MeshMapTreeNode {
    pub frame_id: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub mesh: Mesh,
    local_transform: Isometry3<f64>,
    world_transform: Isometry3<f64>,
}

impl MeshMapTreeNode {
    pub fn local_transform(&self) -> &Isometry3<f64> {
        &self.local_transform
    }

    pub fn world_transform(&self) -> &Isometry3<f64> {
        &self.world_transform
    }

    /// World-frame position of a mesh vertex under the node's current
    /// accumulated transform.
    pub fn vertex_world_position(&self, vertex: usize) -> Vector3<f64> {
        self.world_transform
            .transform_point(&self.mesh.vertices[vertex].position.into())
            .coords
    }

    /// World-frame normal of a mesh vertex (rotation only, no translation).
    pub fn vertex_world_normal(&self, vertex: usize) -> Vector3<f64> {
        self.world_transform
            .rotation
            .transform_vector(&self.mesh.vertices[vertex].normal)
    }
}

/// Supplies fresh local (parent-to-node) transforms, one call per frame,
/// during [`MeshMapTree::update_transforms`]. An external kinematics
/// provider is expected to implement this from the current joint
/// configuration; this crate only consumes the result.
pub trait TransformProvider {
    fn local_transform(&self, frame_id: &str) -> Option<Isometry3<f64>>;
}

/// A rooted tree of link meshes. Built once by [`MeshMapTree::load`];
/// afterwards only [`MeshMapTree::update_transforms`] mutates it, and only
/// the transform fields.
#[derive(Debug, Clone)]
pub struct MeshMapTree {
    nodes: Vec<MeshMapTreeNode>,
    index: FxHashMap<String, usize>,
}

impl MeshMapTree {
    /// Builds the tree from pre-parsed meshes, their frame ids, optional
    /// parent frame ids, and the initial local transforms. Mesh file
    /// parsing itself is an external collaborator's job; this is the
    /// boundary the core actually consumes.
    ///
    /// Fails with [`ArmclError::InvalidInput`] if frame ids are not unique,
    /// a parent frame id is not among the supplied frames, or the frames do
    /// not form a single tree with exactly one root.
    pub fn load(
        frame_ids: Vec<String>,
        parent_ids: Vec<Option<String>>,
        local_transforms: Vec<Isometry3<f64>>,
        meshes: Vec<Mesh>,
    ) -> Result<Self> {
        let n = frame_ids.len();
        if parent_ids.len() != n || local_transforms.len() != n || meshes.len() != n {
            return Err(ArmclError::InvalidInput(
                "frame_ids, parent_ids, local_transforms and meshes must have equal length".into(),
            ));
        }
        if n == 0 {
            return Err(ArmclError::InvalidInput("no frames supplied".into()));
        }

        let mut raw_index: FxHashMap<String, usize> = FxHashMap::default();
        for (i, id) in frame_ids.iter().enumerate() {
            if raw_index.insert(id.clone(), i).is_some() {
                return Err(ArmclError::InvalidInput(format!(
                    "duplicate frame id '{id}'"
                )));
            }
        }

        let mut root = None;
        let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, parent) in parent_ids.iter().enumerate() {
            match parent {
                None => {
                    if root.is_some() {
                        return Err(ArmclError::InvalidInput(
                            "more than one root frame (parent id empty)".into(),
                        ));
                    }
                    root = Some(i);
                }
                Some(p) => {
                    let &pi = raw_index.get(p).ok_or_else(|| {
                        ArmclError::InvalidInput(format!(
                            "frame '{}' references unknown parent frame '{p}'",
                            frame_ids[i]
                        ))
                    })?;
                    children_of[pi].push(i);
                }
            }
        }
        let root = root
            .ok_or_else(|| ArmclError::InvalidInput("no root frame (parent id empty)".into()))?;

        // Reindex in parent-before-child (BFS) order so a single linear pass
        // suffices for update_transforms.
        let mut order = Vec::with_capacity(n);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(root);
        while let Some(raw) = queue.pop_front() {
            order.push(raw);
            for &c in &children_of[raw] {
                queue.push_back(c);
            }
        }
        if order.len() != n {
            return Err(ArmclError::InvalidInput(
                "frames do not form a single connected tree".into(),
            ));
        }

        let mut new_index_of = vec![0usize; n];
        for (new_i, &raw) in order.iter().enumerate() {
            new_index_of[raw] = new_i;
        }

        let mut meshes: Vec<Option<Mesh>> = meshes.into_iter().map(Some).collect();
        let mut local_transforms: Vec<Option<Isometry3<f64>>> =
            local_transforms.into_iter().map(Some).collect();

        let mut nodes: Vec<MeshMapTreeNode> = Vec::with_capacity(n);
        let mut index = FxHashMap::default();
        for &raw in &order {
            let parent = parent_ids[raw].as_ref().map(|p| new_index_of[raw_index[p]]);
            let children = children_of[raw].iter().map(|&c| new_index_of[c]).collect();
            let local = local_transforms[raw].take().expect("consumed once");
            let world = match parent {
                Some(p) => nodes[p].world_transform * local,
                None => local,
            };
            let frame_id = frame_ids[raw].clone();
            index.insert(frame_id.clone(), nodes.len());
            nodes.push(MeshMapTreeNode {
                frame_id,
                parent,
                children,
                mesh: meshes[raw].take().expect("consumed once"),
                local_transform: local,
                world_transform: world,
            });
        }

        Ok(MeshMapTree { nodes, index })
    }

    pub fn get(&self, frame_id: &str) -> Option<&MeshMapTreeNode> {
        self.index.get(frame_id).map(|&i| &self.nodes[i])
    }

    pub fn get_index(&self, frame_id: &str) -> Option<usize> {
        self.index.get(frame_id).copied()
    }

    pub fn node(&self, map_id: usize) -> &MeshMapTreeNode {
        &self.nodes[map_id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn frame_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.frame_id.as_str())
    }

    pub fn neighbours(&self, map_id: usize, vertex: usize) -> &[usize] {
        self.nodes[map_id].mesh.neighbours(vertex)
    }

    pub fn sum_edge_length(&self, map_id: usize) -> f64 {
        self.nodes[map_id].mesh.sum_edge_length()
    }

    /// Refreshes every node's local and accumulated world transform from
    /// `provider`, parent before child. A frame the provider has no answer
    /// for keeps its previous local transform. This is only ever called
    /// between observation steps, never mid-step.
    pub fn update_transforms(&mut self, provider: &dyn TransformProvider) {
        for i in 0..self.nodes.len() {
            if let Some(local) = provider.local_transform(&self.nodes[i].frame_id) {
                self.nodes[i].local_transform = local;
            }
            let local = self.nodes[i].local_transform;
            let world = match self.nodes[i].parent {
                Some(p) => self.nodes[p].world_transform * local,
                None => local,
            };
            self.nodes[i].world_transform = world;
        }
    }
}
