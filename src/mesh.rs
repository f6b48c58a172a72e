//! Interface meshes and the data fields attached to them.
//!
//! The coupling core does not own mesh geometry; it consumes a small handle:
//! an ordered sequence of vertices with stable local IDs in `[0, n)`,
//! optional connectivity (edges, triangles, quads), and a list of named data
//! fields whose value vectors the coupling schemes borrow for the duration of
//! a run. Spatial queries and mapping operators live outside the core.

use crate::error::{Error, Result};
use nalgebra::DVector;
use std::cell::RefCell;
use std::rc::Rc;

/// Identifier of a data field, unique per participant.
pub type DataId = i32;

/// Identifier of a mesh, unique per participant.
pub type MeshId = i32;

/// Identifier of a vertex, local to one rank of one mesh.
pub type VertexId = i32;

/// A vertex with its coordinates. Coordinates beyond the mesh dimension
/// are zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vertex {
    pub id: VertexId,
    pub coords: [f64; 3],
}

/// A named data field carried on a mesh.
///
/// `values` has length `vertex_count * dimensions`, laid out vertex-major:
/// `(d0x, d0y[, d0z], d1x, ...)` with the z component omitted in 2-D.
#[derive(Debug)]
pub struct DataField {
    pub id: DataId,
    pub name: String,
    pub dimensions: usize,
    pub values: Rc<RefCell<DVector<f64>>>,
}

impl DataField {
    fn new(id: DataId, name: &str, dimensions: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            dimensions,
            values: Rc::new(RefCell::new(DVector::zeros(0))),
        }
    }
}

/// The mesh handle consumed by the coupling core.
#[derive(Debug)]
pub struct Mesh {
    id: MeshId,
    name: String,
    dimensions: usize,
    vertices: Vec<Vertex>,
    edges: Vec<(VertexId, VertexId)>,
    triangles: Vec<[VertexId; 3]>,
    quads: Vec<[VertexId; 4]>,
    data: Vec<Rc<DataField>>,
}

impl Mesh {
    pub fn new(id: MeshId, name: &str, dimensions: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            dimensions,
            vertices: Vec::new(),
            edges: Vec::new(),
            triangles: Vec::new(),
            quads: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Append a vertex and return its local ID.
    pub fn create_vertex(&mut self, coords: &[f64]) -> VertexId {
        let mut c = [0.0; 3];
        c[..coords.len().min(3)].copy_from_slice(&coords[..coords.len().min(3)]);
        let id = self.vertices.len() as VertexId;
        self.vertices.push(Vertex { id, coords: c });
        id
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Find the vertex closest to `coords` within `tol` per coordinate.
    pub fn vertex_id_at(&self, coords: &[f64], tol: f64) -> Option<VertexId> {
        self.vertices
            .iter()
            .find(|v| {
                v.coords
                    .iter()
                    .zip(coords.iter().chain(std::iter::repeat(&0.0)))
                    .all(|(a, b)| (a - b).abs() <= tol)
            })
            .map(|v| v.id)
    }

    pub fn add_edge(&mut self, a: VertexId, b: VertexId) -> Result<()> {
        self.check_vertex(a)?;
        self.check_vertex(b)?;
        self.edges.push((a, b));
        Ok(())
    }

    pub fn add_triangle(&mut self, v: [VertexId; 3]) -> Result<()> {
        for id in v {
            self.check_vertex(id)?;
        }
        self.triangles.push(v);
        Ok(())
    }

    pub fn add_quad(&mut self, v: [VertexId; 4]) -> Result<()> {
        for id in v {
            self.check_vertex(id)?;
        }
        self.quads.push(v);
        Ok(())
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Create a data field on this mesh. IDs are assigned by the caller
    /// (the facade keeps them unique per participant).
    pub fn create_data(&mut self, id: DataId, name: &str, dimensions: usize) -> Result<Rc<DataField>> {
        if self.data.iter().any(|d| d.name == name) {
            return Err(Error::config(format!(
                "data field \"{name}\" already exists on mesh \"{}\"",
                self.name
            )));
        }
        let field = Rc::new(DataField::new(id, name, dimensions));
        self.data.push(Rc::clone(&field));
        Ok(field)
    }

    /// Size all data value vectors to the current vertex count. Called once
    /// after the vertices are declared; values start at zero.
    pub fn allocate_data_values(&mut self) {
        for field in &self.data {
            let len = self.vertices.len() * field.dimensions;
            let mut values = field.values.borrow_mut();
            if values.len() != len {
                *values = DVector::zeros(len);
            }
        }
    }

    pub fn data(&self) -> &[Rc<DataField>] {
        &self.data
    }

    pub fn data_by_name(&self, name: &str) -> Option<Rc<DataField>> {
        self.data.iter().find(|d| d.name == name).map(Rc::clone)
    }

    pub fn data_by_id(&self, id: DataId) -> Option<Rc<DataField>> {
        self.data.iter().find(|d| d.id == id).map(Rc::clone)
    }

    fn check_vertex(&self, id: VertexId) -> Result<()> {
        if id < 0 || id as usize >= self.vertices.len() {
            return Err(Error::usage(format!(
                "vertex {id} does not exist on mesh \"{}\"",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertices_get_sequential_ids() {
        let mut mesh = Mesh::new(0, "Surface", 3);
        let a = mesh.create_vertex(&[0.0, 0.0, 0.0]);
        let b = mesh.create_vertex(&[1.0, 0.0, 0.0]);
        assert_eq!((a, b), (0, 1));
        assert_eq!(mesh.vertex_count(), 2);
        mesh.add_edge(a, b).unwrap();
        assert!(mesh.add_edge(a, 7).is_err());
    }

    #[test]
    fn data_values_follow_vertex_count() {
        let mut mesh = Mesh::new(0, "Surface", 2);
        let field = mesh.create_data(0, "Forces", 2).unwrap();
        mesh.create_vertex(&[0.0, 0.0]);
        mesh.create_vertex(&[1.0, 0.0]);
        mesh.create_vertex(&[2.0, 0.0]);
        mesh.allocate_data_values();
        assert_eq!(field.values.borrow().len(), 6);
    }

    #[test]
    fn vertex_lookup_by_position() {
        let mut mesh = Mesh::new(0, "Surface", 2);
        mesh.create_vertex(&[0.0, 1.0]);
        mesh.create_vertex(&[2.0, 1.0]);
        assert_eq!(mesh.vertex_id_at(&[2.0, 1.0], 1e-8), Some(1));
        assert_eq!(mesh.vertex_id_at(&[2.0, 1.1], 1e-8), None);
    }
}
