//! Directed port-to-port connectivity between a pair of modules.
//!
//! Connections between two modules never loop back into the same side, so
//! the two directions are stored as separate `(N_A, N_B)` and `(N_B, N_A)`
//! matrices rather than one `(N_A + N_B)²` matrix. Each direction carries an
//! open-ended family of named parameter matrices created on first write; the
//! reserved name `conn` holds the 0/1 adjacency used for projection.

use indexmap::IndexMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreError;
use crate::id::ModuleId;
use crate::matrix::{ParamType, ParamValue, SparseMatrix};

/// Reserved parameter name for the adjacency matrices.
pub const PARAM_CONN: &str = "conn";

/// One of the two directions an edge between the pair can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    AToB,
    BToA,
}

/// Key of one parameter matrix: direction, connection index, parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParamKey {
    dir: Direction,
    conn: usize,
    name: String,
}

impl ParamKey {
    fn conn_matrix(dir: Direction, conn: usize) -> Self {
        Self {
            dir,
            conn,
            name: PARAM_CONN.to_string(),
        }
    }
}

/// Sparse bidirectional port mapping between two modules.
///
/// Every entry is addressed by source module, source port, destination
/// module, destination port, connection index (for parallel edges between
/// the same port pair), and parameter name. The connection-index capacity
/// `n_mult` is a high-water mark that grows as higher indices are first
/// written.
#[derive(Debug, Clone)]
pub struct Connectivity {
    uid: Uuid,
    a_id: ModuleId,
    b_id: ModuleId,
    n_a: usize,
    n_b: usize,
    n_mult: usize,
    params: IndexMap<ParamKey, SparseMatrix>,
}

impl Connectivity {
    /// Create a connectivity object with a single connection index.
    pub fn new(
        n_a: usize,
        n_b: usize,
        a_id: impl Into<ModuleId>,
        b_id: impl Into<ModuleId>,
    ) -> Result<Self, CoreError> {
        Self::with_multiplicity(n_a, n_b, 1, a_id, b_id)
    }

    /// Create a connectivity object supporting `n_mult` parallel connections
    /// between any port pair. `n_mult` may still grow later.
    pub fn with_multiplicity(
        n_a: usize,
        n_b: usize,
        n_mult: usize,
        a_id: impl Into<ModuleId>,
        b_id: impl Into<ModuleId>,
    ) -> Result<Self, CoreError> {
        let a_id = a_id.into();
        let b_id = b_id.into();
        if n_a == 0 || n_b == 0 {
            return Err(CoreError::InvalidShape(
                "port counts must be nonzero".to_string(),
            ));
        }
        if n_mult == 0 {
            return Err(CoreError::InvalidShape(
                "connection multiplicity must be nonzero".to_string(),
            ));
        }
        if a_id.is_empty() || b_id.is_empty() {
            return Err(CoreError::InvalidShape(
                "module IDs must be non-empty".to_string(),
            ));
        }
        if a_id == b_id {
            return Err(CoreError::InvalidShape(format!(
                "module IDs must differ, got '{a_id}' twice"
            )));
        }

        // The adjacency matrices at connection index 0 exist from the start.
        let mut params = IndexMap::new();
        params.insert(
            ParamKey::conn_matrix(Direction::AToB, 0),
            SparseMatrix::new(n_a, n_b, ParamType::Int),
        );
        params.insert(
            ParamKey::conn_matrix(Direction::BToA, 0),
            SparseMatrix::new(n_b, n_a, ParamType::Int),
        );

        Ok(Self {
            uid: Uuid::new_v4(),
            a_id,
            b_id,
            n_a,
            n_b,
            n_mult,
            params,
        })
    }

    /// Instance identity, used by manager registries.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn a_id(&self) -> &ModuleId {
        &self.a_id
    }

    pub fn b_id(&self) -> &ModuleId {
        &self.b_id
    }

    /// Current connection-index high-water mark.
    pub fn n_mult(&self) -> usize {
        self.n_mult
    }

    /// Number of ports on the side identified by `id`.
    pub fn n(&self, id: &ModuleId) -> Result<usize, CoreError> {
        if *id == self.a_id {
            Ok(self.n_a)
        } else if *id == self.b_id {
            Ok(self.n_b)
        } else {
            Err(CoreError::UnknownModule(id.to_string()))
        }
    }

    /// The ID on the other side of the pair.
    pub fn other_mod(&self, id: &ModuleId) -> Result<&ModuleId, CoreError> {
        if *id == self.a_id {
            Ok(&self.b_id)
        } else if *id == self.b_id {
            Ok(&self.a_id)
        } else {
            Err(CoreError::UnknownModule(id.to_string()))
        }
    }

    fn direction(&self, src: &ModuleId, dst: &ModuleId) -> Result<Direction, CoreError> {
        if *src == self.a_id && *dst == self.b_id {
            Ok(Direction::AToB)
        } else if *src == self.b_id && *dst == self.a_id {
            Ok(Direction::BToA)
        } else {
            Err(CoreError::UnknownModule(format!("{src} -> {dst}")))
        }
    }

    fn shape(&self, dir: Direction) -> (usize, usize) {
        match dir {
            Direction::AToB => (self.n_a, self.n_b),
            Direction::BToA => (self.n_b, self.n_a),
        }
    }

    /// True if any parameter matrix in `src -> dst` has a nonzero entry.
    pub fn is_connected(&self, src: &ModuleId, dst: &ModuleId) -> Result<bool, CoreError> {
        let dir = self.direction(src, dst)?;
        Ok(self
            .params
            .iter()
            .any(|(key, m)| key.dir == dir && m.nnz() > 0))
    }

    /// Mask over source ports: true where the port has an adjacency entry to
    /// any of the selected destination ports (all of them when `dest_ports`
    /// is `None`), at any connection index.
    pub fn src_mask(
        &self,
        src: &ModuleId,
        dst: &ModuleId,
        dest_ports: Option<&[usize]>,
    ) -> Result<Vec<bool>, CoreError> {
        let dir = self.direction(src, dst)?;
        let (rows, _) = self.shape(dir);
        let mut mask = vec![false; rows];
        for conn in 0..self.n_mult {
            if let Some(m) = self.params.get(&ParamKey::conn_matrix(dir, conn)) {
                for (i, j, _) in m.entries() {
                    if dest_ports.map_or(true, |ports| ports.contains(&j)) {
                        mask[i] = true;
                    }
                }
            }
        }
        Ok(mask)
    }

    /// Sorted indices of source ports with connections to the selected
    /// destination ports.
    pub fn src_idx(
        &self,
        src: &ModuleId,
        dst: &ModuleId,
        dest_ports: Option<&[usize]>,
    ) -> Result<Vec<usize>, CoreError> {
        Ok(mask_to_indices(&self.src_mask(src, dst, dest_ports)?))
    }

    /// Mask over destination ports: true where the port has an adjacency
    /// entry from any of the selected source ports.
    pub fn dest_mask(
        &self,
        src: &ModuleId,
        dst: &ModuleId,
        src_ports: Option<&[usize]>,
    ) -> Result<Vec<bool>, CoreError> {
        let dir = self.direction(src, dst)?;
        let (_, cols) = self.shape(dir);
        let mut mask = vec![false; cols];
        for conn in 0..self.n_mult {
            if let Some(m) = self.params.get(&ParamKey::conn_matrix(dir, conn)) {
                for (i, j, _) in m.entries() {
                    if src_ports.map_or(true, |ports| ports.contains(&i)) {
                        mask[j] = true;
                    }
                }
            }
        }
        Ok(mask)
    }

    /// Sorted indices of destination ports with connections from the
    /// selected source ports.
    pub fn dest_idx(
        &self,
        src: &ModuleId,
        dst: &ModuleId,
        src_ports: Option<&[usize]>,
    ) -> Result<Vec<usize>, CoreError> {
        Ok(mask_to_indices(&self.dest_mask(src, dst, src_ports)?))
    }

    /// Read the adjacency entry at connection index 0.
    pub fn get(
        &self,
        src: &ModuleId,
        src_port: usize,
        dst: &ModuleId,
        dst_port: usize,
    ) -> Result<ParamValue, CoreError> {
        self.get_param(src, src_port, dst, dst_port, 0, PARAM_CONN)
    }

    /// Read a parameter entry. Absent storage reads as the parameter's zero.
    pub fn get_param(
        &self,
        src: &ModuleId,
        src_port: usize,
        dst: &ModuleId,
        dst_port: usize,
        conn: usize,
        name: &str,
    ) -> Result<ParamValue, CoreError> {
        let dir = self.direction(src, dst)?;
        let key = ParamKey {
            dir,
            conn,
            name: name.to_string(),
        };
        match self.params.get(&key) {
            Some(m) => m.get(src_port, dst_port),
            None => {
                let (rows, cols) = self.shape(dir);
                if src_port >= rows || dst_port >= cols {
                    return Err(CoreError::InvalidShape(format!(
                        "index ({src_port}, {dst_port}) out of range for {rows}x{cols} direction"
                    )));
                }
                Ok(self.param_dtype(name).zero())
            }
        }
    }

    /// Read a rectangular block of a parameter as row-major rows.
    pub fn get_block(
        &self,
        src: &ModuleId,
        src_ports: &[usize],
        dst: &ModuleId,
        dst_ports: &[usize],
        conn: usize,
        name: &str,
    ) -> Result<Vec<Vec<ParamValue>>, CoreError> {
        let mut rows = Vec::with_capacity(src_ports.len());
        for &i in src_ports {
            let mut row = Vec::with_capacity(dst_ports.len());
            for &j in dst_ports {
                row.push(self.get_param(src, i, dst, j, conn, name)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Write the adjacency entry at connection index 0 to 1.
    pub fn set(
        &mut self,
        src: &ModuleId,
        src_port: usize,
        dst: &ModuleId,
        dst_port: usize,
    ) -> Result<(), CoreError> {
        self.set_param(src, src_port, dst, dst_port, 0, PARAM_CONN, ParamValue::Int(1))
    }

    /// Write a parameter entry, creating the backing matrix on first write.
    ///
    /// The new matrix's element type is taken from the first stored value;
    /// all matrices sharing a parameter name must agree on it. Writing at a
    /// connection index at or above `n_mult` raises the high-water mark.
    pub fn set_param(
        &mut self,
        src: &ModuleId,
        src_port: usize,
        dst: &ModuleId,
        dst_port: usize,
        conn: usize,
        name: &str,
        val: impl Into<ParamValue>,
    ) -> Result<(), CoreError> {
        let val = val.into();
        let dir = self.direction(src, dst)?;
        let key = ParamKey {
            dir,
            conn,
            name: name.to_string(),
        };
        if !self.params.contains_key(&key) {
            if let Some(existing) = self.param_dtype_opt(name) {
                if existing != val.param_type() {
                    return Err(CoreError::TypeMismatch(format!(
                        "parameter '{name}' already stores {existing:?} values"
                    )));
                }
            }
            debug!(param = name, conn, "creating parameter matrix");
        }
        let (rows, cols) = self.shape(dir);
        self.params
            .entry(key)
            .or_insert_with(|| SparseMatrix::new(rows, cols, val.param_type()))
            .set(src_port, dst_port, val)?;
        if conn + 1 > self.n_mult {
            self.n_mult = conn + 1;
        }
        Ok(())
    }

    fn param_dtype_opt(&self, name: &str) -> Option<ParamType> {
        self.params
            .iter()
            .find(|(key, _)| key.name == name)
            .map(|(_, m)| m.dtype())
    }

    fn param_dtype(&self, name: &str) -> ParamType {
        self.param_dtype_opt(name).unwrap_or(ParamType::Int)
    }

    /// A fresh object with the two sides swapped and every connection
    /// reversed: an `A:i -> B:j` entry becomes `B:j -> A:i`.
    pub fn transpose(&self) -> Connectivity {
        let mut params = IndexMap::new();
        for (key, m) in &self.params {
            params.insert(key.clone(), m.transpose());
        }
        Connectivity {
            uid: Uuid::new_v4(),
            a_id: self.b_id.clone(),
            b_id: self.a_id.clone(),
            n_a: self.n_b,
            n_b: self.n_a,
            n_mult: self.n_mult,
            params,
        }
    }

    /// Approximate number of bytes occupied by the stored entries.
    pub fn nbytes(&self) -> usize {
        self.params.values().map(|m| m.nnz() * 8).sum()
    }
}

/// Equality ignores the instance uid: two objects are equal when they relate
/// the same modules with the same shapes, multiplicity, and entries.
impl PartialEq for Connectivity {
    fn eq(&self, other: &Self) -> bool {
        self.a_id == other.a_id
            && self.b_id == other.b_id
            && self.n_a == other.n_a
            && self.n_b == other.n_b
            && self.n_mult == other.n_mult
            && self.params == other.params
    }
}

fn mask_to_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &set)| set.then_some(i))
        .collect()
}
