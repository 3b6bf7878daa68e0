//! The routing table: the set of directed flows the broker expects per tick.

use indexmap::IndexSet;
use tracing::debug;

use crate::error::CoreError;
use crate::id::ModuleId;

/// Set of directed edges `(src, dst)` over module IDs.
///
/// An edge exists iff at least one registered connectivity object has a
/// nonzero entry in that direction between the two modules. Iteration order
/// is stable between mutations.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    edges: IndexSet<(ModuleId, ModuleId)>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge. Returns true if it was not already present.
    pub fn add(&mut self, src: ModuleId, dst: ModuleId) -> Result<bool, CoreError> {
        if src == dst {
            return Err(CoreError::InvalidShape(format!(
                "routing edge endpoints must differ, got '{src}' twice"
            )));
        }
        let inserted = self.edges.insert((src.clone(), dst.clone()));
        if inserted {
            debug!(%src, %dst, "routing edge added");
        }
        Ok(inserted)
    }

    pub fn contains(&self, src: &ModuleId, dst: &ModuleId) -> bool {
        self.edges.contains(&(src.clone(), dst.clone()))
    }

    /// Remove an edge. Returns true if it was present.
    pub fn remove(&mut self, src: &ModuleId, dst: &ModuleId) -> bool {
        self.edges.shift_remove(&(src.clone(), dst.clone()))
    }

    /// Snapshot of the current edges.
    pub fn coords(&self) -> Vec<(ModuleId, ModuleId)> {
        self.edges.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ModuleId, ModuleId)> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ModuleId {
        ModuleId::new(s)
    }

    #[test]
    fn add_is_idempotent() {
        let mut t = RoutingTable::new();
        assert!(t.add(id("a"), id("b")).unwrap());
        assert!(!t.add(id("a"), id("b")).unwrap());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn self_edges_are_rejected() {
        let mut t = RoutingTable::new();
        assert!(matches!(
            t.add(id("a"), id("a")),
            Err(CoreError::InvalidShape(_))
        ));
    }

    #[test]
    fn edges_are_directed() {
        let mut t = RoutingTable::new();
        t.add(id("a"), id("b")).unwrap();
        assert!(t.contains(&id("a"), &id("b")));
        assert!(!t.contains(&id("b"), &id("a")));
    }

    #[test]
    fn remove_and_coords() {
        let mut t = RoutingTable::new();
        t.add(id("a"), id("b")).unwrap();
        t.add(id("b"), id("c")).unwrap();
        assert_eq!(t.coords().len(), 2);
        assert!(t.remove(&id("a"), &id("b")));
        assert!(!t.remove(&id("a"), &id("b")));
        assert_eq!(t.coords(), vec![(id("b"), id("c"))]);
    }

    #[test]
    fn iteration_order_is_stable() {
        let mut t = RoutingTable::new();
        t.add(id("c"), id("d")).unwrap();
        t.add(id("a"), id("b")).unwrap();
        let first = t.coords();
        let second = t.coords();
        assert_eq!(first, second);
        assert_eq!(first[0], (id("c"), id("d")));
    }
}
