use std::collections::HashSet;

use parking_lot::RwLock;

use crate::error::Result;

use super::TupleId;

/// Per-row deletion state.
pub trait VisibilityMap: Send + Sync {
    fn is_visible(&self, tid: TupleId) -> bool;

    /// Mark `tid` deleted. Returns `false` if it already was.
    fn hide(&self, tid: TupleId) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryVisibilityMap {
    hidden: RwLock<HashSet<u64>>,
}

impl InMemoryVisibilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.read().len()
    }
}

impl VisibilityMap for InMemoryVisibilityMap {
    fn is_visible(&self, tid: TupleId) -> bool {
        !self.hidden.read().contains(&tid.to_u64())
    }

    fn hide(&self, tid: TupleId) -> Result<bool> {
        Ok(self.hidden.write().insert(tid.to_u64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hide_once() {
        let map = InMemoryVisibilityMap::new();
        let tid = TupleId::new(0, 7).unwrap();
        assert!(map.is_visible(tid));
        assert!(map.hide(tid).unwrap());
        assert!(!map.hide(tid).unwrap());
        assert!(!map.is_visible(tid));
        assert!(map.is_visible(TupleId::new(1, 7).unwrap()));
        assert_eq!(map.hidden_count(), 1);
    }
}
