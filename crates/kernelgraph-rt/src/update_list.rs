//! Per-frame "wants update" registration table.
//!
//! A free-list-backed registration table: a node that asks to be ticked
//! every frame keeps a stable slot until it unregisters or is destroyed,
//! rather than being re-derived from a flag scan every frame.

use ahash::AHashMap;

use kernelgraph_core::error::ShapeError;
use kernelgraph_core::handle::NodeHandle;

#[derive(Debug, Default)]
pub struct UpdateListManager {
    slots: Vec<Option<NodeHandle>>,
    free: Vec<usize>,
    index_of: AHashMap<NodeHandle, usize>,
}

impl UpdateListManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node: NodeHandle) -> Result<(), ShapeError> {
        if self.index_of.contains_key(&node) {
            return Err(ShapeError::AlreadyRegisteredForUpdate(node));
        }
        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        self.slots[slot] = Some(node);
        self.index_of.insert(node, slot);
        Ok(())
    }

    pub fn unregister(&mut self, node: NodeHandle) -> Result<(), ShapeError> {
        let slot = self
            .index_of
            .remove(&node)
            .ok_or(ShapeError::NotRegisteredForUpdate(node))?;
        self.slots[slot] = None;
        self.free.push(slot);
        Ok(())
    }

    pub fn is_registered(&self, node: NodeHandle) -> bool {
        self.index_of.contains_key(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.slots.iter().filter_map(|s| *s)
    }

    pub fn len(&self) -> usize {
        self.index_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_of.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelgraph_core::handle::SetId;

    fn node(arena: &mut thunderdome::Arena<()>) -> NodeHandle {
        NodeHandle {
            set: SetId(0),
            idx: arena.insert(()),
            debug_name: "test",
        }
    }

    #[test]
    fn register_then_unregister_reuses_the_slot() {
        let mut arena = thunderdome::Arena::new();
        let mut list = UpdateListManager::new();
        let a = node(&mut arena);
        let b = node(&mut arena);

        list.register(a).unwrap();
        assert!(list.is_registered(a));
        assert_eq!(list.len(), 1);

        list.unregister(a).unwrap();
        assert!(!list.is_registered(a));
        assert_eq!(list.len(), 0);

        list.register(b).unwrap();
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn double_register_is_an_error() {
        let mut arena = thunderdome::Arena::new();
        let mut list = UpdateListManager::new();
        let a = node(&mut arena);
        list.register(a).unwrap();
        assert!(matches!(
            list.register(a),
            Err(ShapeError::AlreadyRegisteredForUpdate(_))
        ));
    }

    #[test]
    fn unregister_unknown_node_is_an_error() {
        let mut arena = thunderdome::Arena::new();
        let mut list = UpdateListManager::new();
        let a = node(&mut arena);
        assert!(matches!(
            list.unregister(a),
            Err(ShapeError::NotRegisteredForUpdate(_))
        ));
    }
}
