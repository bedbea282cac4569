//! Forwarding tables for composite-node port rerouting.
//!
//! A composite node publishes one of its internal nodes' ports as if it
//! were its own. Connecting to the composite's port should behave exactly
//! as if the caller had connected directly to the forwarded port; this
//! table is consulted once per connect/disconnect/message call to resolve
//! the public port down to the internal one that actually carries data.

use ahash::AHashMap;

use kernelgraph_core::handle::NodeHandle;
use kernelgraph_core::node::ForwardingSink;
use kernelgraph_core::port::{InPortId, OutPortId};

const MAX_FORWARD_HOPS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InputKey(NodeHandle, InPortId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OutputKey(NodeHandle, OutPortId);

#[derive(Debug, Default)]
pub struct ForwardingTable {
    inputs: AHashMap<InputKey, (NodeHandle, InPortId)>,
    outputs: AHashMap<OutputKey, (NodeHandle, OutPortId)>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward_input(&mut self, from: (NodeHandle, InPortId), to: (NodeHandle, InPortId)) {
        self.inputs.insert(InputKey(from.0, from.1), to);
    }

    pub fn forward_output(&mut self, from: (NodeHandle, OutPortId), to: (NodeHandle, OutPortId)) {
        self.outputs.insert(OutputKey(from.0, from.1), to);
    }

    /// Follows an input's forwarding chain to the port that actually owns
    /// storage. A chain longer than [`MAX_FORWARD_HOPS`] can only be a
    /// builder bug (forwarding cycles are never constructed by well-behaved
    /// composite nodes); it is logged and truncated rather than looped
    /// forever.
    pub fn resolve_input(&self, node: NodeHandle, port: InPortId) -> (NodeHandle, InPortId) {
        let mut current = (node, port);
        for _ in 0..MAX_FORWARD_HOPS {
            match self.inputs.get(&InputKey(current.0, current.1)) {
                Some(&next) => current = next,
                None => return current,
            }
        }
        log::error!(
            "forwarding chain for input port {:?} on {:?} exceeded {} hops",
            port,
            node,
            MAX_FORWARD_HOPS
        );
        current
    }

    pub fn resolve_output(&self, node: NodeHandle, port: OutPortId) -> (NodeHandle, OutPortId) {
        let mut current = (node, port);
        for _ in 0..MAX_FORWARD_HOPS {
            match self.outputs.get(&OutputKey(current.0, current.1)) {
                Some(&next) => current = next,
                None => return current,
            }
        }
        log::error!(
            "forwarding chain for output port {:?} on {:?} exceeded {} hops",
            port,
            node,
            MAX_FORWARD_HOPS
        );
        current
    }

    pub fn is_forwarded_input(&self, node: NodeHandle, port: InPortId) -> bool {
        self.inputs.contains_key(&InputKey(node, port))
    }

    pub fn is_forwarded_output(&self, node: NodeHandle, port: OutPortId) -> bool {
        self.outputs.contains_key(&OutputKey(node, port))
    }

    /// Drops every forwarding entry that mentions `node`, on either side.
    /// Called when a composite node (or one of its internal nodes) is
    /// destroyed.
    pub fn remove_node(&mut self, node: NodeHandle) {
        self.inputs.retain(|k, v| k.0 != node && v.0 != node);
        self.outputs.retain(|k, v| k.0 != node && v.0 != node);
    }
}

impl ForwardingSink for ForwardingTable {
    fn forward_input(&mut self, from: (NodeHandle, InPortId), to: (NodeHandle, InPortId)) {
        ForwardingTable::forward_input(self, from, to);
    }

    fn forward_output(&mut self, from: (NodeHandle, OutPortId), to: (NodeHandle, OutPortId)) {
        ForwardingTable::forward_output(self, from, to);
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
    fn resolves_through_multiple_hops() {
        let mut arena = thunderdome::Arena::new();
        let (composite, inner_a, inner_b) = (node(&mut arena), node(&mut arena), node(&mut arena));

        let mut table = ForwardingTable::new();
        let public_port = InPortId::internal(0);
        let mid_port = InPortId::internal(1);
        let leaf_port = InPortId::internal(2);

        table.forward_input((composite, public_port), (inner_a, mid_port));
        table.forward_input((inner_a, mid_port), (inner_b, leaf_port));

        assert_eq!(
            table.resolve_input(composite, public_port),
            (inner_b, leaf_port)
        );
    }

    #[test]
    fn unforwarded_port_resolves_to_itself() {
        let mut arena = thunderdome::Arena::new();
        let n = node(&mut arena);
        let table = ForwardingTable::new();
        let port = OutPortId::internal(3);
        assert_eq!(table.resolve_output(n, port), (n, port));
    }

    #[test]
    fn remove_node_drops_both_directions() {
        let mut arena = thunderdome::Arena::new();
        let (composite, inner) = (node(&mut arena), node(&mut arena));
        let mut table = ForwardingTable::new();
        let port = InPortId::internal(0);
        table.forward_input((composite, port), (inner, port));
        table.remove_node(inner);
        assert!(!table.is_forwarded_input(composite, port));
    }
}
