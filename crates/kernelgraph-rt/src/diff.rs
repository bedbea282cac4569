//! The ordered, insertion-order-preserving mutation log produced by one
//! frame's worth of graph edits.
//!
//! Applying a [`GraphDiff`] downstream (the render graph) walks the
//! records in the order they were pushed; nothing here reorders or
//! deduplicates. A node's `NodeCreated` record is always pushed before any
//! `ConnectionCreated` record naming it, because the node set pushes them
//! in that order at the call site — this type just preserves whatever
//! order it's handed.

use kernelgraph_core::buffer::{BufferTarget, SizeRequest};
use kernelgraph_core::handle::{ConnectionHandle, NodeHandle};
use kernelgraph_core::port::{InputPortArrayID, OutputPortArrayID};

#[derive(Debug, Clone)]
pub enum DiffRecord {
    NodeCreated(NodeHandle),
    NodeDeleted(NodeHandle),
    ConnectionCreated {
        handle: ConnectionHandle,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
    },
    ConnectionDeleted {
        handle: ConnectionHandle,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
    },
    PortArrayResized {
        node: NodeHandle,
        port: u16,
        new_size: u32,
    },
    BufferResized {
        node: NodeHandle,
        target: BufferTarget,
        request: SizeRequest,
    },
    /// A message delivered to a data input, carried as raw bytes the
    /// render graph patches in verbatim.
    MessageToData {
        node: NodeHandle,
        port: u16,
        value: Box<[u8]>,
    },
    GraphValueCreated {
        node: NodeHandle,
        port: OutputPortArrayID,
    },
}

/// An ordered batch of [`DiffRecord`]s, built once per frame by the node
/// set and drained once by the render graph.
#[derive(Debug, Default)]
pub struct GraphDiff {
    records: Vec<DiffRecord>,
}

impl GraphDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: DiffRecord) {
        self.records.push(record);
    }

    pub fn node_created(&mut self, node: NodeHandle) {
        self.push(DiffRecord::NodeCreated(node));
    }

    pub fn node_deleted(&mut self, node: NodeHandle) {
        self.push(DiffRecord::NodeDeleted(node));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connection_created(
        &mut self,
        handle: ConnectionHandle,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
    ) {
        self.push(DiffRecord::ConnectionCreated {
            handle,
            source,
            source_port,
            dest,
            dest_port,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connection_deleted(
        &mut self,
        handle: ConnectionHandle,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
    ) {
        self.push(DiffRecord::ConnectionDeleted {
            handle,
            source,
            source_port,
            dest,
            dest_port,
        });
    }

    pub fn port_array_resized(&mut self, node: NodeHandle, port: u16, new_size: u32) {
        self.push(DiffRecord::PortArrayResized {
            node,
            port,
            new_size,
        });
    }

    pub fn buffer_resized(&mut self, node: NodeHandle, target: BufferTarget, request: SizeRequest) {
        self.push(DiffRecord::BufferResized {
            node,
            target,
            request,
        });
    }

    pub fn message_to_data(&mut self, node: NodeHandle, port: u16, value: Box<[u8]>) {
        self.push(DiffRecord::MessageToData { node, port, value });
    }

    pub fn graph_value_created(&mut self, node: NodeHandle, port: OutputPortArrayID) {
        self.push(DiffRecord::GraphValueCreated { node, port });
    }

    pub fn records(&self) -> &[DiffRecord] {
        &self.records
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, DiffRecord> {
        self.records.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
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
    fn preserves_insertion_order() {
        let mut arena = thunderdome::Arena::new();
        let (a, b) = (node(&mut arena), node(&mut arena));
        let mut diff = GraphDiff::new();
        diff.node_created(a);
        diff.node_created(b);
        diff.node_deleted(a);

        let records = diff.records();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], DiffRecord::NodeCreated(n) if n == a));
        assert!(matches!(records[1], DiffRecord::NodeCreated(n) if n == b));
        assert!(matches!(records[2], DiffRecord::NodeDeleted(n) if n == a));
    }

    #[test]
    fn drain_empties_the_log() {
        let mut arena = thunderdome::Arena::new();
        let a = node(&mut arena);
        let mut diff = GraphDiff::new();
        diff.node_created(a);
        assert_eq!(diff.drain().count(), 1);
        assert!(diff.is_empty());
    }
}
