//! Port patching: deciding each data-input port's current [`PortStorage`]
//! from the topology database and from owned buffers.
//!
//! A data-input port's storage is either the blank page (unconnected), an
//! owned allocation (the target of `set_data`, or a value retained across
//! a disconnect), or patched from the connected output's storage. This is
//! a runtime, per-frame patch step rather than a one-time compile-time
//! assignment.

use kernelgraph_core::buffer::BlankPage;
use kernelgraph_core::handle::NodeHandle;
use kernelgraph_core::port::{InputPortArrayID, OutputPortArrayID, PortOwnership, PortStorage};

use crate::topology::TopologyDatabase;

/// The decision for how to patch a single data-input port this frame.
#[derive(Debug, Clone, Copy)]
pub enum PatchTarget {
    /// The port is unconnected and owns nothing: patch to the blank page.
    BlankPage,
    /// Keep whatever storage the port currently owns.
    Owned,
    /// Patch to the given output's current storage.
    FromOutput {
        source: NodeHandle,
        source_port: OutputPortArrayID,
    },
}

/// Decides the patch target for one data-input port. `currently_owned`
/// reflects the port's [`PortOwnership`] bit as tracked by the node set.
pub fn resolve_input_patch(
    topo: &TopologyDatabase,
    dest: NodeHandle,
    dest_port: InputPortArrayID,
    currently_owned: bool,
) -> PatchTarget {
    for &handle in topo.connections_to(dest) {
        let Some(conn) = topo.connection(handle) else {
            continue;
        };
        if conn.dest_port == dest_port {
            return PatchTarget::FromOutput {
                source: conn.source,
                source_port: conn.source_port,
            };
        }
    }

    if currently_owned {
        PatchTarget::Owned
    } else {
        PatchTarget::BlankPage
    }
}

/// Builds the [`PortStorage`] for an unconnected, unowned data input: a
/// read-only view of the shared blank page, grown first if this port's
/// element size exceeds the page's current capacity.
pub fn blank_page_storage(blank_page: &mut BlankPage, len: usize) -> PortStorage {
    blank_page.ensure_capacity(len);
    PortStorage {
        ptr: blank_page.ptr(),
        len,
        ownership: PortOwnership::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelgraph_core::handle::SetId;
    use kernelgraph_core::port::{InPortId, OutPortId};

    fn node(arena: &mut thunderdome::Arena<()>) -> NodeHandle {
        NodeHandle {
            set: SetId(0),
            idx: arena.insert(()),
            debug_name: "test",
        }
    }

    #[test]
    fn unconnected_input_patches_to_blank_page() {
        let topo = TopologyDatabase::new();
        let mut arena = thunderdome::Arena::new();
        let n = node(&mut arena);
        let port = InputPortArrayID::scalar(InPortId::internal(0));
        assert!(matches!(
            resolve_input_patch(&topo, n, port, false),
            PatchTarget::BlankPage
        ));
    }

    #[test]
    fn owned_input_keeps_its_storage_when_unconnected() {
        let topo = TopologyDatabase::new();
        let mut arena = thunderdome::Arena::new();
        let n = node(&mut arena);
        let port = InputPortArrayID::scalar(InPortId::internal(0));
        assert!(matches!(
            resolve_input_patch(&topo, n, port, true),
            PatchTarget::Owned
        ));
    }

    #[test]
    fn connected_input_patches_from_its_source() {
        let mut topo = TopologyDatabase::new();
        let mut arena = thunderdome::Arena::new();
        let (src, dst) = (node(&mut arena), node(&mut arena));
        topo.vertex_created(src);
        topo.vertex_created(dst);
        let out = OutputPortArrayID::scalar(OutPortId::internal(2));
        let inp = InputPortArrayID::scalar(InPortId::internal(0));
        topo.connect(src, out, dst, inp, false).unwrap();

        match resolve_input_patch(&topo, dst, inp, false) {
            PatchTarget::FromOutput {
                source,
                source_port,
            } => {
                assert_eq!(source, src);
                assert_eq!(source_port, out);
            }
            other => panic!("expected FromOutput, got {:?}", other),
        }
    }

    #[test]
    fn blank_page_storage_grows_to_fit() {
        let mut page = BlankPage::new(4);
        let storage = blank_page_storage(&mut page, 32);
        assert_eq!(storage.len, 32);
        assert_eq!(page.len(), 32);
    }
}
