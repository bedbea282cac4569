//! The node-set facade: owns one simulation-side graph, its topology,
//! traversal cache, render graph, and the frame driver that keeps them in
//! sync.
//!
//! A generic-over-context top-level type that owns an arena of boxed node
//! definitions plus the bookkeeping tables, built once from a `Config` and
//! torn down by `Drop`.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU32, Ordering};

use ahash::{AHashMap, AHashSet};
use thunderdome::Arena;

pub use kernelgraph_core::error::{GraphError, KernelGraphError, LogicError, ResourceError, ShapeError};
pub use kernelgraph_core::handle::{ConnectionHandle, NodeHandle, SetId};
pub use kernelgraph_core::node::{
    ForwardingSink, InitContext, KernelPorts, MessageContext, NodeDefinition, NodeKernel, PortView,
    PortViewMut, RenderContext, UpdateContext,
};
pub use kernelgraph_core::port::{
    InPortId, InputPortArrayID, OutPortId, OutputPortArrayID, PortCategory, PortDescriptor,
    PortDirection,
};
pub use kernelgraph_core::buffer::{BufferTarget, SizeRequest};
pub use kernelgraph_core::MAX_PORT_ARRAY_SIZE;

pub use kernelgraph_rt::{GroupId, RenderExecutionModel};

use kernelgraph_core::buffer::BlankPage;
use kernelgraph_core::node::PendingEmit;
use kernelgraph_core::port::{PortOwnership, PortStorage};
use kernelgraph_rt::{resolve_input_patch, ForwardingTable, GraphDiff, PatchTarget, RenderGraph, TopologyDatabase, TraversalCache};

/// Whether a connection participates in the graph's normal acyclic flow or
/// deliberately carries a value from a later frame back into an earlier
/// part of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Normal,
    Feedback,
}

/// Construction-time configuration for a [`NodeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub execution_model: RenderExecutionModel,
    pub initial_node_capacity: usize,
    pub initial_edge_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution_model: RenderExecutionModel::default(),
            initial_node_capacity: 64,
            initial_edge_capacity: 256,
        }
    }
}

/// One node's simulation-side bookkeeping: its boxed definition, its port
/// list (so the facade can resolve port indices without re-querying the
/// definition every call), and the owned storage for any scalar data input
/// this node currently holds a value for.
struct NodeEntry {
    definition: Box<dyn NodeDefinition>,
    ports: &'static [PortDescriptor],
    debug_name: &'static str,
    input_array_len: AHashMap<u16, u32>,
    /// Scalar data-input ports only: port-array elements are always
    /// patched from their connected source and never individually retained.
    input_owned: AHashMap<u16, Box<[u8]>>,
}

fn input_descriptor(ports: &'static [PortDescriptor], port: InPortId) -> Option<&'static PortDescriptor> {
    ports.iter().filter(|p| p.is_input()).nth(port.index() as usize)
}

fn output_descriptor(ports: &'static [PortDescriptor], port: OutPortId) -> Option<&'static PortDescriptor> {
    ports.iter().filter(|p| p.is_output()).nth(port.index() as usize)
}

fn num_inputs(ports: &'static [PortDescriptor]) -> usize {
    ports.iter().filter(|p| p.is_input()).count()
}

fn num_outputs(ports: &'static [PortDescriptor]) -> usize {
    ports.iter().filter(|p| p.is_output()).count()
}

static NEXT_SET_ID: AtomicU32 = AtomicU32::new(0);

/// Depth limit on recursive message delivery (a handler emitting from
/// inside a handler it was itself invoked from). Guards against a
/// forwarding or handler cycle spinning forever; a well-behaved graph never
/// comes close to it.
const MAX_MESSAGE_DEPTH: u32 = 256;

/// How a scalar data input should be patched this frame, resolved once per
/// node per frame before kernel dispatch.
enum PatchPlan {
    Blank,
    Owned,
    FromOutput { source: NodeHandle, source_port: u16 },
}

/// The top-level owner of one simulation-side dataflow graph: its nodes,
/// its topology database, its traversal cache, its render-side world, and
/// the user's kernel context `C`.
pub struct NodeSet<C: 'static + Send> {
    set_id: SetId,
    config: Config,
    nodes: Arena<NodeEntry>,
    topology: TopologyDatabase,
    traversal: TraversalCache,
    diff: GraphDiff,
    forwarding: ForwardingTable,
    update_list: kernelgraph_rt::UpdateListManager,
    render_graph: RenderGraph,
    blank_page: BlankPage,
    dirty_groups: AHashSet<GroupId>,
    context: C,
}

impl<C: 'static + Send> NodeSet<C> {
    pub fn new(config: Config, context: C) -> Self {
        Self {
            set_id: SetId(NEXT_SET_ID.fetch_add(1, Ordering::Relaxed)),
            nodes: Arena::with_capacity(config.initial_node_capacity),
            topology: TopologyDatabase::new(),
            traversal: TraversalCache::new(),
            diff: GraphDiff::new(),
            forwarding: ForwardingTable::new(),
            update_list: kernelgraph_rt::UpdateListManager::new(),
            render_graph: RenderGraph::new(),
            blank_page: BlankPage::new(64),
            dirty_groups: AHashSet::default(),
            config,
            context,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn set_id(&self) -> SetId {
        self.set_id
    }

    fn validate(&self, handle: NodeHandle) -> Result<(), ShapeError> {
        if handle.set != self.set_id || !self.nodes.contains(handle.idx) {
            return Err(ShapeError::InvalidHandle(handle));
        }
        Ok(())
    }

    pub fn exists(&self, handle: NodeHandle) -> bool {
        handle.set == self.set_id && self.nodes.contains(handle.idx)
    }

    fn live_handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        let set_id = self.set_id;
        self.nodes
            .iter()
            .map(move |(idx, entry)| NodeHandle {
                set: set_id,
                idx,
                debug_name: entry.debug_name,
            })
    }

    /// Every member of `node`'s group, read before a mutation that might
    /// split or merge it.
    fn group_members(&self, node: NodeHandle) -> Vec<NodeHandle> {
        match self.topology.group_of(node) {
            Some(g) => self.live_handles().filter(|&n| self.topology.group_of(n) == Some(g)).collect(),
            None => Vec::new(),
        }
    }

    fn mark_dirty(&mut self, members: impl IntoIterator<Item = NodeHandle>) {
        for n in members {
            if let Some(g) = self.topology.group_of(n) {
                self.dirty_groups.insert(g);
            }
        }
    }

    // ---- Node creation / destruction ---------------------------------

    pub fn create<T: NodeDefinition + Default>(&mut self) -> Result<NodeHandle, KernelGraphError> {
        self.create_with(T::default())
    }

    /// Creates a node and runs its `init` hook. The node is inserted into
    /// the arena (so it has a real handle to hand `init` through
    /// [`InitContext`], letting it publish forwarded ports against its own
    /// identity) before `init` runs; a failing `init` rolls the insertion
    /// back and runs `destroy` without the user hook having ever seen a
    /// handle for the node.
    pub fn create_with<T: NodeDefinition>(&mut self, def: T) -> Result<NodeHandle, KernelGraphError> {
        let ports = def.ports();
        let debug_name = def.debug_name();
        let num_in = num_inputs(ports);
        let num_out = num_outputs(ports);

        let boxed: Box<dyn NodeDefinition> = Box::new(def);
        let idx = self.nodes.insert(NodeEntry {
            definition: boxed,
            ports,
            debug_name,
            input_array_len: AHashMap::default(),
            input_owned: AHashMap::default(),
        });
        let handle = NodeHandle {
            set: self.set_id,
            idx,
            debug_name,
        };

        let mut cx = kernelgraph_core::node::InitContext::new(handle, &mut self.forwarding);
        let init_result = self.nodes.get_mut(idx).unwrap().definition.init(&mut cx);
        if let Err(e) = init_result {
            let mut entry = self.nodes.remove(idx).unwrap();
            entry.definition.destroy();
            self.forwarding.remove_node(handle);
            return Err(ShapeError::InitFailed(debug_name, e.to_string()).into());
        }

        let kernel = self.nodes.get_mut(idx).unwrap().definition.build_kernel();

        self.topology.vertex_created(handle);
        self.diff.node_created(handle);
        self.mark_dirty([handle]);

        if let Some(kernel) = kernel {
            self.render_graph.install_kernel(handle, kernel, num_in, num_out);
        }

        Ok(handle)
    }

    pub fn destroy(&mut self, handle: NodeHandle) -> Result<(), KernelGraphError> {
        self.validate(handle)?;
        let affected = self.group_members(handle);

        for (h, conn) in self.topology.disconnect_all(handle) {
            self.diff
                .connection_deleted(h, conn.source, conn.source_port, conn.dest, conn.dest_port);
        }

        self.topology.vertex_deleted(handle);
        self.forwarding.remove_node(handle);
        let _ = self.update_list.unregister(handle);

        if let Some(mut entry) = self.nodes.remove(handle.idx) {
            entry.definition.destroy();
        }
        self.diff.node_deleted(handle);

        self.mark_dirty(affected.into_iter().filter(|&n| n != handle));
        Ok(())
    }

    // ---- Definition lookup -------------------------------------------

    pub fn get_definition(&self, handle: NodeHandle) -> Result<&dyn NodeDefinition, ShapeError> {
        self.validate(handle)?;
        Ok(self.nodes.get(handle.idx).unwrap().definition.as_ref())
    }

    pub fn is<T: NodeDefinition>(&self, handle: NodeHandle) -> Result<bool, ShapeError> {
        Ok(self.get_definition(handle)?.is::<T>())
    }

    pub fn cast<T: NodeDefinition>(&self, handle: NodeHandle) -> Result<&T, ShapeError> {
        self.get_definition(handle)?
            .downcast_ref::<T>()
            .ok_or(ShapeError::TypeMismatch(0, handle))
    }

    pub fn cast_mut<T: NodeDefinition>(&mut self, handle: NodeHandle) -> Result<&mut T, ShapeError> {
        self.validate(handle)?;
        self.nodes
            .get_mut(handle.idx)
            .unwrap()
            .definition
            .downcast_mut::<T>()
            .ok_or(ShapeError::TypeMismatch(0, handle))
    }

    // ---- Connection --------------------------------------------------

    pub fn connect(
        &mut self,
        source: NodeHandle,
        source_port: impl Into<OutputPortArrayID>,
        dest: NodeHandle,
        dest_port: impl Into<InputPortArrayID>,
        kind: ConnectionKind,
    ) -> Result<ConnectionHandle, KernelGraphError> {
        self.validate(source)?;
        self.validate(dest)?;
        let source_port = source_port.into();
        let dest_port = dest_port.into();
        let is_feedback = kind == ConnectionKind::Feedback;

        let src_entry = self.nodes.get(source.idx).unwrap();
        let src_desc = output_descriptor(src_entry.ports, source_port.port)
            .ok_or(ShapeError::InvalidPort(source_port.port.index(), source))?;
        let dst_entry = self.nodes.get(dest.idx).unwrap();
        let dst_desc = input_descriptor(dst_entry.ports, dest_port.port)
            .ok_or(ShapeError::InvalidPort(dest_port.port.index(), dest))?;

        // A source's message output may target a data input: delivery
        // routes it through a `MessageToData` diff record instead of the
        // handler call an ordinary message edge gets. Every other pairing
        // must match exactly.
        let categories_compatible = src_desc.category == dst_desc.category
            || (src_desc.category == PortCategory::Message && dst_desc.category == PortCategory::Data);
        if !categories_compatible {
            return Err(ShapeError::CategoryMismatch(dest_port.port.index(), dest).into());
        }
        if src_desc.element_type != dst_desc.element_type {
            return Err(ShapeError::TypeMismatch(dest_port.port.index(), dest).into());
        }
        if is_feedback && src_desc.category != PortCategory::Data {
            return Err(ShapeError::FeedbackOnNonData.into());
        }

        check_array_shape(src_desc, source_port.is_array_element(), source_port.port.index(), source)?;
        check_array_shape(dst_desc, dest_port.is_array_element(), dest_port.port.index(), dest)?;

        if let Some(index) = dest_port.array_index() {
            let declared = self
                .nodes
                .get(dest.idx)
                .unwrap()
                .input_array_len
                .get(&dest_port.port.index())
                .copied()
                .unwrap_or(0);
            if index >= declared {
                return Err(ShapeError::IndexOutOfRange { index, size: declared }.into());
            }
        }

        if dst_desc.category == PortCategory::Data && self.topology.is_input_connected(dest, dest_port) {
            return Err(ShapeError::MultipleDataInputs(dest, dest_port.port).into());
        }

        let handle = self.topology.connect(source, source_port, dest, dest_port, is_feedback)?;
        if !dest_port.is_array_element() {
            self.clear_owned(dest, dest_port.port.index());
        }
        self.diff
            .connection_created(handle, source, source_port, dest, dest_port);
        self.mark_dirty([source, dest]);
        Ok(handle)
    }

    pub fn disconnect(
        &mut self,
        source: NodeHandle,
        source_port: impl Into<OutputPortArrayID>,
        dest: NodeHandle,
        dest_port: impl Into<InputPortArrayID>,
    ) -> Result<(), KernelGraphError> {
        let source_port = source_port.into();
        let dest_port = dest_port.into();

        let handle = self
            .topology
            .find_connection(source, source_port, dest, dest_port)
            .ok_or(ShapeError::ConnectionMissing(source, source_port.port, dest, dest_port.port))?;

        let affected = self.group_members(source);
        let conn = self.topology.disconnect(handle).expect("handle just looked up");
        self.diff
            .connection_deleted(handle, conn.source, conn.source_port, conn.dest, conn.dest_port);
        self.mark_dirty(affected);
        Ok(())
    }

    /// Disconnects a data connection while freezing the destination's last
    /// patched value as an owned buffer.
    pub fn disconnect_and_retain_value(
        &mut self,
        source: NodeHandle,
        source_port: impl Into<OutputPortArrayID>,
        dest: NodeHandle,
        dest_port: InPortId,
    ) -> Result<(), KernelGraphError> {
        let source_port = source_port.into();
        let dest_arr = InputPortArrayID::scalar(dest_port);

        let handle = self
            .topology
            .find_connection(source, source_port, dest, dest_arr)
            .ok_or(ShapeError::ConnectionMissing(source, source_port.port, dest, dest_port))?;

        let snapshot = self.render_graph.snapshot_input(dest, dest_port.index() as usize);
        let affected = self.group_members(source);

        let conn = self.topology.disconnect(handle).expect("handle just looked up");
        self.diff
            .connection_deleted(handle, conn.source, conn.source_port, conn.dest, conn.dest_port);

        self.nodes
            .get_mut(dest.idx)
            .unwrap()
            .input_owned
            .insert(dest_port.index(), snapshot.clone());
        self.diff.message_to_data(dest, dest_port.index(), snapshot);

        self.mark_dirty(affected);
        Ok(())
    }

    fn clear_owned(&mut self, node: NodeHandle, port: u16) {
        if let Some(entry) = self.nodes.get_mut(node.idx) {
            entry.input_owned.remove(&port);
        }
    }

    // ---- Port-array sizing ----------------

    pub fn set_port_array_size(&mut self, node: NodeHandle, port: InPortId, size: u32) -> Result<(), KernelGraphError> {
        self.validate(node)?;
        if size > MAX_PORT_ARRAY_SIZE {
            return Err(ShapeError::IndexOutOfRange { index: size, size: MAX_PORT_ARRAY_SIZE }.into());
        }

        let entry = self.nodes.get(node.idx).unwrap();
        let desc = input_descriptor(entry.ports, port).ok_or(ShapeError::InvalidPort(port.index(), node))?;
        if !desc.is_port_array {
            return Err(ShapeError::NotAPortArray(port.index(), node).into());
        }

        let max_connected = self
            .topology
            .connections_to(node)
            .iter()
            .filter_map(|&h| self.topology.connection(h))
            .filter(|c| c.dest_port.port == port)
            .filter_map(|c| c.dest_port.array_index())
            .max();
        if let Some(max_index) = max_connected {
            if size <= max_index {
                return Err(ShapeError::IndexOutOfRange { index: max_index, size }.into());
            }
        }

        self.nodes.get_mut(node.idx).unwrap().input_array_len.insert(port.index(), size);
        self.diff.port_array_resized(node, port.index(), size);
        Ok(())
    }

    // ---- Messaging ---------------------------------------------------

    /// Delivers `value` directly to `dest`'s message port, resolving any
    /// forwarding chain first. This is the host's own entry point into
    /// messaging; a node re-emitting from inside its own `message`/`update`
    /// hook goes through the [`MessageContext`]/[`UpdateContext`] handed to
    /// that hook instead, never through this method.
    pub fn send_message<T: 'static>(&mut self, dest: NodeHandle, dest_port: InPortId, value: T) -> Result<(), KernelGraphError> {
        self.validate(dest)?;
        let entry = self.nodes.get(dest.idx).unwrap();
        let desc = input_descriptor(entry.ports, dest_port).ok_or(ShapeError::InvalidPort(dest_port.index(), dest))?;
        if desc.category != PortCategory::Message {
            return Err(ShapeError::CategoryMismatch(dest_port.index(), dest).into());
        }
        if desc.element_type != TypeId::of::<T>() {
            return Err(ShapeError::TypeMismatch(dest_port.index(), dest).into());
        }

        let (dest, dest_port) = self.forwarding.resolve_input(dest, dest_port);
        self.deliver_message(dest, dest_port, &value, 0);
        Ok(())
    }

    /// Fans a value out to every destination connected to `source`'s output
    /// port. A `Message`-category edge invokes the destination's handler
    /// synchronously through a [`MessageContext`]; a `Message`-to-`Data`
    /// edge instead patches `bytes` in as the destination's owned input,
    /// the same way `set_data` does, and records a `MessageToData` diff
    /// entry. Recurses depth-first into whatever each handler itself emits
    /// before moving on to the next sibling destination, capped at
    /// [`MAX_MESSAGE_DEPTH`] to guard against a forwarding or handler cycle.
    fn emit_from(&mut self, source: NodeHandle, source_port: OutPortId, value: &dyn Any, bytes: &[u8], depth: u32) {
        if depth >= MAX_MESSAGE_DEPTH {
            log::error!(
                "message delivery from {:?}:{:?} exceeded {} levels of recursion",
                source,
                source_port,
                MAX_MESSAGE_DEPTH
            );
            return;
        }
        if self.forwarding.is_forwarded_output(source, source_port) {
            log::error!("emit through forwarded output port {:?} on {:?}", source_port, source);
            return;
        }

        let array_port = OutputPortArrayID::scalar(source_port);
        let targets: Vec<(NodeHandle, InPortId, PortCategory)> = self
            .topology
            .connections_from(source)
            .iter()
            .filter_map(|&h| self.topology.connection(h))
            .filter(|c| c.source_port == array_port)
            .filter_map(|c| {
                let (dest, dest_port) = self.forwarding.resolve_input(c.dest, c.dest_port.port);
                let entry = self.nodes.get(dest.idx)?;
                let category = input_descriptor(entry.ports, dest_port)?.category;
                Some((dest, dest_port, category))
            })
            .collect();

        for (dest, dest_port, category) in targets {
            if category == PortCategory::Data {
                if let Some(entry) = self.nodes.get_mut(dest.idx) {
                    entry.input_owned.insert(dest_port.index(), bytes.to_vec().into_boxed_slice());
                }
                self.diff.message_to_data(dest, dest_port.index(), bytes.to_vec().into_boxed_slice());
            } else {
                self.deliver_message(dest, dest_port, value, depth);
            }
        }
    }

    /// Invokes `dest`'s message handler, draining whatever it emits through
    /// its [`MessageContext`] once the handler call's borrow of the node
    /// arena has ended.
    fn deliver_message(&mut self, dest: NodeHandle, dest_port: InPortId, value: &dyn Any, depth: u32) {
        let mut pending: Vec<PendingEmit> = Vec::new();
        if let Some(entry) = self.nodes.get_mut(dest.idx) {
            let mut cx = kernelgraph_core::node::MessageContext::new(dest, &mut pending);
            entry.definition.message(dest_port, value, &mut cx);
        }
        for emitted in pending {
            self.emit_from(emitted.source, emitted.port, emitted.value.as_ref(), &emitted.bytes, depth + 1);
        }
    }

    // ---- Data input value --------------------------------------------

    /// Sets a scalar data input's value directly, bypassing any connection.
    /// Bounded to `Copy` types: data ports carry blittable buffer payloads,
    /// and an owned copy here is freed as raw bytes, never through `T`'s
    /// own `Drop`.
    pub fn set_data<T: 'static + Copy>(&mut self, node: NodeHandle, port: InPortId, value: T) -> Result<(), KernelGraphError> {
        self.validate(node)?;
        let entry = self.nodes.get(node.idx).unwrap();
        let desc = input_descriptor(entry.ports, port).ok_or(ShapeError::InvalidPort(port.index(), node))?;
        if desc.category != PortCategory::Data {
            return Err(ShapeError::NotADataPort(node, port.index()).into());
        }
        if desc.element_type != TypeId::of::<T>() {
            return Err(ShapeError::TypeMismatch(port.index(), node).into());
        }
        if desc.is_port_array {
            return Err(ShapeError::PortArrayIndexNotAllowed(port.index(), node).into());
        }
        let dest_arr = InputPortArrayID::scalar(port);
        if self.topology.is_input_connected(node, dest_arr) {
            return Err(ShapeError::MultipleDataInputs(node, port).into());
        }

        // SAFETY: `T: Copy`, so reading its bytes never observes a value
        // mid-move and never needs a destructor run on the copy.
        let bytes: Box<[u8]> = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        }
        .to_vec()
        .into_boxed_slice();

        self.nodes.get_mut(node.idx).unwrap().input_owned.insert(port.index(), bytes.clone());
        self.diff.message_to_data(node, port.index(), bytes);
        Ok(())
    }

    // ---- Buffer sizing -----------------------------------------------

    pub fn set_buffer_size(&mut self, node: NodeHandle, out_port: OutPortId, request: SizeRequest) -> Result<(), KernelGraphError> {
        self.validate(node)?;
        let entry = self.nodes.get(node.idx).unwrap();
        let desc = output_descriptor(entry.ports, out_port).ok_or(ShapeError::InvalidPort(out_port.index(), node))?;
        if desc.category != PortCategory::Data {
            return Err(ShapeError::NotADataPort(node, out_port.index()).into());
        }
        let target = BufferTarget::OutputPort {
            port_index: out_port.index(),
            offset_index: 0,
        };
        self.diff.buffer_resized(node, target, request);
        Ok(())
    }

    // ---- Update list -------------------------------------------------

    pub fn register_for_update(&mut self, node: NodeHandle) -> Result<(), KernelGraphError> {
        self.validate(node)?;
        self.update_list.register(node)?;
        Ok(())
    }

    pub fn remove_from_update(&mut self, node: NodeHandle) -> Result<(), KernelGraphError> {
        self.validate(node)?;
        self.update_list.unregister(node)?;
        Ok(())
    }

    // ---- Per-frame data-port patching ---------------------

    /// Resolves every scalar data input's patch target for this frame,
    /// without yet touching the render graph (kept side-effect free so it
    /// can be built while `self.nodes`/`self.topology` are only borrowed
    /// immutably).
    ///
    /// Port-array elements are left to their last patch: per-element
    /// patching would need one storage slot per array element tracked
    /// independently, which this runtime's flat `input_storage` vector
    /// does not yet support.
    fn build_patch_plan(&self) -> Vec<(NodeHandle, u16, PatchPlan)> {
        let mut plan = Vec::new();
        for (idx, entry) in self.nodes.iter() {
            let node = NodeHandle {
                set: self.set_id,
                idx,
                debug_name: entry.debug_name,
            };
            for (in_idx, desc) in entry.ports.iter().filter(|p| p.is_input()).enumerate() {
                if desc.category != PortCategory::Data || desc.is_port_array {
                    continue;
                }
                let in_idx = in_idx as u16;
                let port_id = InPortId::internal(in_idx);
                let dest_arr = InputPortArrayID::scalar(port_id);
                let owned = entry.input_owned.contains_key(&in_idx);

                let target = match resolve_input_patch(&self.topology, node, dest_arr, owned) {
                    PatchTarget::BlankPage => PatchPlan::Blank,
                    PatchTarget::Owned => PatchPlan::Owned,
                    PatchTarget::FromOutput { source, source_port } => PatchPlan::FromOutput {
                        source,
                        source_port: source_port.port.index(),
                    },
                };
                plan.push((node, in_idx, target));
            }
        }
        plan
    }

    fn sync_data_ports(&mut self) {
        let plan = self.build_patch_plan();
        for (node, in_idx, target) in plan {
            match target {
                PatchPlan::Blank => {
                    let storage = PortStorage::disconnected(self.blank_page.ptr(), 0);
                    self.render_graph.patch_input(node, in_idx as usize, storage);
                }
                PatchPlan::Owned => {
                    let Some(entry) = self.nodes.get(node.idx) else {
                        continue;
                    };
                    let Some(bytes) = entry.input_owned.get(&in_idx) else {
                        continue;
                    };
                    let storage = PortStorage {
                        ptr: bytes.as_ptr(),
                        len: bytes.len(),
                        ownership: PortOwnership::OwnedByPort,
                    };
                    self.render_graph.patch_input(node, in_idx as usize, storage);
                }
                PatchPlan::FromOutput { source, source_port } => {
                    if let Some(storage) = self.render_graph.output_storage(source, source_port as usize) {
                        self.render_graph.patch_input(node, in_idx as usize, storage);
                    }
                }
            }
        }
    }

    // ---- Frame driver ------------------------------------------------

    /// Runs one frame: re-sorts any group touched since the last call,
    /// repatches every scalar data input against its current source, syncs
    /// the render world against the accumulated diff and dispatches its
    /// kernels, then ticks every node registered for update.
    pub fn update(&mut self) -> Result<(), KernelGraphError> {
        if !self.dirty_groups.is_empty() {
            let dirty: Vec<GroupId> = self.dirty_groups.drain().collect();
            let handles: Vec<NodeHandle> = self.live_handles().collect();
            let topo = &self.topology;
            self.traversal.resort_groups(topo, dirty, |gid| {
                handles.iter().copied().filter(|&n| topo.group_of(n) == Some(gid)).collect()
            });
        }

        self.sync_data_ports();

        self.render_graph.copy_worlds(
            &mut self.diff,
            &self.traversal,
            self.config.execution_model,
            &mut self.context as &mut (dyn Any + Send),
        )?;

        let registered: Vec<NodeHandle> = self.update_list.iter().collect();
        for node in registered {
            let mut pending: Vec<PendingEmit> = Vec::new();
            if let Some(entry) = self.nodes.get_mut(node.idx) {
                if entry.definition.wants_update() {
                    let mut cx = kernelgraph_core::node::UpdateContext::new(node, &mut pending);
                    entry.definition.update(&mut cx);
                }
            }
            for emitted in pending {
                self.emit_from(emitted.source, emitted.port, emitted.value.as_ref(), &emitted.bytes, 0);
            }
        }

        Ok(())
    }

    /// Deferred [`GraphError`]s raised by the last group resort.
    pub fn traversal_errors(&self) -> &[(GroupId, GraphError)] {
        self.traversal.errors()
    }
}

impl<C: 'static + Send> Drop for NodeSet<C> {
    fn drop(&mut self) {
        let leaked_nodes = self.nodes.len();
        if leaked_nodes > 0 {
            log::warn!("{} leaked node(s) and 0 leaked graph value(s)", leaked_nodes);
        }
    }
}

fn check_array_shape(
    desc: &PortDescriptor,
    targets_array_element: bool,
    port_index: u16,
    node: NodeHandle,
) -> Result<(), ShapeError> {
    if desc.is_port_array && !targets_array_element {
        return Err(ShapeError::PortArrayIndexRequired(port_index, node));
    }
    if !desc.is_port_array && targets_array_element {
        return Err(ShapeError::PortArrayIndexNotAllowed(port_index, node));
    }
    Ok(())
}
