//! The double-buffered render graph: sparse kernel storage, per-frame
//! diff application, and kernel dispatch.
//!
//! A control-side world and a render-side world are kept structurally
//! apart, synchronized once per frame by a "copy worlds" step that drains
//! and applies the accumulated diff in place rather than shipping it
//! across a separate thread boundary.

use ahash::AHashMap;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

use kernelgraph_core::error::{KernelGraphError, LogicError};
use kernelgraph_core::handle::NodeHandle;
use kernelgraph_core::node::{KernelPorts, NodeKernel, PortView, PortViewMut, RenderContext};
use kernelgraph_core::port::{PortOwnership, PortStorage};

use crate::diff::{DiffRecord, GraphDiff};
use crate::traversal::{Group, TraversalCache};

/// How the render graph dispatches one frame's kernels.
///
/// `Synchronous` is an inline call on the calling thread; the other three
/// fan out over `std::thread::scope`, since the workspace carries no
/// job-system crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderExecutionModel {
    /// Every kernel runs inline, in topological order, on the calling
    /// thread.
    Synchronous,
    /// Every group's kernels run in topological order on one dedicated
    /// worker thread, shared across all groups.
    SingleThreaded,
    /// Each connected-component group gets its own scoped thread; kernels
    /// within a group still run sequentially.
    Islands,
    /// Kernels run as soon as their dependencies are satisfied: each group
    /// is split into topological "waves", and every node in a wave runs
    /// concurrently.
    MaximallyParallel,
}

impl Default for RenderExecutionModel {
    fn default() -> Self {
        Self::MaximallyParallel
    }
}

/// A render-side node: its kernel plus the patched storage for every port
/// it reads or writes this frame.
struct KernelNode {
    kernel: Box<dyn NodeKernel>,
    input_storage: Vec<PortStorage>,
    output_storage: Vec<PortStorage>,
}

/// A raw pointer wrapper used only to hand a [`KernelNode`] across a scoped
/// thread boundary. Safe exclusively because [`RenderGraph::dispatch`]
/// guarantees each pointer handed to a worker names a node no other worker
/// touches during that wave.
struct SendPtr(*mut KernelNode);
unsafe impl Send for SendPtr {}

/// The render-side world: a sparse table of active kernels plus the
/// frame-version stamp used to detect stale port views.
#[derive(Default)]
pub struct RenderGraph {
    nodes: AHashMap<NodeHandle, KernelNode>,
    frame_version: AtomicU64,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn frame_version(&self) -> u64 {
        self.frame_version.load(Ordering::Acquire)
    }

    pub fn install_kernel(
        &mut self,
        node: NodeHandle,
        kernel: Box<dyn NodeKernel>,
        num_inputs: usize,
        num_outputs: usize,
    ) {
        self.nodes.insert(
            node,
            KernelNode {
                kernel,
                input_storage: vec![PortStorage::disconnected(std::ptr::null(), 0); num_inputs],
                output_storage: vec![PortStorage::disconnected(std::ptr::null(), 0); num_outputs],
            },
        );
    }

    pub fn patch_input(&mut self, node: NodeHandle, port: usize, storage: PortStorage) {
        if let Some(kn) = self.nodes.get_mut(&node) {
            if let Some(slot) = kn.input_storage.get_mut(port) {
                *slot = storage;
            }
        }
    }

    pub fn patch_output(&mut self, node: NodeHandle, port: usize, storage: PortStorage) {
        if let Some(kn) = self.nodes.get_mut(&node) {
            if let Some(slot) = kn.output_storage.get_mut(port) {
                *slot = storage;
            }
        }
    }

    /// Copies a data input's currently patched bytes into an owned
    /// allocation, used by `disconnect_and_retain_value` to freeze whatever
    /// value the port last saw before its source is disconnected. Returns
    /// an empty buffer if the node or port isn't installed yet.
    pub fn snapshot_input(&self, node: NodeHandle, port: usize) -> Box<[u8]> {
        let Some(storage) = self
            .nodes
            .get(&node)
            .and_then(|kn| kn.input_storage.get(port))
        else {
            return Box::default();
        };
        if storage.ptr.is_null() || storage.len == 0 {
            return Box::default();
        }
        // SAFETY: `storage` was patched either to the blank page or to a
        // live node's storage, both of which are valid for `storage.len`
        // bytes for as long as the owning node exists.
        unsafe { std::slice::from_raw_parts(storage.ptr, storage.len) }
            .to_vec()
            .into_boxed_slice()
    }

    /// Returns a data output's current patched storage, used by the node
    /// set to propagate a value into every connected input during its
    /// per-frame patch step.
    pub fn output_storage(&self, node: NodeHandle, port: usize) -> Option<PortStorage> {
        self.nodes.get(&node)?.output_storage.get(port).copied()
    }

    /// Runs the per-frame synchronization between the simulation-side
    /// world and the render-side world:
    ///
    /// 1. Bump the frame version so any view handed out last frame is
    ///    provably stale.
    /// 2. Apply `NodeDeleted` records, dropping retired kernels.
    /// 3. Apply `ConnectionCreated`/`ConnectionDeleted` records (patching
    ///    itself is driven by the node set, which alone holds the
    ///    topology database; this step only preserves diff ordering).
    /// 4. Apply `PortArrayResized` records, growing input-array storage.
    /// 5. Apply `BufferResized` records, validating the target node is
    ///    still live.
    /// 6. Apply `MessageToData` records, copying message payloads into
    ///    owned data-input storage.
    /// 7. Apply `GraphValueCreated` records (bookkeeping only; the value
    ///    itself is exposed through the node set).
    /// 8. Dispatch kernels for every group, per `model`.
    pub fn copy_worlds(
        &mut self,
        diff: &mut GraphDiff,
        traversal: &TraversalCache,
        model: RenderExecutionModel,
        cx: &mut (dyn Any + Send),
    ) -> Result<(), KernelGraphError> {
        self.frame_version.fetch_add(1, Ordering::AcqRel);

        for record in diff.drain() {
            Self::apply_record(&mut self.nodes, record)?;
        }

        self.dispatch(traversal, model, cx);

        Ok(())
    }

    fn apply_record(
        nodes: &mut AHashMap<NodeHandle, KernelNode>,
        record: DiffRecord,
    ) -> Result<(), KernelGraphError> {
        match record {
            DiffRecord::NodeCreated(_) => {
                // The kernel itself arrives via `install_kernel`, called by
                // the node set, which alone knows the concrete `NodeKernel`
                // type. This record only preserves ordering against later
                // records in the same batch.
            }
            DiffRecord::NodeDeleted(node) => {
                nodes.remove(&node);
            }
            DiffRecord::ConnectionCreated { .. } | DiffRecord::ConnectionDeleted { .. } => {}
            DiffRecord::PortArrayResized {
                node,
                port: _,
                new_size,
            } => {
                if let Some(kn) = nodes.get_mut(&node) {
                    kn.input_storage.resize(
                        new_size as usize,
                        PortStorage::disconnected(std::ptr::null(), 0),
                    );
                }
            }
            DiffRecord::BufferResized { node, .. } => {
                if !nodes.contains_key(&node) {
                    return Err(LogicError::DanglingArraySizeEntry.into());
                }
            }
            DiffRecord::MessageToData { node, port, value } => {
                if let Some(kn) = nodes.get_mut(&node) {
                    if let Some(slot) = kn.input_storage.get_mut(port as usize) {
                        // The render graph becomes the sole owner of this
                        // allocation until the next message or disconnect
                        // overwrites the slot.
                        let len = value.len();
                        let ptr = Box::into_raw(value) as *const u8;
                        *slot = PortStorage {
                            ptr,
                            len,
                            ownership: PortOwnership::OwnedByPort,
                        };
                    }
                }
            }
            DiffRecord::GraphValueCreated { .. } => {}
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        traversal: &TraversalCache,
        model: RenderExecutionModel,
        cx: &mut (dyn Any + Send),
    ) {
        let frame_version = self.frame_version();
        match model {
            RenderExecutionModel::Synchronous | RenderExecutionModel::SingleThreaded => {
                for (_, group) in traversal.groups() {
                    for &node in &group.order {
                        Self::run_one(&mut self.nodes, node, frame_version, cx);
                    }
                }
            }
            RenderExecutionModel::Islands => {
                std::thread::scope(|scope| {
                    for (_, group) in traversal.groups() {
                        let ptrs: Vec<(NodeHandle, SendPtr)> = group
                            .order
                            .iter()
                            .filter_map(|&n| {
                                self.nodes
                                    .get_mut(&n)
                                    .map(|kn| (n, SendPtr(kn as *mut KernelNode)))
                            })
                            .collect();
                        let cx_ptr = SendCx(cx as *mut (dyn Any + Send));
                        scope.spawn(move || {
                            // SAFETY: the node set never calls `copy_worlds`
                            // reentrantly, so `cx` is exclusively borrowed
                            // by this frame's dispatch; each group's thread
                            // only reaches into the pointers collected for
                            // it, and groups never share a node (they are
                            // disjoint connected components by construction).
                            let cx = unsafe { &mut *cx_ptr.0 };
                            for (node, ptr) in ptrs {
                                Self::run_one_ptr(node, ptr, frame_version, cx);
                            }
                        });
                    }
                });
            }
            RenderExecutionModel::MaximallyParallel => {
                for (_, group) in traversal.groups() {
                    for wave in topological_waves(group) {
                        std::thread::scope(|scope| {
                            let cx_ptr = SendCx(cx as *mut (dyn Any + Send));
                            for &node in &wave {
                                let Some(kn) = self.nodes.get_mut(&node) else {
                                    continue;
                                };
                                let ptr = SendPtr(kn as *mut KernelNode);
                                scope.spawn(move || {
                                    // SAFETY: nodes within one wave have no
                                    // edge between them (by definition of a
                                    // topological wave), so their port
                                    // storage and kernel state never alias.
                                    let cx = unsafe { &mut *cx_ptr.0 };
                                    Self::run_one_ptr(node, ptr, frame_version, cx);
                                });
                            }
                        });
                    }
                }
            }
        }
    }

    fn run_one(
        nodes: &mut AHashMap<NodeHandle, KernelNode>,
        node: NodeHandle,
        frame_version: u64,
        cx: &mut (dyn Any + Send),
    ) {
        let Some(kn) = nodes.get_mut(&node) else {
            return;
        };
        run_kernel(kn, frame_version, cx);
    }

    fn run_one_ptr(_node: NodeHandle, ptr: SendPtr, frame_version: u64, cx: &mut (dyn Any + Send)) {
        // SAFETY: see the call sites in `dispatch`: every pointer handed to
        // a worker names a node no concurrently running worker also holds.
        let kn = unsafe { &mut *ptr.0 };
        run_kernel(kn, frame_version, cx);
    }
}

/// Same justification as [`SendPtr`]: only used to move a `&mut dyn Any`
/// context reference into a scoped closure that a single thread at a time
/// dereferences.
struct SendCx(*mut (dyn Any + Send));
unsafe impl Send for SendCx {}

fn run_kernel(kn: &mut KernelNode, frame_version: u64, cx: &mut (dyn Any + Send)) {
    let inputs: Vec<PortView<'_>> = kn
        .input_storage
        .iter()
        .map(|s| unsafe { PortView::new(s.ptr, s.len) })
        .collect();
    let mut outputs: Vec<PortViewMut<'_>> = kn
        .output_storage
        .iter()
        .map(|s| unsafe { PortViewMut::new(s.ptr as *mut u8, s.len) })
        .collect();

    let ports = KernelPorts::new(&inputs, &mut outputs);
    let mut render_cx = RenderContext::new(frame_version, cx);
    kn.kernel.process(ports, &mut render_cx);
}

/// Splits a group's topological order into waves where every node in a
/// wave is independent of every other node in the same wave: a node's wave
/// index is one more than the maximum wave index of its parents, the
/// layering a level-order (BFS) relaxation over [`Group::parents`]
/// produces.
fn topological_waves(group: &Group) -> Vec<Vec<NodeHandle>> {
    let mut wave_of: AHashMap<NodeHandle, usize> = AHashMap::default();
    let mut max_wave = 0;

    for &node in &group.order {
        let wave = group
            .parents
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|p| wave_of.get(p))
            .copied()
            .max()
            .map_or(0, |w| w + 1);
        wave_of.insert(node, wave);
        max_wave = max_wave.max(wave);
    }

    let mut waves = vec![Vec::new(); max_wave + 1];
    for &node in &group.order {
        waves[wave_of[&node]].push(node);
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelgraph_core::handle::SetId;

    struct CountingKernel {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl NodeKernel for CountingKernel {
        fn process(&mut self, _ports: KernelPorts<'_>, _cx: &mut RenderContext<'_>) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn node(arena: &mut thunderdome::Arena<()>) -> NodeHandle {
        NodeHandle {
            set: SetId(0),
            idx: arena.insert(()),
            debug_name: "test",
        }
    }

    #[test]
    fn synchronous_dispatch_runs_every_installed_kernel() {
        let mut arena = thunderdome::Arena::new();
        let a = node(&mut arena);
        let b = node(&mut arena);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut rg = RenderGraph::new();
        rg.install_kernel(
            a,
            Box::new(CountingKernel {
                calls: calls.clone(),
            }),
            0,
            0,
        );
        rg.install_kernel(
            b,
            Box::new(CountingKernel {
                calls: calls.clone(),
            }),
            0,
            0,
        );

        let mut traversal = TraversalCache::new();
        let topo = crate::topology::TopologyDatabase::new();
        traversal.resort_groups(&topo, [crate::partition::GroupId(0)], |_| vec![a, b]);

        let mut diff = GraphDiff::new();
        let mut cx: u64 = 0;
        rg.copy_worlds(
            &mut diff,
            &traversal,
            RenderExecutionModel::Synchronous,
            &mut cx,
        )
        .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn node_deleted_record_drops_the_kernel() {
        let mut arena = thunderdome::Arena::new();
        let a = node(&mut arena);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut rg = RenderGraph::new();
        rg.install_kernel(a, Box::new(CountingKernel { calls }), 0, 0);

        let mut diff = GraphDiff::new();
        diff.node_deleted(a);
        let traversal = TraversalCache::new();
        let mut cx: u64 = 0;
        rg.copy_worlds(&mut diff, &traversal, RenderExecutionModel::Synchronous, &mut cx)
            .unwrap();

        assert!(!rg.contains(a));
    }
}
