//! The node vtable and kernel calling convention.

use downcast_rs::Downcast;
use std::any::Any;
use std::error::Error;
use std::marker::PhantomData;

use crate::handle::NodeHandle;
use crate::port::{InPortId, OutPortId, PortDescriptor};

/// A simulation-side node definition.
///
/// Source systems typically build this via inheritance plus a
/// reflection-built traits handle; here it is a plain trait object, and the
/// flat [`PortDescriptor`] list is built once when the definition is
/// registered rather than discovered by reflection.
pub trait NodeDefinition: 'static + Downcast {
    fn debug_name(&self) -> &'static str;

    /// The node's input and output port descriptions, in port-index order.
    fn ports(&self) -> &'static [PortDescriptor];

    /// Runs once after the node is created. May publish forwarded ports
    /// through `cx`. A failing init runs the destroy path (without the
    /// user hook) and propagates the error.
    #[allow(unused_variables)]
    fn init(&mut self, cx: &mut InitContext<'_>) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    /// Runs once before the node is removed from its set. Cannot fail; a
    /// throwing destructor is undefined behavior in the source system, but
    /// here the runtime simply logs and continues.
    fn destroy(&mut self) {}

    /// Called once per frame if [`NodeDefinition::wants_update`] is `true`.
    /// May emit messages through `cx`.
    #[allow(unused_variables)]
    fn update(&mut self, cx: &mut UpdateContext<'_>) {}

    fn wants_update(&self) -> bool {
        false
    }

    /// Handles a value delivered on a message input port. May emit further
    /// messages through `cx`, delivered depth-first before this call
    /// returns to its own caller.
    #[allow(unused_variables)]
    fn message(&mut self, port: InPortId, value: &dyn Any, cx: &mut MessageContext<'_>) {}

    /// Builds this node's render-side kernel, if it has one. Called once
    /// per render-graph activation of the node.
    fn build_kernel(&mut self) -> Option<Box<dyn NodeKernel>> {
        None
    }
}

downcast_rs::impl_downcast!(NodeDefinition);

/// Lets a node publish forwarded ports during `init`, without this crate
/// knowing about the node set's forwarding table directly.
pub trait ForwardingSink {
    fn forward_input(&mut self, from: (NodeHandle, InPortId), to: (NodeHandle, InPortId));
    fn forward_output(&mut self, from: (NodeHandle, OutPortId), to: (NodeHandle, OutPortId));
}

/// Handed to [`NodeDefinition::init`]; carries the node's own handle so it
/// can publish a forwarded port without needing to already know its own
/// identity.
pub struct InitContext<'a> {
    node: NodeHandle,
    forwarding: &'a mut dyn ForwardingSink,
}

impl<'a> InitContext<'a> {
    pub fn new(node: NodeHandle, forwarding: &'a mut dyn ForwardingSink) -> Self {
        Self { node, forwarding }
    }

    pub fn node(&self) -> NodeHandle {
        self.node
    }

    /// Publishes one of this node's input ports as an alias for
    /// `inner_node`'s `inner_port`.
    pub fn forward_input(&mut self, outer_port: InPortId, inner_node: NodeHandle, inner_port: InPortId) {
        self.forwarding
            .forward_input((self.node, outer_port), (inner_node, inner_port));
    }

    /// Publishes one of this node's output ports as an alias for
    /// `inner_node`'s `inner_port`.
    pub fn forward_output(&mut self, outer_port: OutPortId, inner_node: NodeHandle, inner_port: OutPortId) {
        self.forwarding
            .forward_output((self.node, outer_port), (inner_node, inner_port));
    }
}

/// One queued emission, captured at the call site before the handler's
/// mutable borrow ends. `bytes` is a raw copy of `value`, used only if the
/// emission ends up routed to a data port instead of a message handler.
pub struct PendingEmit {
    pub source: NodeHandle,
    pub port: OutPortId,
    pub value: Box<dyn Any>,
    pub bytes: Box<[u8]>,
}

fn copy_bytes<T: Copy>(value: &T) -> Box<[u8]> {
    // SAFETY: `T: Copy`, so reading its bytes never observes a value
    // mid-move and never needs a destructor run on the copy.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
        .to_vec()
        .into_boxed_slice()
}

/// Handed to [`NodeDefinition::message`]; lets a handler re-emit from its
/// own output ports as part of the same depth-first delivery pass.
pub struct MessageContext<'a> {
    node: NodeHandle,
    pending: &'a mut Vec<PendingEmit>,
}

impl<'a> MessageContext<'a> {
    pub fn new(node: NodeHandle, pending: &'a mut Vec<PendingEmit>) -> Self {
        Self { node, pending }
    }

    pub fn node(&self) -> NodeHandle {
        self.node
    }

    /// Queues `value` for delivery to every node connected to this node's
    /// `port`. Delivered depth-first, after the current handler returns.
    /// Bounded to `Copy` types: an emission that lands on a data port is
    /// patched in as raw bytes, the same as [`crate::node`]'s other
    /// data-port writers.
    pub fn emit<T: 'static + Copy>(&mut self, port: OutPortId, value: T) {
        let bytes = copy_bytes(&value);
        self.pending.push(PendingEmit {
            source: self.node,
            port,
            value: Box::new(value),
            bytes,
        });
    }
}

/// Handed to [`NodeDefinition::update`]; the update-time counterpart of
/// [`MessageContext`].
pub struct UpdateContext<'a> {
    node: NodeHandle,
    pending: &'a mut Vec<PendingEmit>,
}

impl<'a> UpdateContext<'a> {
    pub fn new(node: NodeHandle, pending: &'a mut Vec<PendingEmit>) -> Self {
        Self { node, pending }
    }

    pub fn node(&self) -> NodeHandle {
        self.node
    }

    pub fn emit<T: 'static + Copy>(&mut self, port: OutPortId, value: T) {
        let bytes = copy_bytes(&value);
        self.pending.push(PendingEmit {
            source: self.node,
            port,
            value: Box::new(value),
            bytes,
        });
    }
}

/// A pure-function, data-phase procedure attached to a node. Reads
/// patched input pointers, writes outputs.
pub trait NodeKernel: 'static + Send {
    fn process(&mut self, ports: KernelPorts<'_>, cx: &mut RenderContext<'_>);
}

/// The patched input/output port views handed to a kernel for one frame.
///
/// Each view's lifetime is bounded by the render-frame token carried in
/// [`RenderContext`]; a view may not escape the kernel.
pub struct KernelPorts<'a> {
    inputs: &'a [PortView<'a>],
    outputs: &'a mut [PortViewMut<'a>],
}

impl<'a> KernelPorts<'a> {
    pub fn new(inputs: &'a [PortView<'a>], outputs: &'a mut [PortViewMut<'a>]) -> Self {
        Self { inputs, outputs }
    }

    pub fn input(&self, index: usize) -> &PortView<'a> {
        &self.inputs[index]
    }

    pub fn output(&mut self, index: usize) -> &mut PortViewMut<'a> {
        &mut self.outputs[index]
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }
}

/// A read-only view into a patched data-input port's current value.
pub struct PortView<'a> {
    ptr: *const u8,
    len: usize,
    _marker: PhantomData<&'a ()>,
}

impl<'a> PortView<'a> {
    /// # Safety
    /// `ptr` must point to at least `len` valid, initialized bytes for the
    /// lifetime `'a`, which the render graph guarantees by construction:
    /// it only ever hands out views that live for the duration of a single
    /// kernel invocation.
    pub unsafe fn new(ptr: *const u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// Reinterpret the view as a typed slice. The caller must ensure `T`
    /// matches the port's declared element type (checked once, at patch
    /// time, against the port descriptor).
    pub fn as_slice<T>(&self) -> &'a [T] {
        let count = self.len / std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts(self.ptr as *const T, count) }
    }
}

/// A mutable view into a data-output port's backing buffer.
pub struct PortViewMut<'a> {
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> PortViewMut<'a> {
    /// # Safety
    /// Same contract as [`PortView::new`], plus exclusive access for `'a`.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn as_slice_mut<T>(&mut self) -> &'a mut [T] {
        let count = self.len / std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut T, count) }
    }
}

/// Per-kernel execution context.
///
/// Owns the atomic-safety stamping for buffer views handed out during
/// execution: any view dereferenced against a stale `frame_version` is a
/// programming error the debug build can assert on.
pub struct RenderContext<'a> {
    pub frame_version: u64,
    pub cx: &'a mut (dyn Any + Send),
}

impl<'a> RenderContext<'a> {
    pub fn new(frame_version: u64, cx: &'a mut (dyn Any + Send)) -> Self {
        Self { frame_version, cx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_view_reinterprets_bytes_as_typed_slice() {
        let data: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
        let bytes = data.as_ptr() as *const u8;
        let view = unsafe { PortView::new(bytes, std::mem::size_of_val(&data)) };
        assert_eq!(view.as_slice::<f32>(), &data);
    }
}
