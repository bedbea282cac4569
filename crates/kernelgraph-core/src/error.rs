//! The error taxonomy.

use crate::handle::NodeHandle;
use crate::port::{InPortId, OutPortId};

/// Programmer errors, reported synchronously at the call site. The graph
/// is left unchanged when one of these is returned.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShapeError {
    #[error("invalid handle {0:?}")]
    InvalidHandle(NodeHandle),
    #[error("invalid port {0:?} on node {1:?}")]
    InvalidPort(u16, NodeHandle),
    #[error("port {0:?} on node {1:?} is a port-array; an index is required")]
    PortArrayIndexRequired(u16, NodeHandle),
    #[error("port {0:?} on node {1:?} is not a port-array; no index is allowed")]
    PortArrayIndexNotAllowed(u16, NodeHandle),
    #[error("index {index} is out of range for port-array of size {size}")]
    IndexOutOfRange { index: u32, size: u32 },
    #[error("category mismatch on port {0:?} of node {1:?}")]
    CategoryMismatch(u16, NodeHandle),
    #[error("type mismatch on port {0:?} of node {1:?}")]
    TypeMismatch(u16, NodeHandle),
    #[error("port {0:?} on node {1:?} is not a port-array")]
    NotAPortArray(u16, NodeHandle),
    #[error("input port {1:?} on node {0:?} already has a data input connected")]
    MultipleDataInputs(NodeHandle, InPortId),
    #[error("destination input port {1:?} on node {0:?} is already connected")]
    AlreadyConnected(NodeHandle, InPortId),
    #[error("connection already exists: {0:?}:{1:?} -> {2:?}:{3:?}")]
    ConnectionExists(NodeHandle, OutPortId, NodeHandle, InPortId),
    #[error("connection not found: {0:?}:{1:?} -> {2:?}:{3:?}")]
    ConnectionMissing(NodeHandle, OutPortId, NodeHandle, InPortId),
    #[error("port {1:?} on node {0:?} has embedded buffers and cannot be set with `set_data`")]
    PortHasBuffers(NodeHandle, OutPortId),
    #[error("port {1:?} on node {0:?} is not a data port")]
    NotADataPort(NodeHandle, u16),
    #[error("feedback connections are only allowed between data ports")]
    FeedbackOnNonData,
    #[error("node {0:?} is not registered for update")]
    NotRegisteredForUpdate(NodeHandle),
    #[error("node {0:?} is already registered for update")]
    AlreadyRegisteredForUpdate(NodeHandle),
    #[error("cannot emit through a forwarded port")]
    EmitThroughForwardedPort,
    #[error("node {0} failed to initialize: {1}")]
    InitFailed(&'static str, String),
}

/// Errors caused by exhausted resources.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("pool size exceeded")]
    PoolSizeExceeded,
}

/// Deferred errors, surfaced via the traversal cache's error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("a cycle was detected under the traversal mask")]
    Cycles,
    #[error("the alternate hierarchy reaches vertices unreachable under the traversal mask")]
    UnrelatedHierarchy,
}

/// Errors that indicate internal corruption, not reachable from
/// well-behaved callers. Fatal to the frame; trigger a full render-world
/// reset with a logged message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogicError {
    #[error("broken intrusive list")]
    BrokenList,
    #[error("forwarding table entry has no replacement")]
    MissingReplacement,
    #[error("dangling array-size entry")]
    DanglingArraySizeEntry,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelGraphError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Logic(#[from] LogicError),
}
