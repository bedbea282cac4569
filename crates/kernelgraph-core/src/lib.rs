pub mod alloc;
pub mod buffer;
pub mod error;
pub mod handle;
pub mod node;
pub mod port;

pub use error::{GraphError, KernelGraphError, LogicError, ResourceError, ShapeError};
pub use handle::{NodeHandle, SetId};
pub use port::{InPortId, InputPortArrayID, OutPortId, OutputPortArrayID, PortCategory};

/// The maximum number of elements a single port-array may hold.
///
/// Chosen so that an array index plus the "not an array" sentinel both
/// fit in a `u16`.
pub const MAX_PORT_ARRAY_SIZE: u32 = 65_534;
