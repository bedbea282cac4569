use std::fmt::Debug;
use std::hash::Hash;

/// Identifies which [`NodeSet`](../../kernelgraph/struct.NodeSet.html) a
/// [`NodeHandle`] was issued from, so a handle from one set can never
/// validate against another set's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(pub u32);

/// A globally unique, versioned identifier for a node.
///
/// A handle is a `(set, index, version)` triple. It is *validated* by
/// comparing the version against the slot's current version; destroying a
/// node bumps the slot's version so any copy of the old handle compares
/// unequal and is rejected by every internal API.
#[derive(Clone, Copy)]
pub struct NodeHandle {
    pub set: SetId,
    pub idx: thunderdome::Index,
    pub debug_name: &'static str,
}

impl NodeHandle {
    pub const DANGLING: Self = Self {
        set: SetId(u32::MAX),
        idx: thunderdome::Index::DANGLING,
        debug_name: "dangling",
    };
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::DANGLING
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.set == other.set && self.idx == other.idx
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.set.hash(state);
        self.idx.hash(state);
    }
}

impl Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.debug_name,
            self.set.0,
            self.idx.slot(),
            self.idx.generation()
        )
    }
}

/// A globally unique, versioned identifier for a connection.
///
/// Shares the "zero = invalid" sentinel convention with array-size handles
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub thunderdome::Index);

impl ConnectionHandle {
    pub const INVALID: Self = Self(thunderdome::Index::DANGLING);
}
