//! Incremental connected-component ("group") tracking for the topology
//! database.
//!
//! Union is the standard O(α(n)) union-find. Disconnection cannot shrink a
//! union-find incrementally — removing an edge can only ever *split* a
//! component, never merge one — so [`Partition::split_group`] re-floods a
//! caller-supplied vertex set from scratch using the edges still considered
//! live. The topology database decides which vertices need re-flooding; this
//! type only tracks the resulting group ids.

use ahash::AHashMap;
use kernelgraph_core::handle::NodeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

#[derive(Debug, Default)]
pub struct Partition {
    parent: Vec<u32>,
    rank: Vec<u8>,
    node_group: AHashMap<NodeHandle, u32>,
    next_id: u32,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_vertex(&mut self, node: NodeHandle) -> GroupId {
        let id = self.next_id;
        self.next_id += 1;
        self.parent.push(id);
        self.rank.push(0);
        self.node_group.insert(node, id);
        GroupId(id)
    }

    pub fn remove_vertex(&mut self, node: NodeHandle) {
        self.node_group.remove(&node);
    }

    pub fn group_of(&self, node: NodeHandle) -> Option<GroupId> {
        // Not path-compressing here since `&self` is read-only; the next
        // mutable `find_root` call (via `union`) will flatten the path.
        let mut id = *self.node_group.get(&node)?;
        while self.parent[id as usize] != id {
            id = self.parent[id as usize];
        }
        Some(GroupId(id))
    }

    fn find_root(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    /// Unions the groups containing `a` and `b`. Returns `None` if either
    /// vertex is unknown to this partition.
    pub fn union(&mut self, a: NodeHandle, b: NodeHandle) -> Option<GroupId> {
        let ga = *self.node_group.get(&a)?;
        let gb = *self.node_group.get(&b)?;
        let mut ra = self.find_root(ga);
        let mut rb = self.find_root(gb);
        if ra == rb {
            return Some(GroupId(ra));
        }
        if self.rank[ra as usize] < self.rank[rb as usize] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb as usize] = ra;
        if self.rank[ra as usize] == self.rank[rb as usize] {
            self.rank[ra as usize] += 1;
        }
        Some(GroupId(ra))
    }

    /// Re-assigns fresh, singleton group ids to every vertex in
    /// `vertices`, then unions them back together along `edges` (pairs of
    /// vertices joined by a connection the caller still considers live).
    /// Vertices not mentioned in `edges` end up in their own singleton
    /// group, which is exactly the orphaned-after-disconnect case.
    pub fn split_group(&mut self, vertices: &[NodeHandle], edges: &[(NodeHandle, NodeHandle)]) {
        for &v in vertices {
            let id = self.next_id;
            self.next_id += 1;
            self.parent.push(id);
            self.rank.push(0);
            self.node_group.insert(v, id);
        }
        for &(a, b) in edges {
            self.union(a, b);
        }
    }
}
