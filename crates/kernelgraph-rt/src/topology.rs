//! The incrementally-maintained connection topology.
//!
//! Every connect/disconnect keeps both the per-node edge lists and
//! [`Partition`]'s connected-component tracking current, so the traversal
//! cache only has to re-sort the groups that actually changed rather than
//! rebuilding a global order on every edit.

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;
use thunderdome::Arena;

use kernelgraph_core::error::ShapeError;
use kernelgraph_core::handle::{ConnectionHandle, NodeHandle};
use kernelgraph_core::port::{InputPortArrayID, OutputPortArrayID};

use crate::partition::{GroupId, Partition};

/// One established connection between a source output port and a
/// destination input port.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub source: NodeHandle,
    pub source_port: OutputPortArrayID,
    pub dest: NodeHandle,
    pub dest_port: InputPortArrayID,
    pub is_feedback: bool,
}

type ConnectionKey = (NodeHandle, OutputPortArrayID, NodeHandle, InputPortArrayID);

#[derive(Default)]
pub struct TopologyDatabase {
    connections: Arena<Connection>,
    outgoing: AHashMap<NodeHandle, SmallVec<[ConnectionHandle; 4]>>,
    incoming: AHashMap<NodeHandle, SmallVec<[ConnectionHandle; 4]>>,
    connected_inputs: AHashSet<(NodeHandle, InputPortArrayID)>,
    existing: AHashMap<ConnectionKey, ConnectionHandle>,
    groups: Partition,
}

impl TopologyDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_created(&mut self, node: NodeHandle) {
        self.groups.insert_vertex(node);
        self.outgoing.entry(node).or_default();
        self.incoming.entry(node).or_default();
    }

    /// Removes a vertex that no longer has any connections. The caller must
    /// have already drained them via [`Self::disconnect_all`].
    pub fn vertex_deleted(&mut self, node: NodeHandle) {
        debug_assert!(
            self.outgoing.get(&node).is_none_or(|v| v.is_empty())
                && self.incoming.get(&node).is_none_or(|v| v.is_empty()),
            "vertex_deleted called on {:?} with live connections still attached",
            node
        );
        self.outgoing.remove(&node);
        self.incoming.remove(&node);
        self.groups.remove_vertex(node);
    }

    pub fn connection_exists(
        &self,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
    ) -> bool {
        self.existing
            .contains_key(&(source, source_port, dest, dest_port))
    }

    pub fn find_connection(
        &self,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
    ) -> Option<ConnectionHandle> {
        self.existing
            .get(&(source, source_port, dest, dest_port))
            .copied()
    }

    pub fn is_input_connected(&self, node: NodeHandle, port: InputPortArrayID) -> bool {
        self.connected_inputs.contains(&(node, port))
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(handle.0)
    }

    pub fn connections_from(&self, node: NodeHandle) -> &[ConnectionHandle] {
        self.outgoing.get(&node).map_or(&[], |v| v.as_slice())
    }

    pub fn connections_to(&self, node: NodeHandle) -> &[ConnectionHandle] {
        self.incoming.get(&node).map_or(&[], |v| v.as_slice())
    }

    pub fn group_of(&self, node: NodeHandle) -> Option<GroupId> {
        self.groups.group_of(node)
    }

    pub fn count_established_connections(&self) -> usize {
        self.connections.len()
    }

    /// Records a new connection. Rejects an exact duplicate; every other
    /// shape invariant (single data input, category/type match, port-array
    /// bounds) is the caller's job since this type has no notion of port
    /// categories or types.
    pub fn connect(
        &mut self,
        source: NodeHandle,
        source_port: OutputPortArrayID,
        dest: NodeHandle,
        dest_port: InputPortArrayID,
        is_feedback: bool,
    ) -> Result<ConnectionHandle, ShapeError> {
        let key = (source, source_port, dest, dest_port);
        if self.existing.contains_key(&key) {
            return Err(ShapeError::ConnectionExists(
                source,
                source_port.port,
                dest,
                dest_port.port,
            ));
        }

        let conn = Connection {
            source,
            source_port,
            dest,
            dest_port,
            is_feedback,
        };
        let handle = ConnectionHandle(self.connections.insert(conn));

        self.outgoing.entry(source).or_default().push(handle);
        self.incoming.entry(dest).or_default().push(handle);
        self.connected_inputs.insert((dest, dest_port));
        self.existing.insert(key, handle);

        self.groups.union(source, dest);

        Ok(handle)
    }

    /// Removes a connection. Returns the removed [`Connection`] so the
    /// caller can release any owned storage it held, or `None` if the
    /// handle was already stale.
    pub fn disconnect(&mut self, handle: ConnectionHandle) -> Option<Connection> {
        let conn = self.connections.remove(handle.0)?;

        if let Some(v) = self.outgoing.get_mut(&conn.source) {
            v.retain(|&h| h != handle);
        }
        if let Some(v) = self.incoming.get_mut(&conn.dest) {
            v.retain(|&h| h != handle);
        }
        self.connected_inputs.remove(&(conn.dest, conn.dest_port));
        self.existing
            .remove(&(conn.source, conn.source_port, conn.dest, conn.dest_port));

        self.maybe_split_group(conn.source, conn.dest);

        Some(conn)
    }

    /// Removes every connection touching `node`, in either direction.
    /// Returns the handles alongside their connections so the caller can
    /// still record a diff entry naming the exact slot that was freed.
    pub fn disconnect_all(&mut self, node: NodeHandle) -> SmallVec<[(ConnectionHandle, Connection); 8]> {
        let handles: SmallVec<[ConnectionHandle; 8]> = self
            .outgoing
            .get(&node)
            .into_iter()
            .flatten()
            .chain(self.incoming.get(&node).into_iter().flatten())
            .copied()
            .collect();

        let mut removed = SmallVec::new();
        for h in handles {
            if let Some(c) = self.disconnect(h) {
                removed.push((h, c));
            }
        }
        removed
    }

    /// After removing the edge `(a, b)`, checks whether `a` and `b` are
    /// still reachable from one another through some other path. If not,
    /// the group they used to share is re-flooded into however many pieces
    /// it actually splits into.
    fn maybe_split_group(&mut self, a: NodeHandle, b: NodeHandle) {
        if self.reachable(a, b) {
            return;
        }
        let Some(group) = self.groups.group_of(a) else {
            return;
        };

        let mut all_nodes: AHashSet<NodeHandle> = AHashSet::default();
        all_nodes.extend(self.outgoing.keys().copied());
        all_nodes.extend(self.incoming.keys().copied());

        let members: Vec<NodeHandle> = all_nodes
            .into_iter()
            .filter(|&n| self.groups.group_of(n) == Some(group))
            .collect();

        let mut edges = Vec::new();
        for &n in &members {
            for &h in self.outgoing.get(&n).into_iter().flatten() {
                if let Some(c) = self.connections.get(h.0) {
                    edges.push((c.source, c.dest));
                }
            }
        }

        self.groups.split_group(&members, &edges);
    }

    /// Undirected BFS reachability over currently-live connections, scoped
    /// to answer "did removing one edge disconnect `a` from `b`".
    fn reachable(&self, a: NodeHandle, b: NodeHandle) -> bool {
        if a == b {
            return true;
        }
        let mut visited: AHashSet<NodeHandle> = AHashSet::default();
        let mut stack = vec![a];
        visited.insert(a);

        while let Some(n) = stack.pop() {
            let neighbors = self
                .outgoing
                .get(&n)
                .into_iter()
                .flatten()
                .chain(self.incoming.get(&n).into_iter().flatten())
                .filter_map(|h| self.connections.get(h.0));

            for c in neighbors {
                let other = if c.source == n { c.dest } else { c.source };
                if other == b {
                    return true;
                }
                if visited.insert(other) {
                    stack.push(other);
                }
            }
        }
        false
    }
}
