//! The traversal cache: a per-group topological ordering of the graph,
//! recomputed only for the groups a diff batch actually touched.
//!
//! The sort itself is Kahn's algorithm. The topology database already
//! partitions vertices into connected-component groups via union-find, so
//! a change inside one group never forces a re-sort of any other, and a
//! cycle confined to one group never blocks execution of the rest of the
//! graph.

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;

use kernelgraph_core::error::GraphError;
use kernelgraph_core::handle::NodeHandle;

use crate::partition::GroupId;
use crate::topology::TopologyDatabase;

/// One connected component's topologically-ordered vertex list, plus the
/// parent/child edge tables needed to walk it without re-deriving adjacency
/// from the topology database on every frame.
#[derive(Debug, Default, Clone)]
pub struct Group {
    pub order: Vec<NodeHandle>,
    pub parents: AHashMap<NodeHandle, SmallVec<[NodeHandle; 4]>>,
    pub children: AHashMap<NodeHandle, SmallVec<[NodeHandle; 4]>>,
    pub roots: Vec<NodeHandle>,
    pub leaves: Vec<NodeHandle>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TraversalCache {
    groups: AHashMap<GroupId, Group>,
    errors: Vec<(GroupId, GraphError)>,
}

impl TraversalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&GroupId, &Group)> {
        self.groups.iter()
    }

    /// Groups that failed their last resort, paired with why. Left in
    /// place (not silently dropped) until the caller fixes the cycle and
    /// the next resort clears the entry.
    pub fn errors(&self) -> &[(GroupId, GraphError)] {
        &self.errors
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn drop_group(&mut self, id: GroupId) {
        self.groups.remove(&id);
    }

    /// Recomputes the topological order for each group in `touched_groups`.
    /// `group_vertices` resolves a group id to its current member list; an
    /// empty result drops the group's cached entry entirely (it was fully
    /// torn down). A group whose members contain a cycle keeps its
    /// previous cached order (if any) and records a [`GraphError::Cycles`]
    /// in [`Self::errors`] instead of overwriting it with a partial sort.
    pub fn resort_groups(
        &mut self,
        topo: &TopologyDatabase,
        touched_groups: impl IntoIterator<Item = GroupId>,
        group_vertices: impl Fn(GroupId) -> Vec<NodeHandle>,
    ) {
        for group_id in touched_groups {
            let vertices = group_vertices(group_id);
            if vertices.is_empty() {
                self.groups.remove(&group_id);
                continue;
            }

            match Self::sort_one_group(topo, &vertices) {
                Ok(group) => {
                    self.groups.insert(group_id, group);
                }
                Err(e) => {
                    log::warn!("group {:?} failed to sort: {}", group_id, e);
                    self.errors.push((group_id, e));
                }
            }
        }
    }

    fn sort_one_group(topo: &TopologyDatabase, vertices: &[NodeHandle]) -> Result<Group, GraphError> {
        let members: AHashSet<NodeHandle> = vertices.iter().copied().collect();

        let mut children: AHashMap<NodeHandle, SmallVec<[NodeHandle; 4]>> = AHashMap::default();
        let mut parents: AHashMap<NodeHandle, SmallVec<[NodeHandle; 4]>> = AHashMap::default();
        let mut in_degree: AHashMap<NodeHandle, u32> = AHashMap::default();

        for &v in vertices {
            children.entry(v).or_default();
            parents.entry(v).or_default();
            in_degree.entry(v).or_default();
        }

        // Feedback connections never participate in the primary in-degree
        // count; a feedback edge Y->X instead contributes a synthetic
        // reverse pair (X, Y) to the alternate hierarchy, since that is the
        // direction the corresponding forward edge already orders the pair
        // in.
        let mut alternate_edges: Vec<(NodeHandle, NodeHandle)> = Vec::new();

        for &v in vertices {
            for &h in topo.connections_from(v) {
                let Some(c) = topo.connection(h) else {
                    continue;
                };
                if !members.contains(&c.dest) {
                    continue;
                }
                if c.is_feedback {
                    alternate_edges.push((c.dest, c.source));
                    continue;
                }
                children.get_mut(&v).unwrap().push(c.dest);
                parents.get_mut(&c.dest).unwrap().push(v);
                *in_degree.get_mut(&c.dest).unwrap() += 1;
            }
        }

        Self::check_alternate_hierarchy(&members, alternate_edges)?;

        let roots: Vec<NodeHandle> = vertices
            .iter()
            .copied()
            .filter(|v| in_degree[v] == 0)
            .collect();
        let leaves: Vec<NodeHandle> = vertices
            .iter()
            .copied()
            .filter(|v| children[v].is_empty())
            .collect();

        let mut remaining_in_degree = in_degree;
        let mut queue: VecDeque<NodeHandle> = roots.iter().copied().collect();
        let mut order = Vec::with_capacity(vertices.len());

        while let Some(v) = queue.pop_front() {
            order.push(v);
            for &child in &children[&v] {
                let deg = remaining_in_degree.get_mut(&child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() != vertices.len() {
            return Err(GraphError::Cycles);
        }

        Ok(Group {
            order,
            parents,
            children,
            roots,
            leaves,
        })
    }

    /// Validates that an alternate-hierarchy walk never steps outside the vertex
    /// set reachable under the group's primary traversal mask.
    pub fn check_alternate_hierarchy(
        group_members: &AHashSet<NodeHandle>,
        alternate_edges: impl IntoIterator<Item = (NodeHandle, NodeHandle)>,
    ) -> Result<(), GraphError> {
        for (a, b) in alternate_edges {
            if !group_members.contains(&a) || !group_members.contains(&b) {
                return Err(GraphError::UnrelatedHierarchy);
            }
        }
        Ok(())
    }
}
