use parking_lot::{Mutex, MutexGuard};

use crate::types::PointId;

/// Flat storage for the vectors under construction, strided by dimension.
pub(crate) struct VectorSet {
    dim: usize,
    count: usize,
    data: Vec<f32>,
}

impl VectorSet {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            count: 0,
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        self.data.extend_from_slice(vector);
        self.count += 1;
    }

    #[inline]
    pub fn get(&self, pid: PointId) -> &[f32] {
        let start = pid.idx() * self.dim;
        &self.data[start..start + self.dim]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// Mutable per-node graph state: the node's level and one adjacency list
/// per layer it participates in.
pub(crate) struct NodeLinks {
    pub level: usize,
    /// `friends[i]` is the adjacency list at layer `i`, `0 <= i <= level`.
    pub friends: Vec<Vec<PointId>>,
}

impl NodeLinks {
    pub fn degree(&self, level: usize) -> usize {
        self.friends[level].len()
    }
}

/// A build-time graph node in the id-indexed arena.
///
/// All mutable state sits behind one mutex so that concurrent workers can
/// snapshot or rewrite an adjacency list atomically. A node starts
/// unassigned; the worker inserting it assigns its level (and sizes its
/// per-layer lists) before the node is linked anywhere, so other workers
/// can only observe it fully formed.
pub(crate) struct BuildNode {
    links: Mutex<NodeLinks>,
}

impl BuildNode {
    pub fn unassigned() -> Self {
        Self {
            links: Mutex::new(NodeLinks {
                level: 0,
                friends: Vec::new(),
            }),
        }
    }

    pub fn assign(&self, level: usize, max_m: usize, max_m0: usize) {
        let mut links = self.links.lock();
        links.level = level;
        links.friends = (0..=level)
            .map(|layer| {
                // one extra slot: lists grow past the cap before a shrink
                let cap = if layer == 0 { max_m0 } else { max_m };
                Vec::with_capacity(cap + 1)
            })
            .collect();
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, NodeLinks> {
        self.links.lock()
    }

    pub fn into_links(self) -> NodeLinks {
        self.links.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_set_is_strided_by_dim() {
        let mut set = VectorSet::new(3);
        set.push(&[1.0, 2.0, 3.0]);
        set.push(&[4.0, 5.0, 6.0]);
        assert_eq!(set.count(), 2);
        assert_eq!(set.get(PointId(0)), &[1.0, 2.0, 3.0]);
        assert_eq!(set.get(PointId(1)), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn assigned_node_has_one_list_per_layer() {
        let node = BuildNode::unassigned();
        node.assign(2, 4, 8);
        let links = node.lock();
        assert_eq!(links.level, 2);
        assert_eq!(links.friends.len(), 3);
        assert!(links.friends.iter().all(|list| list.is_empty()));
    }
}
