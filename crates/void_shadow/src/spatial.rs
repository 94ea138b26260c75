//! Bounding volume hierarchy over scene primitives
//!
//! Leaves hold small groups of primitives. A shadow's subject gather walks
//! the tree once and hands every surviving leaf to a worker as one packet.

use glam::Vec3;
use void_math::AABB;

use crate::scene::PrimitiveId;

/// Primitives per leaf, and therefore the largest gather packet
pub const DEFAULT_MAX_LEAF_SIZE: usize = 32;

#[derive(Clone, Debug)]
struct BvhNode {
    bounds: AABB,
    /// Range into `items`, only for leaf nodes
    leaf: Option<(usize, usize)>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Binary BVH with multi-primitive leaves
#[derive(Clone, Debug)]
pub struct PrimitiveBvh {
    nodes: Vec<BvhNode>,
    items: Vec<PrimitiveId>,
    root: Option<usize>,
    max_leaf_size: usize,
    version: u32,
}

impl PrimitiveBvh {
    pub fn new(max_leaf_size: usize) -> Self {
        Self {
            nodes: Vec::new(),
            items: Vec::new(),
            root: None,
            max_leaf_size: max_leaf_size.max(1),
            version: 0,
        }
    }

    /// Build from primitives and their bounds
    pub fn build(&mut self, primitives: &[(PrimitiveId, AABB)]) {
        self.nodes.clear();
        self.items.clear();
        self.version = self.version.wrapping_add(1);

        if primitives.is_empty() {
            self.root = None;
            return;
        }

        let mut items: Vec<_> = primitives
            .iter()
            .map(|(id, b)| (*id, *b, b.center()))
            .collect();

        self.root = Some(self.build_recursive(&mut items));
    }

    fn build_recursive(&mut self, items: &mut [(PrimitiveId, AABB, Vec3)]) -> usize {
        let node_index = self.nodes.len();
        let bounds = items.iter().fold(AABB::EMPTY, |acc, (_, b, _)| acc.union(b));

        if items.len() <= self.max_leaf_size {
            let start = self.items.len();
            self.items.extend(items.iter().map(|(id, _, _)| *id));
            self.nodes.push(BvhNode {
                bounds,
                leaf: Some((start, self.items.len())),
                left: None,
                right: None,
            });
            return node_index;
        }

        // Split along the largest extent
        let extent = bounds.max - bounds.min;
        let axis = if extent.x > extent.y && extent.x > extent.z {
            0
        } else if extent.y > extent.z {
            1
        } else {
            2
        };

        items.sort_by(|a, b| a.2[axis].partial_cmp(&b.2[axis]).unwrap_or(std::cmp::Ordering::Equal));

        let mid = items.len() / 2;
        let (left_items, right_items) = items.split_at_mut(mid);

        self.nodes.push(BvhNode {
            bounds,
            leaf: None,
            left: None,
            right: None,
        });

        let left = self.build_recursive(left_items);
        let right = self.build_recursive(right_items);

        self.nodes[node_index].left = Some(left);
        self.nodes[node_index].right = Some(right);

        node_index
    }

    /// Walk the tree, skipping subtrees whose bounds fail `overlaps`, and
    /// return the primitives of every reached leaf as one packet each.
    ///
    /// Primitives inside a packet still need their own test.
    pub fn collect_packets<F>(&self, overlaps: F) -> Vec<&[PrimitiveId]>
    where
        F: Fn(&AABB) -> bool,
    {
        let mut packets = Vec::new();
        if let Some(root) = self.root {
            self.collect_recursive(root, &overlaps, &mut packets);
        }
        packets
    }

    fn collect_recursive<'a, F>(&'a self, node_idx: usize, overlaps: &F, packets: &mut Vec<&'a [PrimitiveId]>)
    where
        F: Fn(&AABB) -> bool,
    {
        let node = &self.nodes[node_idx];

        if !overlaps(&node.bounds) {
            return;
        }

        if let Some((start, end)) = node.leaf {
            packets.push(&self.items[start..end]);
        }

        if let Some(left) = node.left {
            self.collect_recursive(left, overlaps, packets);
        }
        if let Some(right) = node.right {
            self.collect_recursive(right, overlaps, packets);
        }
    }

    /// Primitives whose leaf bounds intersect `query`
    pub fn query_aabb(&self, query: &AABB) -> Vec<PrimitiveId> {
        self.collect_packets(|bounds| bounds.intersects(query))
            .into_iter()
            .flatten()
            .copied()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Incremented on each rebuild
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn root_bounds(&self) -> Option<AABB> {
        self.root.map(|r| self.nodes[r].bounds)
    }
}

impl Default for PrimitiveBvh {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEAF_SIZE)
    }
}
