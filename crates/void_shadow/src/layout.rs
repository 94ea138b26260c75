//! 2D rectangle packing for shadow atlases
//!
//! A guillotine tree: every placement splits a free leaf into the placed
//! rectangle and the remainder along the axis with the larger excess.
//! Placements inside the currently used extent are preferred, so the
//! atlas grows only when nothing fits in what is already used.

/// A node of the packing tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LayoutNode {
    min_x: u32,
    min_y: u32,
    size_x: u32,
    size_y: u32,
    children: Option<(usize, usize)>,
    parent: Option<usize>,
    used: bool,
}

impl LayoutNode {
    fn leaf(min_x: u32, min_y: u32, size_x: u32, size_y: u32, parent: Option<usize>) -> Self {
        Self {
            min_x,
            min_y,
            size_x,
            size_y,
            children: None,
            parent,
            used: false,
        }
    }
}

/// Rectangle allocator with a bounded, growing used extent
#[derive(Clone, Debug)]
pub struct TextureLayout {
    pub min_size_x: u32,
    pub min_size_y: u32,
    pub max_size_x: u32,
    pub max_size_y: u32,
    /// Report the used extent rounded up to powers of two
    pub power_of_two: bool,
    used_size_x: u32,
    used_size_y: u32,
    nodes: Vec<LayoutNode>,
    free_nodes: Vec<usize>,
}

impl Default for TextureLayout {
    fn default() -> Self {
        Self::new(0, 0, 0, 0, false)
    }
}

impl TextureLayout {
    pub fn new(min_size_x: u32, min_size_y: u32, max_size_x: u32, max_size_y: u32, power_of_two: bool) -> Self {
        Self {
            min_size_x,
            min_size_y,
            max_size_x,
            max_size_y,
            power_of_two,
            used_size_x: min_size_x,
            used_size_y: min_size_y,
            nodes: vec![LayoutNode::leaf(0, 0, max_size_x, max_size_y, None)],
            free_nodes: Vec::new(),
        }
    }

    /// Whether the layout has been sized
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.max_size_x > 0 && self.max_size_y > 0
    }

    /// Reserve a `size_x` by `size_y` rectangle and return its corner.
    ///
    /// Zero-sized elements always succeed at the origin.
    pub fn add_element(&mut self, size_x: u32, size_y: u32) -> Option<(u32, u32)> {
        if size_x == 0 || size_y == 0 {
            return Some((0, 0));
        }

        let node_index = self
            .add_surface(0, size_x, size_y, false)
            .or_else(|| self.add_surface(0, size_x, size_y, true))?;

        let node = &mut self.nodes[node_index];
        node.used = true;
        let (x, y) = (node.min_x, node.min_y);

        self.used_size_x = self.used_size_x.max(self.round_size(x + size_x));
        self.used_size_y = self.used_size_y.max(self.round_size(y + size_y));
        Some((x, y))
    }

    /// Free a rectangle previously returned by `add_element`.
    ///
    /// Returns false when no used element matches exactly.
    pub fn remove_element(&mut self, x: u32, y: u32, size_x: u32, size_y: u32) -> bool {
        if size_x == 0 || size_y == 0 {
            return true;
        }

        let found = self.reachable_leaves().into_iter().find(|&index| {
            let node = &self.nodes[index];
            node.used && node.min_x == x && node.min_y == y && node.size_x == size_x && node.size_y == size_y
        });
        let Some(index) = found else {
            return false;
        };

        self.nodes[index].used = false;
        self.merge_free_siblings(index);
        self.recompute_used_size();
        true
    }

    /// Used width, or the power of two above it when so configured
    #[inline]
    pub fn size_x(&self) -> u32 {
        self.used_size_x
    }

    #[inline]
    pub fn size_y(&self) -> u32 {
        self.used_size_y
    }

    /// Whether nothing is placed
    pub fn is_empty(&self) -> bool {
        self.nodes[0].children.is_none() && !self.nodes[0].used
    }

    /// Number of placed elements
    pub fn element_count(&self) -> usize {
        self.reachable_leaves()
            .into_iter()
            .filter(|&index| self.nodes[index].used)
            .count()
    }

    fn round_size(&self, size: u32) -> u32 {
        if self.power_of_two {
            size.next_power_of_two()
        } else {
            size
        }
    }

    fn add_surface(&mut self, index: usize, size_x: u32, size_y: u32, allow_enlargement: bool) -> Option<usize> {
        let node = self.nodes[index];

        if let Some((child_a, child_b)) = node.children {
            return self
                .add_surface(child_a, size_x, size_y, allow_enlargement)
                .or_else(|| self.add_surface(child_b, size_x, size_y, allow_enlargement));
        }

        if node.used || node.size_x < size_x || node.size_y < size_y {
            return None;
        }
        if !allow_enlargement && (node.min_x + size_x > self.used_size_x || node.min_y + size_y > self.used_size_y) {
            return None;
        }
        if node.size_x == size_x && node.size_y == size_y {
            return Some(index);
        }

        let excess_x = node.size_x - size_x;
        let excess_y = node.size_y - size_y;
        let (a, b) = if excess_x > excess_y {
            (
                LayoutNode::leaf(node.min_x, node.min_y, size_x, node.size_y, Some(index)),
                LayoutNode::leaf(node.min_x + size_x, node.min_y, excess_x, node.size_y, Some(index)),
            )
        } else {
            (
                LayoutNode::leaf(node.min_x, node.min_y, node.size_x, size_y, Some(index)),
                LayoutNode::leaf(node.min_x, node.min_y + size_y, node.size_x, excess_y, Some(index)),
            )
        };
        let child_a = self.alloc_node(a);
        let child_b = self.alloc_node(b);
        self.nodes[index].children = Some((child_a, child_b));

        self.add_surface(child_a, size_x, size_y, allow_enlargement)
    }

    fn alloc_node(&mut self, node: LayoutNode) -> usize {
        match self.free_nodes.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn is_free_leaf(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        node.children.is_none() && !node.used
    }

    /// Collapse parents whose children are both free leaves
    fn merge_free_siblings(&mut self, mut index: usize) {
        while let Some(parent) = self.nodes[index].parent {
            let Some((a, b)) = self.nodes[parent].children else {
                break;
            };
            if !self.is_free_leaf(a) || !self.is_free_leaf(b) {
                break;
            }
            self.nodes[parent].children = None;
            self.free_nodes.push(a);
            self.free_nodes.push(b);
            index = parent;
        }
    }

    fn recompute_used_size(&mut self) {
        let (mut used_x, mut used_y) = (self.min_size_x, self.min_size_y);
        for index in self.reachable_leaves() {
            let node = &self.nodes[index];
            if node.used {
                used_x = used_x.max(self.round_size(node.min_x + node.size_x));
                used_y = used_y.max(self.round_size(node.min_y + node.size_y));
            }
        }
        self.used_size_x = used_x;
        self.used_size_y = used_y;
    }

    fn reachable_leaves(&self) -> Vec<usize> {
        let mut leaves = Vec::new();
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            match self.nodes[index].children {
                Some((a, b)) => {
                    stack.push(b);
                    stack.push(a);
                }
                None => leaves.push(index),
            }
        }
        leaves
    }
}
