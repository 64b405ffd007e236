//! Overlay tree used for the shutdown fan-out

use crate::{Error, NodeIndex, Result};

/// n-ary tree over the roster, rooted at one participant
///
/// Nodes are laid out breadth first: the root first, then the other roster
/// entries in ascending order. Position `p` has children at positions
/// `p * branching + 1 ..= p * branching + branching`.
#[derive(Debug, Clone)]
pub struct Tree {
    root: NodeIndex,
    children: Vec<Vec<NodeIndex>>,
    parents: Vec<Option<NodeIndex>>,
}

impl Tree {
    /// Build a tree over `size` participants
    pub fn new(size: usize, root: NodeIndex, branching: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("tree cannot be empty".into()));
        }
        if root >= size {
            return Err(Error::InvalidConfig(format!(
                "root {} outside a roster of {}",
                root, size
            )));
        }
        if branching == 0 {
            return Err(Error::InvalidConfig("branching factor must be positive".into()));
        }

        let order: Vec<NodeIndex> = std::iter::once(root)
            .chain((0..size).filter(|idx| *idx != root))
            .collect();

        let mut children = vec![Vec::new(); size];
        let mut parents = vec![None; size];
        for (position, node) in order.iter().enumerate().skip(1) {
            let parent = order[(position - 1) / branching];
            children[parent].push(*node);
            parents[*node] = Some(parent);
        }

        Ok(Self {
            root,
            children,
            parents,
        })
    }

    /// Star topology: every node is a direct child of the root
    pub fn star(size: usize, root: NodeIndex) -> Result<Self> {
        Self::new(size, root, size.max(1))
    }

    /// Root participant
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Whether `node` is the root
    pub fn is_root(&self, node: NodeIndex) -> bool {
        node == self.root
    }

    /// Direct children of `node`
    pub fn children(&self, node: NodeIndex) -> &[NodeIndex] {
        self.children.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parent of `node`, `None` for the root
    pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.parents.get(node).copied().flatten()
    }

    /// Number of nodes
    pub fn size(&self) -> usize {
        self.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_tree() {
        let tree = Tree::new(7, 0, 2).unwrap();
        assert_eq!(tree.children(0), &[1, 2]);
        assert_eq!(tree.children(1), &[3, 4]);
        assert_eq!(tree.children(2), &[5, 6]);
        assert!(tree.children(6).is_empty());
        assert_eq!(tree.parent(5), Some(2));
        assert_eq!(tree.parent(0), None);
        assert_eq!(tree.size(), 7);
    }

    #[test]
    fn test_non_zero_root() {
        let tree = Tree::new(4, 2, 2).unwrap();
        assert!(tree.is_root(2));
        assert_eq!(tree.children(2), &[0, 1]);
        assert_eq!(tree.children(0), &[3]);
        assert!(tree.children(1).is_empty());
        assert_eq!(tree.parent(3), Some(0));
    }

    #[test]
    fn test_star() {
        let tree = Tree::star(4, 0).unwrap();
        assert_eq!(tree.children(0), &[1, 2, 3]);

        let single = Tree::star(1, 0).unwrap();
        assert!(single.children(0).is_empty());
    }

    #[test]
    fn test_invalid_trees() {
        assert!(Tree::new(0, 0, 2).is_err());
        assert!(Tree::new(3, 3, 2).is_err());
        assert!(Tree::new(3, 0, 0).is_err());
    }
}
