//! The numbered descriptor layout agreed between the launcher and every
//! worker, and the implicit heap tree used by the collectives.
//!
//! The p2p block starts just above stderr and scales with the world size;
//! the tree and group-data descriptors are fixed constants placed above the
//! largest possible p2p block so the two regions can never overlap.

use std::os::unix::io::RawFd;

/// Hard cap on the group size; the descriptor table is sized for it.
pub const MAX_WORLD: usize = 16;

/// First descriptor of the p2p block.
pub(crate) const P2P_FD0: RawFd = 3;

// Six tree descriptors, one pair per edge as seen from this node.
pub(crate) const TREE_PARENT_IN: RawFd = 33;
pub(crate) const TREE_PARENT_OUT: RawFd = 34;
pub(crate) const TREE_LEFT_IN: RawFd = 35;
pub(crate) const TREE_LEFT_OUT: RawFd = 36;
pub(crate) const TREE_RIGHT_IN: RawFd = 37;
pub(crate) const TREE_RIGHT_OUT: RawFd = 38;

/// Unicast fan-in shared by the broadcast-source and reduce-sink paths.
pub(crate) const GROUP_DATA_IN: RawFd = 39;
/// First of the `W-1` unicast fan-out descriptors, packed by destination.
pub(crate) const GROUP_DATA_OUT0: RawFd = 40;

/// Launcher-side floor for raw pipe ends. Originals are raised here at
/// creation so the child's `dup2` renumbering cannot clobber one.
pub(crate) const RAISE_FLOOR: RawFd = 64;

/// Peer index with the owning rank skipped.
fn pack(rank: usize, peer: usize) -> RawFd {
    debug_assert_ne!(rank, peer);
    if peer < rank {
        peer as RawFd
    } else {
        peer as RawFd - 1
    }
}

/// Descriptor arithmetic for one worker.
#[derive(Clone, Copy)]
pub(crate) struct FdMap {
    pub rank: usize,
    pub world: usize,
}

impl FdMap {
    pub fn p2p_in(&self, peer: usize) -> RawFd {
        P2P_FD0 + pack(self.rank, peer)
    }

    pub fn p2p_out(&self, peer: usize) -> RawFd {
        P2P_FD0 + self.world as RawFd - 1 + pack(self.rank, peer)
    }

    pub fn group_data_out(&self, dest: usize) -> RawFd {
        GROUP_DATA_OUT0 + pack(self.rank, dest)
    }
}

/// One tree edge as seen from this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Edge {
    pub rx: RawFd,
    pub tx: RawFd,
}

/// This node's slice of the 1-based heap over ranks: parent ⌊(rank+1)/2⌋,
/// children 2(rank+1) and 2(rank+1)+1, all as heap positions.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Tree {
    pub parent: Option<Edge>,
    pub left: Option<Edge>,
    pub right: Option<Edge>,
}

impl Tree {
    pub fn for_rank(rank: usize, world: usize) -> Tree {
        let pos = rank + 1;
        Tree {
            parent: (pos >= 2).then_some(Edge {
                rx: TREE_PARENT_IN,
                tx: TREE_PARENT_OUT,
            }),
            left: (pos * 2 <= world).then_some(Edge {
                rx: TREE_LEFT_IN,
                tx: TREE_LEFT_OUT,
            }),
            right: (pos * 2 + 1 <= world).then_some(Edge {
                rx: TREE_RIGHT_IN,
                tx: TREE_RIGHT_OUT,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_skips_self() {
        let fds = FdMap { rank: 2, world: 4 };
        assert_eq!(fds.p2p_in(0), P2P_FD0);
        assert_eq!(fds.p2p_in(1), P2P_FD0 + 1);
        assert_eq!(fds.p2p_in(3), P2P_FD0 + 2);
        // Outbound block starts right after the W-1 inbound slots.
        assert_eq!(fds.p2p_out(0), P2P_FD0 + 3);
        assert_eq!(fds.p2p_out(3), P2P_FD0 + 5);
    }

    #[test]
    fn regions_disjoint_at_max_world() {
        let fds = FdMap {
            rank: 0,
            world: MAX_WORLD,
        };
        let last_p2p = fds.p2p_out(MAX_WORLD - 1);
        assert!(last_p2p < TREE_PARENT_IN);
        let last_data = fds.group_data_out(MAX_WORLD - 1);
        assert!(last_data < RAISE_FLOOR);
    }

    #[test]
    fn tree_shape() {
        // Singleton world: no edges at all.
        let t = Tree::for_rank(0, 1);
        assert!(t.parent.is_none() && t.left.is_none() && t.right.is_none());

        // W=4: rank 0 has children at positions 2 and 3; rank 1 has a
        // parent and one left child (position 4); rank 3 is a leaf.
        let t = Tree::for_rank(0, 4);
        assert!(t.parent.is_none() && t.left.is_some() && t.right.is_some());
        let t = Tree::for_rank(1, 4);
        assert!(t.parent.is_some() && t.left.is_some() && t.right.is_none());
        let t = Tree::for_rank(3, 4);
        assert!(t.parent.is_some() && t.left.is_none() && t.right.is_none());
    }
}
