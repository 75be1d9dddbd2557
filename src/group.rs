//! Tree-structured collectives: barrier, broadcast and reduction, plus the
//! FINALIZE propagation that tears the group down once any participant
//! leaves.
//!
//! Every collective follows the same shape: gather a status byte (and, for
//! reduce, a payload) from each child, push an upward value to the parent,
//! read one downward status byte, fan it to the children. A FINALIZE byte
//! anywhere self-terminates the collective: no payload accompanies it, the
//! observer propagates the bare byte, closes the six tree descriptors and
//! reports `PeerGone`. EOF on a tree edge reads as FINALIZE.

use nix::unistd::close;

use crate::chan::{self, ReadOutcome};
use crate::frame::{ST_FINALIZE, ST_READY};
use crate::layout::{Edge, FdMap, Tree, GROUP_DATA_IN};
use crate::{Error, Result};

/// Element-wise reduction operators over unsigned bytes. `Sum` and `Prod`
/// wrap modulo 256.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Min,
    Max,
    Sum,
    Prod,
}

impl Op {
    fn apply(self, a: u8, b: u8) -> u8 {
        match self {
            Op::Min => a.min(b),
            Op::Max => a.max(b),
            Op::Sum => a.wrapping_add(b),
            Op::Prod => a.wrapping_mul(b),
        }
    }
}

/// Fold `other` into `acc`, element-wise.
fn combine(acc: &mut [u8], other: &[u8], op: Op) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a = op.apply(*a, *b);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Ready,
    Finalize,
}

fn read_status(edge: Edge) -> Status {
    let mut byte = [0u8; 1];
    match chan::recv_all(edge.rx, &mut byte) {
        ReadOutcome::Eof => Status::Finalize,
        ReadOutcome::Filled if byte[0] == ST_FINALIZE => Status::Finalize,
        ReadOutcome::Filled => Status::Ready,
    }
}

fn status_byte(status: Status) -> u8 {
    match status {
        Status::Ready => ST_READY,
        Status::Finalize => ST_FINALIZE,
    }
}

/// The collectives' slice of the tree. `links` is `None` once a FINALIZE
/// token has been observed or propagated and the descriptors are closed;
/// from then on every collective reports `PeerGone` immediately.
pub(crate) struct Group {
    fds: FdMap,
    links: Option<Tree>,
}

impl Group {
    pub fn new(fds: FdMap) -> Group {
        Group {
            fds,
            links: Some(Tree::for_rank(fds.rank, fds.world)),
        }
    }

    fn links(&self) -> Result<Tree> {
        self.links.ok_or(Error::PeerGone)
    }

    /// A child reported FINALIZE before the upward exchange: relay the
    /// token on every edge (the other child may still be blocked in its own
    /// upward wait) and drop the tree.
    fn abort_group(&mut self, tree: Tree) {
        for e in [tree.parent, tree.left, tree.right].into_iter().flatten() {
            let _ = chan::send_all(e.tx, &[ST_FINALIZE]);
        }
        self.close_edges(tree);
    }

    fn close_edges(&mut self, tree: Tree) {
        for e in [tree.parent, tree.left, tree.right].into_iter().flatten() {
            close(e.rx).expect("close tree inbound");
            close(e.tx).expect("close tree outbound");
        }
        self.links = None;
        log::debug!("rank {}: group channels torn down", self.fds.rank);
    }

    /// Finalize-time teardown: tell the neighbours we are leaving, if the
    /// group channels are still open.
    pub fn shut_down(&mut self) {
        if let Some(tree) = self.links {
            self.abort_group(tree);
        }
    }

    pub fn barrier(&mut self) -> Result<()> {
        let tree = self.links()?;

        let left = tree.left.map_or(Status::Ready, read_status);
        let right = tree.right.map_or(Status::Ready, read_status);
        if left == Status::Finalize || right == Status::Finalize {
            self.abort_group(tree);
            return Err(Error::PeerGone);
        }

        let mut down = Status::Ready;
        if let Some(p) = tree.parent {
            let _ = chan::send_all(p.tx, &[ST_READY]);
            down = read_status(p);
        }

        for e in [tree.left, tree.right].into_iter().flatten() {
            let _ = chan::send_all(e.tx, &[status_byte(down)]);
        }

        if down == Status::Finalize {
            self.close_edges(tree);
            return Err(Error::PeerGone);
        }
        Ok(())
    }

    /// The payload travels root-down along the tree; a non-zero-ranked
    /// source first unicasts it to rank 0 over the dedicated data channel.
    pub fn broadcast(&mut self, data: &mut [u8], root: usize) -> Result<()> {
        let tree = self.links()?;
        if root >= self.fds.world {
            return Err(Error::NoSuchRank(root));
        }

        let left = tree.left.map_or(Status::Ready, read_status);
        let right = tree.right.map_or(Status::Ready, read_status);
        if left == Status::Finalize || right == Status::Finalize {
            self.abort_group(tree);
            return Err(Error::PeerGone);
        }

        let mut payload = vec![0u8; data.len()];
        match tree.parent {
            None => {
                // Rank 0 sources the downward payload: its own buffer, or a
                // unicast from the broadcast origin.
                if root == self.fds.rank {
                    payload.copy_from_slice(data);
                } else {
                    let _ = chan::recv_all(GROUP_DATA_IN, &mut payload);
                }
            }
            Some(p) => {
                let _ = chan::send_all(p.tx, &[ST_READY]);
                if root == self.fds.rank {
                    let _ = chan::send_all(self.fds.group_data_out(0), data);
                }
                if read_status(p) == Status::Finalize {
                    for e in [tree.left, tree.right].into_iter().flatten() {
                        let _ = chan::send_all(e.tx, &[ST_FINALIZE]);
                    }
                    self.close_edges(tree);
                    return Err(Error::PeerGone);
                }
                let _ = chan::recv_all(p.rx, &mut payload);
            }
        }

        for e in [tree.left, tree.right].into_iter().flatten() {
            let _ = chan::send_all(e.tx, &[ST_READY]);
            let _ = chan::send_all(e.tx, &payload);
        }

        if root != self.fds.rank {
            data.copy_from_slice(&payload);
        }
        Ok(())
    }

    /// Upward combine over the tree; rank 0 then delivers the result to the
    /// destination, over the data channel if that is not rank 0 itself.
    pub fn reduce(&mut self, send: &[u8], recv: &mut [u8], op: Op, root: usize) -> Result<()> {
        let tree = self.links()?;
        if root >= self.fds.world {
            return Err(Error::NoSuchRank(root));
        }

        // Gather left then right: a status byte, then the child's partial
        // result when it is READY.
        let mut finalized = false;
        let mut inputs: [Option<Vec<u8>>; 2] = [None, None];
        for (slot, edge) in [tree.left, tree.right].into_iter().enumerate() {
            let Some(e) = edge else { continue };
            match read_status(e) {
                Status::Finalize => finalized = true,
                Status::Ready => {
                    let mut buf = vec![0u8; send.len()];
                    let _ = chan::recv_all(e.rx, &mut buf);
                    inputs[slot] = Some(buf);
                }
            }
        }
        if finalized {
            self.abort_group(tree);
            return Err(Error::PeerGone);
        }

        // Own input first, then left, then right. All four operators are
        // associative and commutative over bytes, so the order is
        // observational only.
        let mut acc = send.to_vec();
        for buf in inputs.into_iter().flatten() {
            combine(&mut acc, &buf, op);
        }

        let mut down = Status::Ready;
        if let Some(p) = tree.parent {
            let _ = chan::send_all(p.tx, &[ST_READY]);
            let _ = chan::send_all(p.tx, &acc);
            down = read_status(p);
        }

        for e in [tree.left, tree.right].into_iter().flatten() {
            let _ = chan::send_all(e.tx, &[status_byte(down)]);
        }

        if down == Status::Finalize {
            self.close_edges(tree);
            return Err(Error::PeerGone);
        }

        if self.fds.rank == 0 {
            if root == 0 {
                recv.copy_from_slice(&acc);
            } else {
                let _ = chan::send_all(self.fds.group_data_out(root), &acc);
            }
        } else if root == self.fds.rank {
            let _ = chan::recv_all(GROUP_DATA_IN, recv);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_over_bytes() {
        assert_eq!(Op::Min.apply(3, 250), 3);
        assert_eq!(Op::Max.apply(3, 250), 250);
        assert_eq!(Op::Sum.apply(200, 100), 44); // 300 mod 256
        assert_eq!(Op::Prod.apply(16, 17), 16); // 272 mod 256
    }

    #[test]
    fn combine_is_element_wise() {
        let mut acc = vec![1u8, 200, 255];
        combine(&mut acc, &[2, 100, 1], Op::Sum);
        assert_eq!(acc, vec![3, 44, 0]);

        let mut acc = vec![9u8, 4];
        combine(&mut acc, &[7, 6], Op::Min);
        assert_eq!(acc, vec![7, 4]);
    }

    #[test]
    fn singleton_world_collectives() {
        // No edges at all: the collectives complete locally.
        let mut group = Group::new(FdMap { rank: 0, world: 1 });
        assert_eq!(group.barrier(), Ok(()));

        let mut data = *b"solo";
        assert_eq!(group.broadcast(&mut data, 0), Ok(()));
        assert_eq!(&data, b"solo");

        let mut out = [0u8; 2];
        assert_eq!(group.reduce(&[7, 9], &mut out, Op::Max, 0), Ok(()));
        assert_eq!(out, [7, 9]);

        assert_eq!(group.broadcast(&mut data, 5), Err(Error::NoSuchRank(5)));

        // Once torn down, everything is PeerGone immediately.
        group.shut_down();
        assert_eq!(group.barrier(), Err(Error::PeerGone));
        assert_eq!(group.broadcast(&mut data, 0), Err(Error::PeerGone));
        assert_eq!(group.reduce(&[1], &mut [0u8; 1], Op::Sum, 0), Err(Error::PeerGone));
    }
}
