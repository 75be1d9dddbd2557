//! Worker lifecycle and the public entry points.

use std::env;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::close;

use crate::engine::{self, Shared};
use crate::group::{Group, Op};
use crate::layout::{FdMap, GROUP_DATA_IN, MAX_WORLD};
use crate::Result;

/// Environment value carrying the world size, launcher to worker.
pub const ENV_WORLD_SIZE: &str = "MPM_WORLD_SIZE";
/// Environment value carrying this worker's rank, launcher to worker.
pub const ENV_RANK: &str = "MPM_RANK";

/// The per-process runtime. Exactly one per worker; every library
/// operation goes through it, and `&mut self` serializes the blocking
/// receives by construction.
pub struct Mpm {
    shared: Arc<Shared>,
    fds: FdMap,
    group: Group,
    receivers: Vec<JoinHandle<()>>,
}

impl Mpm {
    /// Read the launcher-provided environment (and clear it, so user code
    /// cannot observe it), wire the endpoint table and spawn one receiver
    /// thread per peer.
    ///
    /// With `deadlock_detection` enabled, blocking receives announce
    /// themselves to the addressed peer and symmetric receive/receive
    /// waits fail with [`crate::Error::Deadlock`] on both sides.
    pub fn init(deadlock_detection: bool) -> Mpm {
        let world: usize = env::var(ENV_WORLD_SIZE)
            .expect("MPM_WORLD_SIZE not set; workers must be started by mpmrun")
            .parse()
            .expect("MPM_WORLD_SIZE is not a decimal integer");
        let rank: usize = env::var(ENV_RANK)
            .expect("MPM_RANK not set; workers must be started by mpmrun")
            .parse()
            .expect("MPM_RANK is not a decimal integer");
        env::remove_var(ENV_WORLD_SIZE);
        env::remove_var(ENV_RANK);
        assert!(
            (1..=MAX_WORLD).contains(&world) && rank < world,
            "inconsistent world geometry: rank {rank} of {world}"
        );

        // A peer that already left must surface as EPIPE, not SIGPIPE.
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.expect("ignore SIGPIPE");

        let fds = FdMap { rank, world };
        let shared = Arc::new(Shared::new(rank, world, deadlock_detection));
        let receivers = engine::spawn_receivers(&shared, &fds);
        log::debug!(
            "rank {rank}/{world} up, {} receivers, deadlock detection {}",
            receivers.len(),
            if deadlock_detection { "on" } else { "off" }
        );
        Mpm {
            shared,
            fds,
            group: Group::new(fds),
            receivers,
        }
    }

    pub fn world_size(&self) -> usize {
        self.shared.world
    }

    pub fn world_rank(&self) -> usize {
        self.shared.rank
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer == self.shared.rank {
            return Err(crate::Error::SelfOp);
        }
        if peer >= self.shared.world {
            return Err(crate::Error::NoSuchRank(peer));
        }
        Ok(())
    }

    /// Send `data` to `dest` with `tag`. Never blocks on the receiver
    /// having posted a matching receive.
    pub fn send(&mut self, data: &[u8], dest: usize, tag: i32) -> Result<()> {
        self.check_peer(dest)?;
        engine::send(&self.shared, self.fds.p2p_out(dest), data, dest, tag)
    }

    /// Receive exactly `data.len()` bytes from `source`. `tag` of
    /// [`crate::TAG_ANY`] accepts any tag; matching is by byte count and
    /// tag, first match in pipe order. Blocks until a matching message,
    /// the peer's departure, or a deadlock verdict.
    pub fn recv(&mut self, data: &mut [u8], source: usize, tag: i32) -> Result<()> {
        self.check_peer(source)?;
        engine::recv_blocking(&self.shared, self.fds.p2p_out(source), data, source, tag)
    }

    /// Block until every rank has entered the barrier.
    pub fn barrier(&mut self) -> Result<()> {
        self.group.barrier()
    }

    /// Distribute `root`'s buffer to every rank's buffer.
    pub fn broadcast(&mut self, data: &mut [u8], root: usize) -> Result<()> {
        self.group.broadcast(data, root)
    }

    /// Element-wise reduction of every rank's `send` buffer into `root`'s
    /// `recv` buffer. Other ranks' `recv` buffers are left untouched.
    pub fn reduce(&mut self, send: &[u8], recv: &mut [u8], op: Op, root: usize) -> Result<()> {
        assert_eq!(send.len(), recv.len(), "reduce buffers must have equal length");
        self.group.reduce(send, recv, op, root)
    }

    /// Orderly shutdown. Closing our p2p outbound side is the EOF each
    /// peer's receiver is waiting for; joining our own receivers therefore
    /// blocks until every peer has finalized too. Consumes the handle; all
    /// queues, digests and the semaphore are reclaimed here.
    pub fn finalize(mut self) {
        for peer in (0..self.shared.world).filter(|&p| p != self.shared.rank) {
            close(self.fds.p2p_out(peer)).expect("close p2p outbound");
        }

        self.group.shut_down();

        close(GROUP_DATA_IN).expect("close group data inbound");
        for peer in (0..self.shared.world).filter(|&p| p != self.shared.rank) {
            close(self.fds.group_data_out(peer)).expect("close group data outbound");
        }

        for th in self.receivers.drain(..) {
            th.join().expect("receiver thread panicked");
        }
        log::debug!("rank {} finalized", self.shared.rank);
    }
}
