/*!
A miniature message-passing runtime for a fixed-size group of cooperating
processes launched on a single host.

The [`launcher`] (exposed as the `mpmrun` binary) forks N copies of a user
program with a complete mesh of anonymous pipes already wired into a fixed
descriptor layout, passes each worker its rank and the world size through
the environment, and collects exit statuses. Inside each worker, [`Mpm`]
provides:

* point-to-point byte messages with tag matching ([`Mpm::send`],
  [`Mpm::recv`]; tag [`TAG_ANY`] matches any tag on the receive side),
* a barrier, a broadcast and an element-wise byte reduction over an
  implicit binary tree ([`Mpm::barrier`], [`Mpm::broadcast`],
  [`Mpm::reduce`]),
* optional detection of symmetric receive/receive deadlocks
  ([`Mpm::init`] with `deadlock_detection = true`).

Every worker runs one receiver thread per peer. A receiver continuously
drains its peer's inbound pipe, demultiplexes control frames from user
messages, and rendezvous-matches payloads against the single blocking
receive on the main thread.

```no_run
use mpm::{Mpm, TAG_ANY};

let mut mpm = Mpm::init(false);
match mpm.world_rank() {
    0 => mpm.send(b"hello", 1, 7).unwrap(),
    1 => {
        let mut buf = [0u8; 5];
        mpm.recv(&mut buf, 0, TAG_ANY).unwrap();
    }
    _ => {}
}
mpm.barrier().unwrap();
mpm.finalize();
```

Operations never panic on bad peer input; they return a typed status
instead. A peer that has left the group surfaces as [`Error::PeerGone`],
both on its point-to-point channels and, via FINALIZE propagation along the
tree, in every later collective at every remaining rank.

Linux-only: the rendezvous wakeup is an eventfd in semaphore mode.
*/

mod chan;
mod engine;
mod frame;
mod group;
mod layout;
mod runtime;

pub mod launcher;

pub use frame::TAG_ANY;
pub use group::Op;
pub use layout::MAX_WORLD;
pub use runtime::{Mpm, ENV_RANK, ENV_WORLD_SIZE};

/// Why an operation did not complete. Success is plain `Ok(())`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The addressed peer, or some member of the group, has finalized.
    #[error("peer has already finalized")]
    PeerGone,
    /// Destination or source rank outside `[0, world_size)`.
    #[error("no such rank: {0}")]
    NoSuchRank(usize),
    /// Destination or source equals this process's own rank.
    #[error("cannot address own rank")]
    SelfOp,
    /// Deadlock detection proved a symmetric wait.
    #[error("symmetric wait detected")]
    Deadlock,
}

pub type Result<T> = std::result::Result<T, Error>;
