//! The point-to-point core: per-peer receiver threads, the rendezvous match
//! engine, and the pairwise deadlock protocol piggybacked on the same pipes.
//!
//! One mutex guards all shared state; one eventfd semaphore gates the main
//! thread's blocking receive. Receiver threads are the only writers of the
//! buffered queues and the only readers of the inbound pipes; the main
//! thread is the only party that installs or takes the pending-wait record.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::unistd::close;

use crate::chan::{self, ReadOutcome, Wakeup};
use crate::frame::{Header, TAG_ABORT, TAG_HINT};
use crate::layout::FdMap;
use crate::{Error, Result};

/// One buffered inbound message. The queue owns the payload until a match
/// transfers it out.
struct Envelope {
    header: Header,
    data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Unset,
    Delivered,
    PeerGone,
    Deadlock,
}

/// The singleton blocking-receive record. A matching receiver thread parks
/// the payload in `data` and posts the semaphore; the main thread copies it
/// out after waking.
struct PendingWait {
    peer: usize,
    count: i32,
    tag: i32,
    outcome: Outcome,
    data: Option<Vec<u8>>,
}

struct MatchState {
    /// Per source peer, pipe-ordered. Cross-peer order is unconstrained.
    queues: Vec<VecDeque<Envelope>>,
    /// Per destination peer: sends not yet known to be consumed. Deadlock
    /// mode only.
    sent: Vec<Vec<Header>>,
    /// Per peer: the latest unmatched HINT. Newest wins.
    hints: Vec<Option<Header>>,
    pending: Option<PendingWait>,
    /// True until EOF is seen on that peer's inbound pipe.
    alive: Vec<bool>,
}

impl MatchState {
    fn new(world: usize) -> MatchState {
        MatchState {
            queues: (0..world).map(|_| VecDeque::new()).collect(),
            sent: vec![Vec::new(); world],
            hints: vec![None; world],
            pending: None,
            alive: vec![true; world],
        }
    }

    /// Head-to-tail scan of one peer's queue for the first frame matching
    /// `(dst.len(), tag)`. On a hit the payload is copied out and the node
    /// released.
    fn take_buffered(&mut self, dst: &mut [u8], peer: usize, tag: i32) -> bool {
        let wanted = dst.len() as i32;
        let queue = &mut self.queues[peer];
        match queue.iter().position(|e| e.header.matches(wanted, tag)) {
            Some(at) => {
                let env = queue.remove(at).expect("scanned position exists");
                dst.copy_from_slice(&env.data);
                true
            }
            None => false,
        }
    }

    /// Drop a single digest entry equal to `wanted`, if one exists.
    fn remove_sent(&mut self, peer: usize, wanted: Header) -> bool {
        match self.sent[peer].iter().position(|h| *h == wanted) {
            Some(at) => {
                self.sent[peer].remove(at);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct Shared {
    pub rank: usize,
    pub world: usize,
    pub deadlock: bool,
    state: Mutex<MatchState>,
    wake: Wakeup,
}

impl Shared {
    pub fn new(rank: usize, world: usize, deadlock: bool) -> Shared {
        Shared {
            rank,
            world,
            deadlock,
            state: Mutex::new(MatchState::new(world)),
            wake: Wakeup::new(),
        }
    }
}

/// Spawn one receiver per peer, each owning that peer's inbound pipe.
pub(crate) fn spawn_receivers(shared: &Arc<Shared>, fds: &FdMap) -> Vec<JoinHandle<()>> {
    (0..shared.world)
        .filter(|&peer| peer != shared.rank)
        .map(|peer| {
            let shared = Arc::clone(shared);
            let fd = fds.p2p_in(peer);
            thread::Builder::new()
                .name(format!("mpm-recv-{peer}"))
                .spawn(move || receiver(&shared, peer, fd))
                .expect("spawn receiver thread")
        })
        .collect()
}

/// Drain one peer's inbound pipe until EOF: parse each frame header and
/// hand user payloads to the match engine, control frames to the deadlock
/// protocol.
fn receiver(shared: &Shared, peer: usize, fd: RawFd) {
    loop {
        let mut head = [0u8; Header::LEN];
        if chan::recv_all(fd, &mut head) == ReadOutcome::Eof {
            break;
        }
        let header = Header::decode(&head);
        match header.tag {
            TAG_HINT => {
                let mut want = [0u8; Header::LEN];
                if chan::recv_all(fd, &mut want) == ReadOutcome::Eof {
                    break;
                }
                on_hint(shared, peer, Header::decode(&want));
            }
            TAG_ABORT => on_abort(shared, peer),
            _ => {
                let count = usize::try_from(header.count).expect("negative frame length");
                let mut data = vec![0u8; count];
                if chan::recv_all(fd, &mut data) == ReadOutcome::Eof {
                    break;
                }
                dispatch(shared, peer, header, data);
            }
        }
    }

    // EOF: the peer closed its outbound side, i.e. it has finalized.
    let mut st = shared.state.lock().unwrap();
    st.alive[peer] = false;
    if let Some(w) = st.pending.as_mut() {
        if w.outcome == Outcome::Unset && w.peer == peer {
            w.outcome = Outcome::PeerGone;
            shared.wake.post();
        }
    }
    drop(st);
    close(fd).expect("close p2p inbound");
    log::trace!("receiver for peer {peer} exiting");
}

/// The peer announced a blocking wait for `wanted`.
fn on_hint(shared: &Shared, peer: usize, wanted: Header) {
    let mut st = shared.state.lock().unwrap();
    if st.remove_sent(peer, wanted) {
        // An earlier send of ours will satisfy that wait; the hint is
        // obsolete.
        return;
    }
    match st.pending.as_mut() {
        Some(w) if w.outcome == Outcome::Unset && w.peer == peer => {
            // Both sides hold unsatisfiable waits on each other.
            log::debug!("symmetric wait with peer {peer} proved by inbound hint");
            w.outcome = Outcome::Deadlock;
            shared.wake.post();
        }
        _ => st.hints[peer] = Some(wanted),
    }
}

/// The peer decided our announced wait can never be satisfied.
fn on_abort(shared: &Shared, peer: usize) {
    let mut st = shared.state.lock().unwrap();
    match st.pending.as_mut() {
        Some(w) if w.outcome == Outcome::Unset => {
            log::debug!("wait aborted by peer {peer}");
            w.outcome = Outcome::Deadlock;
            shared.wake.post();
        }
        _ => {} // no wait to release
    }
}

/// A complete user frame arrived: rendezvous with the pending wait if it
/// matches, otherwise buffer in pipe order.
fn dispatch(shared: &Shared, peer: usize, header: Header, data: Vec<u8>) {
    let mut st = shared.state.lock().unwrap();
    if let Some(w) = st.pending.as_mut() {
        if w.outcome == Outcome::Unset && w.peer == peer && header.matches(w.count, w.tag) {
            w.data = Some(data);
            w.outcome = Outcome::Delivered;
            shared.wake.post();
            return;
        }
    }
    st.queues[peer].push_back(Envelope { header, data });
}

/// Blocking receive on the main thread: consume a buffered match, or
/// install the pending-wait record and sleep on the semaphore until a
/// receiver thread settles it.
pub(crate) fn recv_blocking(
    shared: &Shared,
    out_fd: RawFd,
    dst: &mut [u8],
    peer: usize,
    tag: i32,
) -> Result<()> {
    let mut st = shared.state.lock().unwrap();
    debug_assert!(st.pending.is_none(), "blocking receives are serialized");

    if st.take_buffered(dst, peer, tag) {
        return Ok(());
    }

    if shared.deadlock && st.hints[peer].take().is_some() {
        // The peer announced a wait we will never satisfy, and we are about
        // to block on that peer in turn: a symmetric wait. Unblock the peer
        // before reporting.
        let peer_alive = st.alive[peer];
        drop(st);
        if peer_alive {
            let _ = chan::send_all(out_fd, &Header { count: 0, tag: TAG_ABORT }.encode());
        }
        log::debug!("symmetric wait with peer {peer} proved by stored hint");
        return Err(Error::Deadlock);
    }

    if !st.alive[peer] {
        return Err(Error::PeerGone);
    }

    let count = dst.len() as i32;
    st.pending = Some(PendingWait {
        peer,
        count,
        tag,
        outcome: Outcome::Unset,
        data: None,
    });
    drop(st);

    if shared.deadlock {
        // Announce the wait so the peer can check it against its digest of
        // unconsumed sends. Failures here mean the peer is gone; its EOF
        // will wake us.
        let _ = chan::send_all(out_fd, &Header { count: Header::LEN as i32, tag: TAG_HINT }.encode());
        let _ = chan::send_all(out_fd, &Header { count, tag }.encode());
    }

    shared.wake.wait();

    let mut st = shared.state.lock().unwrap();
    let wait = st.pending.take().expect("woken without a pending wait");
    drop(st);
    match wait.outcome {
        Outcome::Delivered => {
            dst.copy_from_slice(&wait.data.expect("delivered without payload"));
            Ok(())
        }
        Outcome::PeerGone => Err(Error::PeerGone),
        Outcome::Deadlock => Err(Error::Deadlock),
        Outcome::Unset => unreachable!("woken with no outcome"),
    }
}

/// Send one framed message. In deadlock mode the frame is recorded in the
/// per-destination digest, unless the destination already announced a
/// matching wait, in which case that hint is consumed instead.
pub(crate) fn send(
    shared: &Shared,
    out_fd: RawFd,
    data: &[u8],
    dest: usize,
    tag: i32,
) -> Result<()> {
    let count = i32::try_from(data.len()).expect("payload too large for frame header");
    let header = Header { count, tag };

    if shared.deadlock {
        let mut st = shared.state.lock().unwrap();
        if !st.alive[dest] {
            return Err(Error::PeerGone);
        }
        if st.hints[dest] == Some(header) {
            st.hints[dest] = None;
        } else {
            st.sent[dest].push(header);
        }
    }

    chan::send_all(out_fd, &header.encode())?;
    chan::send_all(out_fd, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TAG_ANY;
    use rand::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn envelope(count: i32, tag: i32, fill: u8) -> (Header, Vec<u8>) {
        (Header { count, tag }, vec![fill; count as usize])
    }

    #[test]
    fn buffered_first_match_discriminates_count_and_tag() {
        let shared = Shared::new(0, 2, false);
        for (count, tag, fill) in [(2, 5, 0xaa), (1, 5, 0xbb), (1, 9, 0xcc)] {
            let (h, d) = envelope(count, tag, fill);
            dispatch(&shared, 1, h, d);
        }

        let mut st = shared.state.lock().unwrap();
        // Wrong size skipped, first (1, any) match is the 0xbb frame.
        let mut one = [0u8; 1];
        assert!(st.take_buffered(&mut one, 1, TAG_ANY));
        assert_eq!(one, [0xbb]);
        // Tag-specific take skips non-matching tags.
        assert!(st.take_buffered(&mut one, 1, 9));
        assert_eq!(one, [0xcc]);
        let mut two = [0u8; 2];
        assert!(st.take_buffered(&mut two, 1, 5));
        assert_eq!(two, [0xaa, 0xaa]);
        assert!(!st.take_buffered(&mut one, 1, TAG_ANY));
    }

    #[test]
    fn per_source_fifo_under_bursts() {
        let shared = Shared::new(0, 2, false);
        let mut rng = rand::thread_rng();
        for seq in 0..100u8 {
            let tag = rng.gen_range(1..5);
            dispatch(&shared, 1, Header { count: 1, tag }, vec![seq]);
        }
        let mut st = shared.state.lock().unwrap();
        for seq in 0..100u8 {
            let mut buf = [0u8; 1];
            assert!(st.take_buffered(&mut buf, 1, TAG_ANY));
            assert_eq!(buf[0], seq, "any-tag takes must preserve pipe order");
        }
    }

    #[test]
    fn rendezvous_wakes_blocking_receive() {
        let shared = Arc::new(Shared::new(0, 2, false));
        let arrived = Arc::clone(&shared);
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            dispatch(&arrived, 1, Header { count: 3, tag: 7 }, vec![1, 2, 3]);
        });

        let mut buf = [0u8; 3];
        recv_blocking(&shared, -1, &mut buf, 1, 7).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        sender.join().unwrap();
        // The record does not outlive the wake.
        assert!(shared.state.lock().unwrap().pending.is_none());
    }

    #[test]
    fn eof_wakes_blocking_receive_with_peer_gone() {
        let shared = Arc::new(Shared::new(0, 2, false));
        let closer = Arc::clone(&shared);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut st = closer.state.lock().unwrap();
            st.alive[1] = false;
            if let Some(w) = st.pending.as_mut() {
                if w.outcome == Outcome::Unset && w.peer == 1 {
                    w.outcome = Outcome::PeerGone;
                    closer.wake.post();
                }
            }
        });

        let mut buf = [0u8; 1];
        assert_eq!(recv_blocking(&shared, -1, &mut buf, 1, TAG_ANY), Err(Error::PeerGone));
        t.join().unwrap();
    }

    #[test]
    fn hint_against_digest_is_consumed_silently() {
        let shared = Shared::new(0, 2, true);
        let sent = Header { count: 4, tag: 3 };
        shared.state.lock().unwrap().sent[1].push(sent);

        on_hint(&shared, 1, sent);
        let st = shared.state.lock().unwrap();
        assert!(st.sent[1].is_empty());
        assert!(st.hints[1].is_none());
    }

    #[test]
    fn unmatched_hint_is_stored_newest_wins() {
        let shared = Shared::new(0, 2, true);
        on_hint(&shared, 1, Header { count: 1, tag: 4 });
        on_hint(&shared, 1, Header { count: 2, tag: 6 });
        let st = shared.state.lock().unwrap();
        assert_eq!(st.hints[1], Some(Header { count: 2, tag: 6 }));
    }

    #[test]
    fn remove_sent_takes_exactly_one_entry() {
        let mut st = MatchState::new(2);
        let h = Header { count: 1, tag: 2 };
        st.sent[1].push(h);
        st.sent[1].push(Header { count: 9, tag: 9 });
        st.sent[1].push(h);
        assert!(st.remove_sent(1, h));
        assert_eq!(st.sent[1], vec![Header { count: 9, tag: 9 }, h]);
        assert!(st.remove_sent(1, h));
        assert!(!st.remove_sent(1, h));
        assert_eq!(st.sent[1], vec![Header { count: 9, tag: 9 }]);
    }

    #[test]
    fn inbound_hint_against_pending_wait_is_a_deadlock() {
        let shared = Arc::new(Shared::new(0, 2, true));
        let (rx, tx) = nix::unistd::pipe().unwrap();

        let hinter = Arc::clone(&shared);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            on_hint(&hinter, 1, Header { count: 1, tag: 1 });
        });

        let mut buf = [0u8; 1];
        assert_eq!(recv_blocking(&shared, tx, &mut buf, 1, TAG_ANY), Err(Error::Deadlock));
        t.join().unwrap();
        let _ = close(rx);
        let _ = close(tx);
    }

    #[test]
    fn stored_hint_fails_the_next_receive_and_aborts_the_peer() {
        let shared = Shared::new(0, 2, true);
        on_hint(&shared, 1, Header { count: 1, tag: 1 });

        let (rx, tx) = nix::unistd::pipe().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(recv_blocking(&shared, tx, &mut buf, 1, TAG_ANY), Err(Error::Deadlock));
        // The slot is consumed and an ABORT frame went out on the pipe.
        assert!(shared.state.lock().unwrap().hints[1].is_none());
        let mut head = [0u8; Header::LEN];
        assert_eq!(chan::recv_all(rx, &mut head), ReadOutcome::Filled);
        assert_eq!(Header::decode(&head).tag, TAG_ABORT);
        let _ = close(rx);
        let _ = close(tx);
    }

    #[test]
    fn send_consumes_matching_hint_instead_of_recording() {
        let shared = Shared::new(0, 2, true);
        on_hint(&shared, 1, Header { count: 2, tag: 8 });

        let (rx, tx) = nix::unistd::pipe().unwrap();
        send(&shared, tx, &[0xde, 0xad], 1, 8).unwrap();
        {
            let st = shared.state.lock().unwrap();
            assert!(st.hints[1].is_none());
            assert!(st.sent[1].is_empty(), "satisfied hint must not queue a digest");
        }

        // A second identical send has no hint to consume and is recorded.
        send(&shared, tx, &[0xbe, 0xef], 1, 8).unwrap();
        assert_eq!(shared.state.lock().unwrap().sent[1], vec![Header { count: 2, tag: 8 }]);
        let _ = close(rx);
        let _ = close(tx);
    }
}
