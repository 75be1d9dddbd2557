//! Scenario worker driven by the end-to-end tests: launched as
//! `mpmrun N mpm-worker <scenario>` and exits non-zero on any mismatch.

use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use mpm::{Error, Mpm, Op, TAG_ANY};

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    let scenario = args.get(1).map(String::as_str).unwrap_or("");
    match scenario {
        "noop" => noop(),
        "ping" => ping(),
        "anytag" => anytag(),
        "tagpick" => tagpick(),
        "peergone" => peergone(),
        "deadlock" => deadlock(),
        "hang" => hang(),
        "barrier" => barrier(),
        "bcast" => bcast(),
        "reduce" => reduce(),
        "reduce_ops" => reduce_ops(),
        "fifo" => fifo(),
        "pingpong" => pingpong(),
        "zerolen" => zerolen(),
        "bigmsg" => bigmsg(),
        "selfop" => selfop(),
        "collective_peergone" => collective_peergone(),
        other => {
            eprintln!("mpm-worker: unknown scenario {other:?}");
            exit(2);
        }
    }
}

fn noop() {
    let mpm = Mpm::init(true);
    mpm.finalize();
}

fn ping() {
    let mut mpm = Mpm::init(false);
    match mpm.world_rank() {
        0 => mpm.send(&[1, 2, 3], 1, 7).unwrap(),
        1 => {
            let mut buf = [0u8; 3];
            mpm.recv(&mut buf, 0, 7).unwrap();
            assert_eq!(buf, [1, 2, 3]);
        }
        _ => {}
    }
    mpm.finalize();
}

fn anytag() {
    let mut mpm = Mpm::init(false);
    match mpm.world_rank() {
        0 => {
            mpm.send(&[0xaa], 1, 5).unwrap();
            mpm.send(&[0xbb], 1, 9).unwrap();
        }
        1 => {
            let mut buf = [0u8; 1];
            mpm.recv(&mut buf, 0, TAG_ANY).unwrap();
            assert_eq!(buf, [0xaa]);
            mpm.recv(&mut buf, 0, TAG_ANY).unwrap();
            assert_eq!(buf, [0xbb]);
        }
        _ => {}
    }
    mpm.finalize();
}

/// Tag-specific receives take the first match, skipping earlier frames
/// with other tags.
fn tagpick() {
    let mut mpm = Mpm::init(false);
    match mpm.world_rank() {
        0 => {
            mpm.send(&[0x0a], 1, 5).unwrap();
            mpm.send(&[0x0b], 1, 9).unwrap();
        }
        1 => {
            let mut buf = [0u8; 1];
            mpm.recv(&mut buf, 0, 9).unwrap();
            assert_eq!(buf, [0x0b]);
            mpm.recv(&mut buf, 0, 5).unwrap();
            assert_eq!(buf, [0x0a]);
        }
        _ => unreachable!(),
    }
    mpm.finalize();
}

fn peergone() {
    let mut mpm = Mpm::init(false);
    if mpm.world_rank() == 1 {
        let mut buf = [0u8; 1];
        assert_eq!(mpm.recv(&mut buf, 0, TAG_ANY), Err(Error::PeerGone));
    }
    mpm.finalize();
}

fn deadlock() {
    let mut mpm = Mpm::init(true);
    let rank = mpm.world_rank();
    if rank < 2 {
        let mut buf = [0u8; 1];
        assert_eq!(mpm.recv(&mut buf, 1 - rank, TAG_ANY), Err(Error::Deadlock));
    }
    mpm.finalize();
}

/// Symmetric waits with detection off. Staying blocked is the expected
/// outcome; a watchdog reports it with a distinctive exit code.
fn hang() {
    let mut mpm = Mpm::init(false);
    let rank = mpm.world_rank();
    thread::spawn(|| {
        thread::sleep(Duration::from_secs(3));
        exit(42);
    });
    let mut buf = [0u8; 1];
    let _ = mpm.recv(&mut buf, 1 - rank, TAG_ANY);
    // The wait resolved; without detection it should not have.
    exit(0);
}

fn barrier() {
    let mut mpm = Mpm::init(false);
    let start = Instant::now();
    if mpm.world_rank() == 0 {
        thread::sleep(Duration::from_millis(300));
    }
    mpm.barrier().unwrap();
    if mpm.world_rank() != 0 {
        assert!(
            start.elapsed() >= Duration::from_millis(200),
            "barrier returned before every rank arrived"
        );
    }
    // A second barrier reuses the same edges.
    mpm.barrier().unwrap();
    mpm.finalize();
}

fn bcast() {
    let mut mpm = Mpm::init(false);
    let mut buf = if mpm.world_rank() == 2 {
        [0xde, 0xad, 0xbe, 0xef]
    } else {
        [0u8; 4]
    };
    mpm.broadcast(&mut buf, 2).unwrap();
    assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
    mpm.finalize();
}

fn reduce() {
    let mut mpm = Mpm::init(false);
    let r = mpm.world_rank() as u8;
    let send = [2 * r + 1, 2 * r + 2];
    let mut out = [0u8; 2];
    mpm.reduce(&send, &mut out, Op::Sum, 1).unwrap();
    if mpm.world_rank() == 1 {
        assert_eq!(out, [16, 20]);
    } else {
        assert_eq!(out, [0, 0], "non-destination buffers must be untouched");
    }
    mpm.finalize();
}

fn reduce_ops() {
    let mut mpm = Mpm::init(false);
    let r = mpm.world_rank() as u8;
    let send = [3 * r + 1, 3 * r + 2, 250];
    let cases: [(Op, usize, [u8; 3]); 4] = [
        (Op::Min, 0, [1, 2, 250]),
        (Op::Max, 1, [7, 8, 250]),
        (Op::Sum, 2, [12, 15, 238]),
        (Op::Prod, 0, [28, 80, 40]),
    ];
    for (op, root, expect) in cases {
        let mut out = [0u8; 3];
        mpm.reduce(&send, &mut out, op, root).unwrap();
        if mpm.world_rank() == root {
            assert_eq!(out, expect, "{op:?} at destination {root}");
        }
    }
    mpm.finalize();
}

fn fifo() {
    let mut mpm = Mpm::init(false);
    match mpm.world_rank() {
        0 => {
            for seq in 0..200u32 {
                let tag = 1 + (seq % 7) as i32;
                mpm.send(&seq.to_ne_bytes(), 1, tag).unwrap();
            }
        }
        1 => {
            for seq in 0..200u32 {
                let mut buf = [0u8; 4];
                mpm.recv(&mut buf, 0, TAG_ANY).unwrap();
                assert_eq!(u32::from_ne_bytes(buf), seq, "delivery must follow pipe order");
            }
        }
        _ => unreachable!(),
    }
    mpm.finalize();
}

fn pingpong() {
    let mut mpm = Mpm::init(false);
    let rank = mpm.world_rank();
    let peer = 1 - rank;
    let mut ball = [0u8; 8];
    for round in 0..50u8 {
        let tag = i32::from(round) + 1;
        if rank == 0 {
            ball = [round; 8];
            mpm.send(&ball, peer, tag).unwrap();
            mpm.recv(&mut ball, peer, tag).unwrap();
            assert_eq!(ball, [round ^ 0xff; 8]);
        } else {
            mpm.recv(&mut ball, peer, tag).unwrap();
            assert_eq!(ball, [round; 8]);
            ball = [round ^ 0xff; 8];
            mpm.send(&ball, peer, tag).unwrap();
        }
    }
    mpm.finalize();
}

fn zerolen() {
    let mut mpm = Mpm::init(false);
    let mut empty = [0u8; 0];
    match mpm.world_rank() {
        0 => mpm.send(&empty, 1, 3).unwrap(),
        1 => mpm.recv(&mut empty, 0, 3).unwrap(),
        _ => unreachable!(),
    }
    mpm.broadcast(&mut empty, 0).unwrap();
    mpm.finalize();
}

fn bigmsg() {
    let mut mpm = Mpm::init(false);
    const N: usize = 1 << 20;
    match mpm.world_rank() {
        0 => {
            let payload: Vec<u8> = (0..N).map(|i| (i % 251) as u8).collect();
            mpm.send(&payload, 1, 1).unwrap();
        }
        1 => {
            let mut buf = vec![0u8; N];
            mpm.recv(&mut buf, 0, 1).unwrap();
            assert!(buf.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
        }
        _ => unreachable!(),
    }
    mpm.finalize();
}

fn selfop() {
    let mut mpm = Mpm::init(false);
    let rank = mpm.world_rank();
    let mut buf = [0u8; 1];
    assert_eq!(mpm.send(&[0], rank, 1), Err(Error::SelfOp));
    assert_eq!(mpm.recv(&mut buf, rank, TAG_ANY), Err(Error::SelfOp));
    assert_eq!(mpm.send(&[1], 5, 1), Err(Error::NoSuchRank(5)));
    assert_eq!(mpm.recv(&mut buf, 9, TAG_ANY), Err(Error::NoSuchRank(9)));
    assert_eq!(mpm.broadcast(&mut buf, 7), Err(Error::NoSuchRank(7)));
    let mut out = [0u8; 1];
    assert_eq!(mpm.reduce(&[1], &mut out, Op::Sum, 7), Err(Error::NoSuchRank(7)));
    mpm.barrier().unwrap();
    mpm.finalize();
}

fn collective_peergone() {
    let mut mpm = Mpm::init(false);
    if mpm.world_rank() == 0 {
        mpm.finalize();
        return;
    }
    assert_eq!(mpm.barrier(), Err(Error::PeerGone));
    // The group flag is down; every later collective fails immediately.
    let mut buf = [0u8; 2];
    assert_eq!(mpm.broadcast(&mut buf, 0), Err(Error::PeerGone));
    assert_eq!(mpm.reduce(&[1, 2], &mut buf, Op::Sum, 0), Err(Error::PeerGone));
    mpm.finalize();
}
