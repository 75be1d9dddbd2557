//! Byte-channel primitives shared by the p2p runtime and the tree engine.
//!
//! Callers above this module never see a partial transfer: a send either
//! writes the whole buffer or reports the peer gone, a receive either fills
//! the whole buffer or reports end-of-stream. Anything the kernel throws at
//! us other than `EPIPE`, EOF and `EINTR`/`EAGAIN` is unrecoverable and
//! aborts the process.

use std::os::unix::io::RawFd;

use byteorder::{ByteOrder, NativeEndian};
use nix::errno::Errno;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Filled,
    Eof,
}

pub(crate) fn fatal(what: &str, err: Errno) -> ! {
    log::error!("unrecoverable channel failure: {what}: {err}");
    std::process::abort();
}

/// Write the whole buffer, or report the peer gone on a broken pipe.
pub(crate) fn send_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EPIPE) => return Err(Error::PeerGone),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => fatal("write", e),
        }
    }
    Ok(())
}

/// Fill the whole buffer. EOF anywhere short of the end is `Eof`.
pub(crate) fn recv_all(fd: RawFd, mut buf: &mut [u8]) -> ReadOutcome {
    while !buf.is_empty() {
        match read(fd, buf) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => fatal("read", e),
        }
    }
    ReadOutcome::Filled
}

/// The rendezvous semaphore: an eventfd in semaphore mode. Each `post`
/// unblocks exactly one `wait`.
pub(crate) struct Wakeup {
    fd: RawFd,
    // eventfd counters are 8-byte native-endian integers.
}

impl Wakeup {
    pub fn new() -> Wakeup {
        Wakeup {
            fd: eventfd(0, EfdFlags::EFD_SEMAPHORE).expect("eventfd"),
        }
    }

    pub fn post(&self) {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, 1);
        if let Err(e) = write(self.fd, &buf) {
            fatal("eventfd write", e);
        }
    }

    pub fn wait(&self) {
        let mut buf = [0u8; 8];
        loop {
            match read(self.fd, &mut buf) {
                Ok(_) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => fatal("eventfd read", e),
            }
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::thread;

    #[test]
    fn round_trip_and_eof() {
        let (rx, tx) = pipe().unwrap();
        send_all(tx, b"abcde").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(recv_all(rx, &mut buf), ReadOutcome::Filled);
        assert_eq!(&buf, b"abcde");

        close(tx).unwrap();
        assert_eq!(recv_all(rx, &mut buf), ReadOutcome::Eof);
        close(rx).unwrap();
    }

    #[test]
    fn short_reads_reassemble() {
        let (rx, tx) = pipe().unwrap();
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();
        let writer = thread::spawn(move || send_all(tx, &payload).unwrap());
        let mut buf = vec![0u8; expect.len()];
        assert_eq!(recv_all(rx, &mut buf), ReadOutcome::Filled);
        assert_eq!(buf, expect);
        writer.join().unwrap();
        close(rx).unwrap();
        close(tx).unwrap();
    }

    #[test]
    fn empty_transfers_are_noops() {
        let (rx, tx) = pipe().unwrap();
        send_all(tx, &[]).unwrap();
        assert_eq!(recv_all(rx, &mut []), ReadOutcome::Filled);
        close(rx).unwrap();
        close(tx).unwrap();
    }

    #[test]
    fn wakeup_counts_posts() {
        let wake = Wakeup::new();
        wake.post();
        wake.post();
        wake.wait();
        wake.wait();
    }
}
