//! Process-group launching: build the full pipe mesh, fork one child per
//! rank, renumber each child's slice of the mesh onto the fixed descriptor
//! layout, exec the user program, and collect exit statuses.

use std::env;
use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, ForkResult};

use crate::layout::{
    FdMap, GROUP_DATA_IN, MAX_WORLD, RAISE_FLOOR, TREE_LEFT_IN, TREE_LEFT_OUT, TREE_PARENT_IN,
    TREE_PARENT_OUT, TREE_RIGHT_IN, TREE_RIGHT_OUT,
};
use crate::{ENV_RANK, ENV_WORLD_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("world size must be between 1 and {MAX_WORLD}, got {0}")]
    WorldSize(usize),
    #[error("{0} failed: {1}")]
    Sys(&'static str, Errno),
    #[error("program name or argument is not a valid C string")]
    BadProgram,
}

struct Pipe {
    rx: RawFd,
    tx: RawFd,
}

/// A pipe with both ends raised above the worker descriptor table, so the
/// child-side renumbering cannot collide with an original.
fn channel() -> Result<Pipe, LaunchError> {
    let (rx, tx) = pipe().map_err(|e| LaunchError::Sys("pipe", e))?;
    Ok(Pipe {
        rx: raise(rx)?,
        tx: raise(tx)?,
    })
}

fn raise(fd: RawFd) -> Result<RawFd, LaunchError> {
    let high = fcntl(fd, FcntlArg::F_DUPFD(RAISE_FLOOR)).map_err(|e| LaunchError::Sys("fcntl", e))?;
    close(fd).map_err(|e| LaunchError::Sys("close", e))?;
    Ok(high)
}

fn renumber(from: RawFd, to: RawFd) -> Result<(), LaunchError> {
    dup2(from, to).map_err(|e| LaunchError::Sys("dup2", e))?;
    Ok(())
}

/// Every pipe of the group, created up front in the launcher.
struct Mesh {
    world: usize,
    /// `p2p[src][dst]`: bytes flowing src to dst. Diagonal unused.
    p2p: Vec<Vec<Option<Pipe>>>,
    /// `data[r]`: unicast fan-in to rank r (broadcast-source and
    /// reduce-sink paths).
    data: Vec<Pipe>,
    /// Per tree edge, indexed by the child's heap position minus two:
    /// parent-to-child, then child-to-parent.
    tree: Vec<(Pipe, Pipe)>,
}

impl Mesh {
    fn build(world: usize) -> Result<Mesh, LaunchError> {
        let mut p2p: Vec<Vec<Option<Pipe>>> = (0..world)
            .map(|_| (0..world).map(|_| None).collect())
            .collect();
        for src in 0..world {
            for dst in 0..world {
                if src != dst {
                    p2p[src][dst] = Some(channel()?);
                }
            }
        }
        let data = (0..world).map(|_| channel()).collect::<Result<_, _>>()?;
        let tree = (2..=world)
            .map(|_| -> Result<(Pipe, Pipe), LaunchError> { Ok((channel()?, channel()?)) })
            .collect::<Result<_, _>>()?;
        Ok(Mesh { world, p2p, data, tree })
    }

    fn all_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        for row in &self.p2p {
            for p in row.iter().flatten() {
                fds.push(p.rx);
                fds.push(p.tx);
            }
        }
        for p in &self.data {
            fds.push(p.rx);
            fds.push(p.tx);
        }
        for (down, up) in &self.tree {
            fds.extend([down.rx, down.tx, up.rx, up.tx]);
        }
        fds
    }

    /// dup2 this rank's slice of the mesh onto the numbered layout. Runs in
    /// the child, before exec.
    fn wire_child(&self, rank: usize) -> Result<(), LaunchError> {
        let fds = FdMap { rank, world: self.world };
        for peer in (0..self.world).filter(|&p| p != rank) {
            let inbound = self.p2p[peer][rank].as_ref().expect("off-diagonal pipe");
            let outbound = self.p2p[rank][peer].as_ref().expect("off-diagonal pipe");
            renumber(inbound.rx, fds.p2p_in(peer))?;
            renumber(outbound.tx, fds.p2p_out(peer))?;
        }

        let pos = rank + 1;
        if pos >= 2 {
            let (down, up) = &self.tree[pos - 2];
            renumber(down.rx, TREE_PARENT_IN)?;
            renumber(up.tx, TREE_PARENT_OUT)?;
        }
        if pos * 2 <= self.world {
            let (down, up) = &self.tree[pos * 2 - 2];
            renumber(up.rx, TREE_LEFT_IN)?;
            renumber(down.tx, TREE_LEFT_OUT)?;
        }
        if pos * 2 + 1 <= self.world {
            let (down, up) = &self.tree[pos * 2 + 1 - 2];
            renumber(up.rx, TREE_RIGHT_IN)?;
            renumber(down.tx, TREE_RIGHT_OUT)?;
        }

        renumber(self.data[rank].rx, GROUP_DATA_IN)?;
        for dest in (0..self.world).filter(|&d| d != rank) {
            renumber(self.data[dest].tx, fds.group_data_out(dest))?;
        }
        Ok(())
    }

    fn close_all(&self) {
        for fd in self.all_fds() {
            let _ = close(fd);
        }
    }
}

/// Launch `world` copies of `program` wired into a complete mesh. Returns
/// the launcher's exit code: 0 iff every child exited 0.
pub fn run(world: usize, program: &str, args: &[String]) -> Result<i32, LaunchError> {
    if !(1..=MAX_WORLD).contains(&world) {
        return Err(LaunchError::WorldSize(world));
    }

    let prog = CString::new(program).map_err(|_| LaunchError::BadProgram)?;
    let mut argv = vec![prog.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_str()).map_err(|_| LaunchError::BadProgram)?);
    }

    let mesh = Mesh::build(world)?;
    env::set_var(ENV_WORLD_SIZE, world.to_string());

    for rank in 0..world {
        match unsafe { fork() }.map_err(|e| LaunchError::Sys("fork", e))? {
            ForkResult::Child => {
                // Renumber, drop every original, expose the rank, become
                // the worker. Only exec failure returns.
                if let Err(e) = mesh.wire_child(rank) {
                    eprintln!("mpmrun: wiring rank {rank}: {e}");
                    std::process::exit(1);
                }
                mesh.close_all();
                env::set_var(ENV_RANK, rank.to_string());
                let _ = execvp(&prog, &argv);
                eprintln!("mpmrun: exec {program}: not found or not executable");
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                log::debug!("rank {rank} is pid {child}");
            }
        }
    }

    mesh.close_all();
    env::remove_var(ENV_WORLD_SIZE);

    let mut failed = false;
    for _ in 0..world {
        match wait().map_err(|e| LaunchError::Sys("wait", e))? {
            WaitStatus::Exited(pid, 0) => log::debug!("pid {pid} exited cleanly"),
            status => {
                log::warn!("worker failed: {status:?}");
                failed = true;
            }
        }
    }
    Ok(i32::from(failed))
}
