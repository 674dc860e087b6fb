use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::{
    Error,
    ErrorKind,
    Result,
};

/// Interval between consecutive non-blocking `wait4` calls while supervising a process.
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Raw status word and resource usage of a reaped child, as reported by `wait4`.
#[derive(Clone, Copy)]
pub struct RawExit {
    /// The status word, to be decoded with the `W*` macros.
    pub status: libc::c_int,

    /// Resource usage of the child and its reaped descendants.
    pub rusage: libc::rusage,
}

/// Call `wait4` on the given pid, retrying on `EINTR`. Returns `Ok(None)` if `WNOHANG` is in
/// `options` and the child has not changed state yet.
fn wait4(pid: Pid, options: libc::c_int) -> nix::Result<Option<RawExit>> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, options, &mut rusage) };
        if ret == -1 {
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(nix::Error::Sys(errno))
            };
        }
        if ret == 0 {
            return Ok(None);
        }

        return Ok(Some(RawExit { status, rusage }));
    }
}

/// Send `SIGKILL` through `send`, treating a target that is already gone as success.
fn kill_ignoring_gone(send: nix::Result<()>) -> nix::Result<()> {
    match send {
        Ok(()) | Err(nix::Error::Sys(Errno::ESRCH)) => Ok(()),
        Err(e) => Err(e)
    }
}

/// Provide a RAII guard type for safely waiting for `pid`s.
///
/// The guarded child leads its own process group, which every descendant it forks inherits.
/// When the guard is dropped the whole group is killed, and a child not reaped yet is reaped, so
/// no sandboxed process outlives the guard.
pub struct WaitPidGuard {
    /// The pid of the process to wait on.
    pid: Pid,

    /// Whether the process has been reaped.
    reaped: bool
}

impl WaitPidGuard {
    /// Create a new `WaitPidGuard` instance.
    pub fn new(pid: Pid) -> Self {
        WaitPidGuard {
            pid,
            reaped: false
        }
    }

    /// Wait for the child process. With `nohang` set this returns `Ok(None)` immediately if the
    /// child is still running. Once a status is returned the child has been reaped and the guard
    /// is released.
    pub fn wait(&mut self, nohang: bool) -> nix::Result<Option<RawExit>> {
        let options = if nohang { libc::WNOHANG } else { 0 };
        let res = wait4(self.pid, options)?;
        if res.is_some() {
            self.reaped = true;
        }

        Ok(res)
    }

    /// Send `SIGKILL` to the child process and to every process left in its process group. A
    /// target that is already gone is not an error.
    pub fn kill(&self) -> nix::Result<()> {
        kill_ignoring_gone(nix::sys::signal::killpg(self.pid, Signal::SIGKILL))?;
        if !self.reaped {
            kill_ignoring_gone(nix::sys::signal::kill(self.pid, Signal::SIGKILL))?;
        }

        Ok(())
    }
}

impl Drop for WaitPidGuard {
    fn drop(&mut self) {
        if !self.reaped {
            warn!("Killing unreaped child process {}", self.pid);
        }

        // Descendants of a reaped child may still be running in its group.
        if let Err(e) = self.kill() {
            warn!("Cannot kill process group {}: {}", self.pid, e);
            return;
        }
        if self.reaped {
            return;
        }
        if let Err(e) = self.wait(false) {
            warn!("Cannot reap child process {}: {}", self.pid, e);
        }
    }
}

/// Wait for the child process guarded by `guard` to exit.
///
/// Without a real time limit this blocks in `wait4`. With a real time limit the child is polled
/// every `WAIT_INTERVAL`, and once the limit has elapsed it is sent `SIGKILL` and reaped. The
/// second element of the returned tuple tells whether the child was killed that way.
pub fn supervise(guard: &mut WaitPidGuard, real_time_limit: Option<Duration>)
    -> Result<(RawExit, bool)> {
    let real_time_limit = match real_time_limit {
        Some(limit) => limit,
        None => {
            trace!("Blocking wait on process {}", guard.pid);
            let raw = guard.wait(false)?
                .ok_or_else(|| Error::from(ErrorKind::DaemonFailed))?;
            return Ok((raw, false));
        }
    };

    // `timer` is used to measure elapsed real time.
    let timer = Instant::now();

    loop {
        if let Some(raw) = guard.wait(true)? {
            return Ok((raw, false));
        }

        if timer.elapsed() >= real_time_limit {
            debug!("Process {} exceeded real time limit of {:?}, killing",
                guard.pid, real_time_limit);
            guard.kill()?;
            let raw = guard.wait(false)?
                .ok_or_else(|| Error::from(ErrorKind::DaemonFailed))?;
            return Ok((raw, true));
        }

        std::thread::sleep(WAIT_INTERVAL);
    }
}
