//! This crate implements the sandbox primitives of the interactive judge harness. The sandbox is
//! responsible for executing untrusted programs in a bounded and measured environment.
//!
//! The sandbox implements:
//!
//! * Normal process operations: create, start, wait for and kill a process;
//!
//! * Resource limits: CPU time, address space and output size limits installed as hard `rlimit`s
//! before the target program executes, plus an optional real time limit enforced by the parent;
//!
//! * Privilege separation: every sandboxed program executes under a named unprivileged identity;
//!
//! * Redirections: redirects stdin, stdout and stderr of child processes to files or to the
//! endpoints of a `PipePairChannel`;
//!
//! * Measurement: exit status and resource usage of the reaped child are captured in an
//! `ExecutionOutcome`.
//!

#[macro_use]
extern crate log;
#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate nix;

mod daemon;
pub mod fifo;
pub mod identity;
pub mod misc;
pub mod rlimits;

use std::ffi::CString;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, SigAction, SigHandler, SaFlags, SigSet};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, ForkResult};

pub use fifo::PipePairChannel;
pub use identity::{Credentials, Identity, IdentityMap, PrivilegeDroppedCommand};
pub use rlimits::ResourceLimitSpec;

use daemon::{RawExit, WaitPidGuard};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
    }

    errors {
        InvalidProcessArgument {
            description("invalid argument to subprocess")
        }

        EmptyCommand {
            description("command is empty")
        }

        UnknownUser(name: String) {
            description("unknown user")
            display("unknown user: \"{}\"", name)
        }

        PrivilegeDropFailed {
            description("failed to switch to the unprivileged identity")
        }

        ChannelSetupFailed(path: String) {
            description("failed to set up FIFO channel")
            display("failed to set up FIFO channel at \"{}\"", path)
        }

        DaemonFailed {
            description("failed to collect child process status")
        }
    }
}

/// Signal the child raises on itself when anything between `fork` and `exec` fails.
const STARTUP_FAILURE_SIGNAL: Signal = Signal::SIGUSR1;

/// Permission bits of output files created by path redirections.
const OUTPUT_FILE_MODE: u32 = 0o644;

/// How far below its CPU time limit a process killed by `SIGKILL` may be accounted and still be
/// classified as having exhausted the limit. Kernel CPU accounting lags the enforcement tick.
const CPU_TIME_TOLERANCE: Duration = Duration::from_millis(50);

/// Type for the exit codes of processes.
pub type ProcessExitCode = i32;

/// Type for representing process IDs.
pub type ProcessId = i32;

/// One of the three standard streams of a child process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    /// Get the file descriptor of the stream.
    fn fd(self) -> RawFd {
        match self {
            StdStream::Stdin => libc::STDIN_FILENO,
            StdStream::Stdout => libc::STDOUT_FILENO,
            StdStream::Stderr => libc::STDERR_FILENO,
        }
    }

    /// Get the flags used to open a path onto the stream. Output paths are created or
    /// truncated; both are no-ops on an existing FIFO.
    fn open_flags(self) -> OFlag {
        match self {
            StdStream::Stdin => OFlag::O_RDONLY,
            StdStream::Stdout | StdStream::Stderr =>
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        }
    }
}

/// Source of a redirected standard stream.
#[derive(Debug)]
pub enum RedirectionSource {
    /// A file opened by the parent before `fork`.
    File(File),

    /// A path opened by the child after `fork`. Opening a FIFO blocks until the peer opens the
    /// other end, which is why FIFO endpoints are opened in the child.
    Path(PathBuf),
}

/// Specify redirections of standard streams. Redirections are applied in the order they were
/// added, which matters when two processes rendezvous on a pair of FIFOs.
#[derive(Debug, Default)]
pub struct ProcessRedirection {
    entries: Vec<(StdStream, RedirectionSource)>,
}

impl ProcessRedirection {
    /// Redirect the given stream to a file opened by the parent.
    pub fn redirect_file(&mut self, stream: StdStream, file: File) {
        self.entries.push((stream, RedirectionSource::File(file)));
    }

    /// Redirect the given stream to a path, opened by the child.
    pub fn redirect_path<T>(&mut self, stream: StdStream, path: T)
        where T: Into<PathBuf> {
        self.entries.push((stream, RedirectionSource::Path(path.into())));
    }

    /// Redirect the given stream to `/dev/null`.
    pub fn ignore(&mut self, stream: StdStream) -> Result<()> {
        let null = std::fs::OpenOptions::new()
            .read(stream == StdStream::Stdin)
            .write(stream != StdStream::Stdin)
            .open("/dev/null")?;
        self.redirect_file(stream, null);
        Ok(())
    }

    /// Apply the redirections to the calling process.
    fn apply(&self) -> Result<()> {
        for (stream, source) in &self.entries {
            match source {
                RedirectionSource::File(file) => {
                    nix::unistd::dup2(file.as_raw_fd(), stream.fd())?;
                },
                RedirectionSource::Path(path) => {
                    let mode = Mode::from_bits_truncate(OUTPUT_FILE_MODE as _);
                    let fd = nix::fcntl::open(path.as_path(), stream.open_flags(), mode)?;
                    misc::redirect_fd(fd, stream.fd())?;
                }
            };
        }

        Ok(())
    }
}

/// Provide mechanism to build a child process in sandboxed environment.
pub struct ProcessBuilder {
    /// Name or path of the executable file, looked up in `PATH` when it contains no slash.
    file: String,

    /// Arguments passed to the child process, including `argv[0]`.
    args: Vec<String>,

    /// Working directory of the child process.
    pub working_dir: Option<PathBuf>,

    /// Limits to be applied to the new child process.
    pub limits: ResourceLimitSpec,

    /// Real time limit enforced by the parent while waiting for the child. `None` if no
    /// constraint is set.
    pub real_time_limit: Option<Duration>,

    /// Redirections to be applied to the new child process.
    pub redirections: ProcessRedirection,

    /// Credentials the new child process switches to before `exec`. `None` keeps the credentials
    /// of the calling process.
    pub credentials: Option<Credentials>,
}

impl ProcessBuilder {
    /// Create a new `ProcessBuilder` instance, given the executable file's name or path.
    pub fn new<T>(file: T) -> ProcessBuilder
        where T: Into<String> {
        let file = file.into();
        ProcessBuilder {
            // The executable itself is the first argument to the program.
            args: vec![file.clone()],
            file,
            working_dir: None,
            limits: ResourceLimitSpec::default(),
            real_time_limit: None,
            redirections: ProcessRedirection::default(),
            credentials: None,
        }
    }

    /// Add an argument to the child process. If the given argument is not a valid C-style string,
    /// then returns `Err(e)` where the error kind of `e` is `ErrorKind::InvalidProcessArgument`.
    pub fn add_arg<T>(&mut self, arg: T) -> Result<()>
        where T: Into<String> {
        let arg = arg.into();
        if misc::is_valid_c_string(&arg) {
            self.args.push(arg);
            Ok(())
        } else {
            debug!("Invalid process argument: \"{}\"", arg);
            bail!(ErrorKind::InvalidProcessArgument);
        }
    }

    /// Get the arguments of the child process, including `argv[0]`.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Apply working directory changes to the calling process.
    fn apply_working_directory(&self) -> Result<()> {
        if let Some(dir) = self.working_dir.as_ref() {
            nix::unistd::chdir(dir.as_path())?;
        }

        Ok(())
    }

    /// Restore default dispositions of signals the parent may have ignored. Ignored dispositions
    /// survive `exec`, and the sandboxed program must see `SIGPIPE` when its peer goes away.
    fn apply_signal_dispositions(&self) -> Result<()> {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe { nix::sys::signal::sigaction(Signal::SIGPIPE, &default) }?;
        Ok(())
    }

    /// Switch the calling process to `self.credentials`.
    fn apply_credentials(&self) -> Result<()> {
        if let Some(credentials) = self.credentials.as_ref() {
            credentials.switch_to()
                .chain_err(|| ErrorKind::PrivilegeDropFailed)?;
        }

        Ok(())
    }

    /// Start child process. This function will be called after `fork` in the child process. This
    /// function initializes necessary components in the child process (redirections, working
    /// directory, rlimits, identity switch) and then calls `execvp`. It only ever returns on
    /// failure.
    fn start_child(&self, native_file: &CString, native_argv: &[CString]) -> Result<()> {
        // Notes: No log messages are expected in the child process.

        // Lead a new process group so the parent can kill every descendant at once.
        nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

        // Apply redirections. FIFO endpoints block here until the peer shows up.
        self.redirections.apply()?;

        // Apply working directory changes.
        self.apply_working_directory()?;

        self.apply_signal_dispositions()?;

        // Resource limits go in strictly before control transfers to the untrusted program.
        self.limits.apply()?;

        // Drop privileges last; a failure here must never fall through to `exec`.
        self.apply_credentials()?;

        // Finally, execvp!
        nix::unistd::execvp(native_file, native_argv)?;

        unreachable!()
    }

    /// Start the process in a sandboxed environment.
    pub fn start(self) -> Result<Process> {
        // Build argv into native format before forking.
        let native_file = CString::new(self.file.clone())
            .map_err(|_| Error::from(ErrorKind::InvalidProcessArgument))?;
        let native_argv = self.args.iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<Vec<CString>, _>>()
            .map_err(|_| Error::from(ErrorKind::InvalidProcessArgument))?;

        match nix::unistd::fork()? {
            ForkResult::Parent { child } => {
                // Also done by the child; whichever runs first wins the race against a kill.
                // Fails harmlessly once the child has called `exec`.
                let _ = nix::unistd::setpgid(child, child);
                trace!("Started child process {} for {:?}", child, self.args);
                Ok(Process::attach(child, self.limits, self.real_time_limit))
            },
            ForkResult::Child => {
                if let Err(e) = self.start_child(&native_file, &native_argv) {
                    eprintln!("failed to start child process: {}", e);
                }
                // Terminate self by the delivery of `STARTUP_FAILURE_SIGNAL` so the parent can
                // tell a startup failure from an exit of the program.
                let _ = nix::sys::signal::kill(nix::unistd::getpid(), STARTUP_FAILURE_SIGNAL);
                unsafe { libc::_exit(127) }
            }
        }
    }
}

/// Classified exit status of a sandboxed process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessExitStatus {
    /// The process exited normally.
    Normal(ProcessExitCode),

    /// The process was killed by the delivery of a signal.
    KilledBySignal(i32),

    /// The process was killed by the kernel due to its CPU time limit.
    CPUTimeLimitExceeded,

    /// The process was killed by the kernel due to its output size limit.
    OutputLimitExceeded,

    /// The process was killed by the parent due to its real time limit.
    RealTimeLimitExceeded,

    /// The child failed before it could execute the target program.
    StartupFailed,
}

impl ProcessExitStatus {
    /// Classify a raw wait status word.
    fn classify(status: libc::c_int, usage: &UsageSample, limits: &ResourceLimitSpec,
        killed_by_supervisor: bool) -> Self {
        if killed_by_supervisor {
            return ProcessExitStatus::RealTimeLimitExceeded;
        }
        if libc::WIFEXITED(status) {
            return ProcessExitStatus::Normal(libc::WEXITSTATUS(status));
        }

        let sig = libc::WTERMSIG(status);
        let cpu_exhausted = limits.cpu_seconds
            .map(|cpu| usage.cpu_time + CPU_TIME_TOLERANCE >= Duration::from_secs(cpu))
            .unwrap_or(false);
        match sig {
            libc::SIGXCPU => ProcessExitStatus::CPUTimeLimitExceeded,
            libc::SIGKILL if cpu_exhausted => ProcessExitStatus::CPUTimeLimitExceeded,
            libc::SIGXFSZ => ProcessExitStatus::OutputLimitExceeded,
            libc::SIGUSR1 => ProcessExitStatus::StartupFailed,
            _ => ProcessExitStatus::KilledBySignal(sig)
        }
    }
}

/// Resource usage statistics of a reaped sandboxed process and its reaped descendants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSample {
    /// CPU time spent in user mode and kernel mode.
    pub cpu_time: Duration,

    /// Number of minor (soft) page faults.
    pub minor_faults: i64,

    /// Number of major (hard) page faults.
    pub major_faults: i64,
}

impl UsageSample {
    /// Get the CPU time in seconds.
    pub fn cpu_time_seconds(&self) -> f64 {
        // Go through whole microseconds so the value prints as the shortest decimal.
        self.cpu_time.as_micros() as f64 / 1_000_000.0
    }
}

impl From<&libc::rusage> for UsageSample {
    fn from(rusage: &libc::rusage) -> Self {
        UsageSample {
            cpu_time: misc::duration_from_timeval(&rusage.ru_utime)
                + misc::duration_from_timeval(&rusage.ru_stime),
            minor_faults: rusage.ru_minflt as i64,
            major_faults: rusage.ru_majflt as i64,
        }
    }
}

/// Exit status and resource usage captured when a sandboxed process is reaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// The raw wait status word.
    pub raw_status: libc::c_int,

    /// Whether the process exited normally.
    pub exited_normally: bool,

    /// The exit code. Only meaningful if `exited_normally` is set.
    pub exit_code: ProcessExitCode,

    /// The signal that terminated the process, if any.
    pub terminating_signal: Option<i32>,

    /// Whether the process was stopped rather than terminated.
    pub stopped: bool,

    /// The signal that stopped the process, if any.
    pub stop_signal: Option<i32>,

    /// Whether the process produced a core dump.
    pub core_dumped: bool,

    /// Resource usage of the process.
    pub usage: UsageSample,

    /// Pid of the process.
    pub pid: ProcessId,

    /// Pid of the process's parent, i.e. the process that started it.
    pub parent_pid: ProcessId,

    /// Classified exit status.
    pub exit_status: ProcessExitStatus,
}

impl ExecutionOutcome {
    /// Decode the outcome of a reaped child.
    fn capture(pid: Pid, raw: &RawExit, limits: &ResourceLimitSpec, killed_by_supervisor: bool)
        -> Self {
        let status = raw.status;
        let usage = UsageSample::from(&raw.rusage);
        let signaled = libc::WIFSIGNALED(status);
        let stopped = libc::WIFSTOPPED(status);

        ExecutionOutcome {
            raw_status: status,
            exited_normally: libc::WIFEXITED(status),
            exit_code: libc::WEXITSTATUS(status),
            terminating_signal: if signaled { Some(libc::WTERMSIG(status)) } else { None },
            stopped,
            stop_signal: if stopped { Some(libc::WSTOPSIG(status)) } else { None },
            core_dumped: signaled && libc::WCOREDUMP(status),
            usage,
            pid: pid.as_raw(),
            parent_pid: nix::unistd::getpid().as_raw(),
            exit_status: ProcessExitStatus::classify(status, &usage, limits, killed_by_supervisor),
        }
    }
}

/// A handle to the sandboxed child process.
///
/// Dropping the handle before the process has been waited for kills and reaps the process.
pub struct Process {
    /// Pid of the child process.
    pid: Pid,

    /// Limits the child process was started with.
    limits: ResourceLimitSpec,

    /// Real time limit enforced while waiting.
    real_time_limit: Option<Duration>,

    /// Wait guard of the child process.
    guard: WaitPidGuard,

    /// The captured outcome, once the child has been reaped.
    outcome: Option<ExecutionOutcome>,
}

impl Process {
    /// Create a new `Process` instance attaching to the specific process.
    fn attach(pid: Pid, limits: ResourceLimitSpec, real_time_limit: Option<Duration>) -> Process {
        trace!("Process::attach to process ID {}", pid.as_raw());

        Process {
            pid,
            limits,
            real_time_limit,
            guard: WaitPidGuard::new(pid),
            outcome: None,
        }
    }

    /// Get the ID of the child process.
    pub fn pid(&self) -> ProcessId {
        self.pid.as_raw()
    }

    /// Wait for the child process to exit, enforcing the real time limit given to the builder.
    /// Calling this again after the process has been reaped returns the captured outcome.
    pub fn wait_for_exit(&mut self) -> Result<ExecutionOutcome> {
        let limit = self.real_time_limit;
        self.wait_for_exit_within(limit)
    }

    /// Wait for the child process to exit, killing it once `limit` has elapsed. `None` waits
    /// without bound.
    pub fn wait_for_exit_within(&mut self, limit: Option<Duration>) -> Result<ExecutionOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }

        let (raw, killed) = daemon::supervise(&mut self.guard, limit)?;
        let outcome = ExecutionOutcome::capture(self.pid, &raw, &self.limits, killed);
        trace!("Process {} exited with {:?}", self.pid, outcome.exit_status);

        self.outcome = Some(outcome);
        Ok(outcome)
    }
}
