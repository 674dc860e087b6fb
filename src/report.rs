//! This module implements the line oriented `key=value` report consumed by the invoking judge.
//!
//! Key names, their order and their presence are a compatibility contract: every key is always
//! written, even when its value carries no meaning for the observed outcome.
//!

use std::io::Write;

use sandbox::{ExecutionOutcome, ProcessId, UsageSample};

/// Raw core dump flag of a wait status word, as exposed by the C library's `WCOREDUMP`.
const CORE_DUMP_FLAG: libc::c_int = 0x80;

/// Measurements of one harness invocation, ready to be written out.
#[derive(Clone, Debug)]
pub struct Report {
    /// The main solution's command line.
    pub main_command_line: String,

    /// The interactor's command line.
    pub interactor_command_line: String,

    /// Usage of the baseline probe, if it ran.
    pub baseline: Option<UsageSample>,

    /// Outcome of the main solution, if it ran.
    pub outcome: Option<ExecutionOutcome>,

    /// Page size of the host.
    pub page_size: usize,

    /// Pid of the harness.
    pub pid: ProcessId,

    /// Pid of the harness's parent.
    pub parent_pid: ProcessId,
}

fn flag(value: bool) -> i32 {
    if value { 1 } else { 0 }
}

impl Report {
    /// Create a new `Report` describing the calling process.
    pub fn new(main_command_line: String, interactor_command_line: String,
        baseline: Option<UsageSample>, outcome: Option<ExecutionOutcome>) -> Self {
        Report {
            main_command_line,
            interactor_command_line,
            baseline,
            outcome,
            page_size: sandbox::misc::page_size(),
            pid: nix::unistd::getpid().as_raw(),
            parent_pid: nix::unistd::getppid().as_raw(),
        }
    }

    /// Write the report to `out`, one `key=value` pair per line.
    pub fn emit<W>(&self, out: &mut W) -> std::io::Result<()>
        where W: Write {
        writeln!(out, "maincmd={}", self.main_command_line)?;
        writeln!(out, "interact_cmd={}", self.interactor_command_line)?;

        match self.outcome.as_ref() {
            Some(outcome) => {
                let status = outcome.raw_status;
                writeln!(out, "childstatus={}", status)?;
                writeln!(out, "WIFSIGNALED={}", flag(outcome.terminating_signal.is_some()))?;
                writeln!(out, "WTERMSIG={}", outcome.terminating_signal.unwrap_or(0))?;
                writeln!(out, "WEXITSTATUS={}", libc::WEXITSTATUS(status))?;
                writeln!(out, "WIFEXITED={}", flag(outcome.exited_normally))?;
                let core = if outcome.core_dumped { status & CORE_DUMP_FLAG } else { 0 };
                writeln!(out, "WCOREDUMP={}", core)?;
                writeln!(out, "WSTOPSIG={}", libc::WSTOPSIG(status))?;
                writeln!(out, "WIFSTOPPED={}", flag(outcome.stopped))?;
            },
            None => {
                writeln!(out, "childstatus=-1")?;
                for key in &["WIFSIGNALED", "WTERMSIG", "WEXITSTATUS", "WIFEXITED", "WCOREDUMP",
                    "WSTOPSIG", "WIFSTOPPED"] {
                    writeln!(out, "{}=0", key)?;
                }
            }
        };

        let baseline = self.baseline.unwrap_or_default();
        let usage = self.outcome.map(|outcome| outcome.usage).unwrap_or_default();
        writeln!(out, "basetime={}", baseline.cpu_time_seconds())?;
        writeln!(out, "time={}", usage.cpu_time_seconds())?;
        writeln!(out, "basemem={}", baseline.minor_faults)?;
        writeln!(out, "mem={}", usage.minor_faults)?;
        writeln!(out, "pagesize={}", self.page_size)?;
        writeln!(out, "ru_majflt={}", usage.major_faults)?;
        writeln!(out, "pid={}", self.pid)?;
        writeln!(out, "ppid={}", self.parent_pid)?;

        out.flush()
    }
}
