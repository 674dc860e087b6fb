//! This module implements the two execution phases of the harness: the baseline probe and the
//! interactive run of the main solution against the interactor.
//!

use std::fs::File;
use std::path::Path;

use error_chain::ChainedError;

use sandbox::{
    ExecutionOutcome,
    Identity,
    IdentityMap,
    PipePairChannel,
    PrivilegeDroppedCommand,
    ProcessBuilder,
    ProcessExitStatus,
    ResourceLimitSpec,
    StdStream,
};

use crate::Result;
use crate::config::HarnessConfig;

/// CPU time ceiling of the baseline probe, in seconds.
pub const BASELINE_CPU_SECONDS: u64 = 1;

/// Render a command in the equivalent `sudo` form used by the report. Commands that cannot be
/// constructed still render, with nothing after the user name.
fn describe_command(raw: &str, identity: Identity, identities: &IdentityMap) -> String {
    match PrivilegeDroppedCommand::new(raw, identity) {
        Ok(command) => command.describe(identities),
        Err(..) => format!("sudo -u {} ", identities.user_name(identity))
    }
}

/// Redirect stderr of the process built by `builder` to the given file, if any.
fn redirect_stderr(builder: &mut ProcessBuilder, path: Option<&Path>) -> Result<()> {
    if let Some(path) = path {
        let file = File::create(path)?;
        builder.redirections.redirect_file(StdStream::Stderr, file);
    }

    Ok(())
}

/// Measure the host's process startup overhead by running the baseline command.
pub struct BaselineProbe<'a> {
    config: &'a HarnessConfig,
}

impl<'a> BaselineProbe<'a> {
    /// Create a new `BaselineProbe` instance.
    pub fn new(config: &'a HarnessConfig) -> Self {
        BaselineProbe { config }
    }

    /// Build the baseline process. Only the CPU time ceiling applies to the baseline, and its
    /// stdin and stdout are detached so it cannot pollute the report.
    fn builder(&self) -> Result<ProcessBuilder> {
        let command = PrivilegeDroppedCommand::new(&self.config.baseline_command, Identity::Nobody)?;
        let mut builder = command.resolve(&self.config.identities)?;
        builder.limits = ResourceLimitSpec::cpu_only(BASELINE_CPU_SECONDS);
        builder.working_dir = self.config.working_dir.clone();
        builder.redirections.ignore(StdStream::Stdin)?;
        builder.redirections.ignore(StdStream::Stdout)?;

        Ok(builder)
    }

    fn execute(&self) -> Result<ExecutionOutcome> {
        let mut process = self.builder()?.start()?;
        let outcome = process.wait_for_exit()?;
        Ok(outcome)
    }

    /// Run the baseline command to completion. Returns `None` if it could not be run at all.
    pub fn run(&self) -> Option<ExecutionOutcome> {
        info!("Running baseline probe: {}", self.config.baseline_command);
        match self.execute() {
            Ok(outcome) => {
                debug!("Baseline probe exited with {:?}, usage {:?}",
                    outcome.exit_status, outcome.usage);
                Some(outcome)
            },
            Err(e) => {
                error!("Baseline probe failed: {}", e.display_chain());
                None
            }
        }
    }
}

/// Result of one interactive run.
#[derive(Clone, Debug)]
pub struct InteractiveRun {
    /// The main solution's command line, in the equivalent `sudo` form.
    pub main_command_line: String,

    /// The interactor's command line, in the equivalent `sudo` form.
    pub interactor_command_line: String,

    /// Outcome of the main solution. `None` if it never ran.
    pub outcome: Option<ExecutionOutcome>,

    /// Outcome of the interactor. Never reported, kept for diagnostics.
    pub interactor_outcome: Option<ExecutionOutcome>,
}

/// Orchestrate the main solution and the interactor over a `PipePairChannel`.
pub struct InteractiveRunner<'a> {
    config: &'a HarnessConfig,
}

impl<'a> InteractiveRunner<'a> {
    /// Create a new `InteractiveRunner` instance.
    pub fn new(config: &'a HarnessConfig) -> Self {
        InteractiveRunner { config }
    }

    fn fifo_path(&self, index: u32) -> String {
        format!("{}{}", self.config.fifo_prefix, index)
    }

    /// Get the main solution's command line as reported.
    pub fn main_command_line(&self) -> String {
        format!("{} < {} > {}",
            describe_command(&self.config.main_command, Identity::Nobody, &self.config.identities),
            self.fifo_path(1),
            self.fifo_path(2))
    }

    /// Get the interactor's command line as reported.
    pub fn interactor_command_line(&self) -> String {
        format!("{} {} {} > {} < {}",
            describe_command(
                &self.config.interactor_command, Identity::Judge, &self.config.identities),
            self.config.interactor_args[0],
            self.config.interactor_args[1],
            self.fifo_path(1),
            self.fifo_path(2))
    }

    /// Build the main solution's process. It opens its stdin before its stdout, the mirror image
    /// of the interactor, so the two rendezvous on the FIFOs without deadlock.
    fn main_builder(&self, channel: &PipePairChannel) -> Result<ProcessBuilder> {
        let command = PrivilegeDroppedCommand::new(&self.config.main_command, Identity::Nobody)?;
        let mut builder = command.resolve(&self.config.identities)?;
        builder.limits = self.config.limits;
        builder.real_time_limit = self.config.wall_time_limit;
        builder.working_dir = self.config.working_dir.clone();

        redirect_stderr(&mut builder, self.config.main_error_file.as_ref().map(|p| p.as_path()))?;
        builder.redirections.redirect_path(StdStream::Stdin, channel.main_input());
        builder.redirections.redirect_path(StdStream::Stdout, channel.main_output());

        Ok(builder)
    }

    /// Build the interactor's process.
    fn interactor_builder(&self, channel: &PipePairChannel) -> Result<ProcessBuilder> {
        let command = PrivilegeDroppedCommand::new(
            &self.config.interactor_command, Identity::Judge)?;
        let mut builder = command.resolve(&self.config.identities)?;
        for arg in self.config.interactor_args.iter() {
            builder.add_arg(arg.as_str())?;
        }
        builder.limits = self.config.limits;
        builder.working_dir = self.config.working_dir.clone();

        redirect_stderr(&mut builder,
            self.config.interactor_error_file.as_ref().map(|p| p.as_path()))?;
        builder.redirections.redirect_path(StdStream::Stdout, channel.interactor_output());
        builder.redirections.redirect_path(StdStream::Stdin, channel.interactor_input());

        Ok(builder)
    }

    fn execute(&self, run: &mut InteractiveRun) -> Result<()> {
        let mut channel = PipePairChannel::create(self.config.fifo_prefix.as_str())?;
        trace!("FIFO channel ready under prefix \"{}\"", channel.name_prefix());

        let main_builder = self.main_builder(&channel)?;
        let interactor_builder = self.interactor_builder(&channel)?;

        // Any process started here is killed and reaped if a later step fails, and the channel
        // is removed on the way out either way.
        let mut interactor = interactor_builder.start()?;
        let mut main = main_builder.start()?;
        info!("Started main solution {} and interactor {}", main.pid(), interactor.pid());

        let outcome = main.wait_for_exit()?;
        debug!("Main solution exited with {:?}, usage {:?}", outcome.exit_status, outcome.usage);
        run.outcome = Some(outcome);

        let grace = self.config.interactor_grace;
        let interactor_outcome = interactor.wait_for_exit_within(Some(grace))?;
        if interactor_outcome.exit_status == ProcessExitStatus::RealTimeLimitExceeded {
            warn!("Interactor {} still running {:?} after the main solution exited, killed",
                interactor.pid(), grace);
        }
        debug!("Interactor exited with {:?}", interactor_outcome.exit_status);
        run.interactor_outcome = Some(interactor_outcome);

        channel.teardown();
        Ok(())
    }

    /// Run the main solution against the interactor. Failures are logged and leave the
    /// corresponding outcome absent; the FIFOs never outlive this call.
    pub fn run(&self) -> InteractiveRun {
        let mut run = InteractiveRun {
            main_command_line: self.main_command_line(),
            interactor_command_line: self.interactor_command_line(),
            outcome: None,
            interactor_outcome: None,
        };

        info!("Running interactive phase over FIFO prefix \"{}\"", self.config.fifo_prefix);
        if let Err(e) = self.execute(&mut run) {
            error!("Interactive run failed: {}", e.display_chain());
        }

        run
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use sandbox::Credentials;
    use tempfile::TempDir;

    /// Build a configuration running everything as the current user inside `dir`.
    fn config(dir: &TempDir, positionals: &[&str], flags: &[&str]) -> HarnessConfig {
        let user = Credentials::current().unwrap().name;
        let prefix = dir.path().join("testpipe");

        let mut args = vec![String::from("interact-shell")];
        args.extend(positionals.iter().map(|s| String::from(*s)));
        args.push(prefix.to_str().unwrap().to_owned());
        args.extend(vec![
            String::from("--nobody-user"), user.clone(),
            String::from("--judge-user"), user,
            String::from("--cwd"), dir.path().to_str().unwrap().to_owned(),
            String::from("--error"), dir.path().join("main.err").to_str().unwrap().to_owned(),
            String::from("--interactor-error"),
            dir.path().join("interactor.err").to_str().unwrap().to_owned(),
        ]);
        args.extend(flags.iter().map(|s| String::from(*s)));

        HarnessConfig::from_args(args).unwrap()
    }

    fn fifos_of(config: &HarnessConfig) -> (PathBuf, PathBuf) {
        (PathBuf::from(format!("{}1", config.fifo_prefix)),
            PathBuf::from(format!("{}2", config.fifo_prefix)))
    }

    #[test]
    fn test_command_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, &["1", "67108864", "1048576", "true", "\"./a.out\"", "'./interactor'", "3", "-1"], &[]);
        config.identities = IdentityMap::default();
        config.fifo_prefix = String::from("/tmp/testpipe");

        let runner = InteractiveRunner::new(&config);
        assert_eq!("sudo -u nobody ./a.out < /tmp/testpipe1 > /tmp/testpipe2",
            runner.main_command_line());
        assert_eq!("sudo -u judge ./interactor 3 -1 > /tmp/testpipe1 < /tmp/testpipe2",
            runner.interactor_command_line());
    }

    #[test]
    fn test_end_to_end_cat() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &["1", "67108864", "1048576", "true", "cat", "cat", "x", "y"], &[]);

        let baseline = BaselineProbe::new(&config).run().unwrap();
        assert_eq!(ProcessExitStatus::Normal(0), baseline.exit_status);

        let run = InteractiveRunner::new(&config).run();
        let outcome = run.outcome.unwrap();
        assert!(outcome.exited_normally);
        assert_eq!(0, outcome.exit_code);
        assert!(outcome.usage.cpu_time_seconds() < 1.0);

        // The interactor fails on its missing input files, which closes the main solution's input.
        assert_eq!(ProcessExitStatus::Normal(1), run.interactor_outcome.unwrap().exit_status);

        let (a, b) = fifos_of(&config);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_bytes_cross_the_channel_intact() {
        let dir = tempfile::tempdir().unwrap();
        let received = dir.path().join("received");
        let config = config(&dir, &[
            "5", "268435456", "16777216", "true",
            "sh -c 'yes 0123456789 | head -c 1000000'",
            "sh -c 'cat > \"$1\"'",
            "interactor", received.to_str().unwrap(),
        ], &["--interactor-grace", "5000"]);

        let run = InteractiveRunner::new(&config).run();
        assert_eq!(ProcessExitStatus::Normal(0), run.outcome.unwrap().exit_status);
        assert_eq!(ProcessExitStatus::Normal(0), run.interactor_outcome.unwrap().exit_status);

        let expected = "0123456789\n".repeat(100_000);
        let content = std::fs::read(&received).unwrap();
        assert_eq!(1_000_000, content.len());
        assert_eq!(&expected.as_bytes()[..1_000_000], &content[..]);
    }

    #[test]
    fn test_startup_failure_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "1", "67108864", "1048576", "true", "/nonexistent/program", "cat", "x", "y",
        ], &[]);

        let run = InteractiveRunner::new(&config).run();
        assert_eq!(ProcessExitStatus::StartupFailed, run.outcome.unwrap().exit_status);

        let (a, b) = fifos_of(&config);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_channel_setup_failure_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &["1", "67108864", "1048576", "true", "cat", "cat", "x", "y"], &[]);
        let (a, b) = fifos_of(&config);
        std::fs::write(&b, b"in the way").unwrap();

        let run = InteractiveRunner::new(&config).run();
        assert!(run.outcome.is_none());
        assert!(run.interactor_outcome.is_none());
        assert!(!a.exists());
        assert_eq!(b"in the way".to_vec(), std::fs::read(&b).unwrap());
    }

    #[test]
    fn test_zero_cpu_time_terminates_main() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "0", "67108864", "1048576", "true", "sh -c 'while :; do :; done'", "cat", "x", "y",
        ], &["--wall-time", "5"]);

        let outcome = InteractiveRunner::new(&config).run().outcome.unwrap();
        assert!(!outcome.exited_normally);
        let sig = outcome.terminating_signal.unwrap();
        assert!(sig == libc::SIGXCPU || sig == libc::SIGKILL, "signal {}", sig);

        let (a, b) = fifos_of(&config);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_memory_limit_defeats_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "5", "67108864", "1048576", "true",
            "sh -c 'x=$(head -c 200000000 /dev/zero | tr \\\\0 a); echo ${#x}'",
            "sh -c cat", "x", "y",
        ], &["--wall-time", "30"]);

        let outcome = InteractiveRunner::new(&config).run().outcome.unwrap();
        assert_ne!(ProcessExitStatus::Normal(0), outcome.exit_status);
    }

    /// Poll until the process whose pid was written to `pid_file` is gone or a zombie.
    fn wait_until_dead(pid_file: &Path) -> bool {
        let pid: i32 = std::fs::read_to_string(pid_file).unwrap().trim().parse().unwrap();
        let timer = Instant::now();
        while timer.elapsed() < Duration::from_secs(5) {
            let alive = std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .map(|stat| stat.rsplit(')').next()
                    .map(|rest| !rest.trim_start().starts_with('Z'))
                    .unwrap_or(false))
                .unwrap_or(false);
            if !alive {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Find `program` in `PATH`.
    fn on_path(program: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }

    #[test]
    fn test_hung_interactor_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "1", "67108864", "1048576", "true", "true",
            "sh -c 'sleep 30 & echo $! > sleeper.pid; wait; :'", "x", "y",
        ], &["--interactor-grace", "500"]);

        let timer = Instant::now();
        let run = InteractiveRunner::new(&config).run();
        assert!(timer.elapsed() < Duration::from_secs(10));

        assert_eq!(ProcessExitStatus::Normal(0), run.outcome.unwrap().exit_status);
        assert_eq!(ProcessExitStatus::RealTimeLimitExceeded,
            run.interactor_outcome.unwrap().exit_status);

        // The `sleep` forked by the interactor goes down with it.
        assert!(wait_until_dead(&dir.path().join("sleeper.pid")));
    }

    #[test]
    fn test_wall_time_kill_takes_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "1", "67108864", "1048576", "true",
            "sh -c 'sleep 30 & echo $! > sleeper.pid; wait; :'", "sh -c cat", "x", "y",
        ], &["--wall-time", "1"]);

        let outcome = InteractiveRunner::new(&config).run().outcome.unwrap();
        assert_eq!(ProcessExitStatus::RealTimeLimitExceeded, outcome.exit_status);
        assert_eq!(Some(libc::SIGKILL), outcome.terminating_signal);

        assert!(wait_until_dead(&dir.path().join("sleeper.pid")));
    }

    #[test]
    fn test_allocation_failure_that_aborts_is_signaled() {
        // Needs an interpreter that reports allocation failure as a catchable error.
        if !on_path("python3") {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "5", "134217728", "1048576", "true",
            "python3 -c 'import os\ntry:\n    bytearray(400000000)\nexcept MemoryError:\n    os.abort()'",
            "sh -c cat", "x", "y",
        ], &["--wall-time", "30"]);

        let outcome = InteractiveRunner::new(&config).run().outcome.unwrap();
        assert!(!outcome.exited_normally);
        assert_eq!(Some(libc::SIGABRT), outcome.terminating_signal);
    }

    #[test]
    fn test_baseline_survives_its_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, &[
            "1", "67108864", "1048576", "sh -c 'while :; do :; done'", "cat", "cat", "x", "y",
        ], &[]);

        let baseline = BaselineProbe::new(&config).run().unwrap();
        assert_eq!(ProcessExitStatus::CPUTimeLimitExceeded, baseline.exit_status);
        assert!(baseline.usage.cpu_time >= Duration::from_millis(900));
    }

    #[test]
    fn test_baseline_with_unknown_user_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, &["1", "67108864", "1048576", "true", "cat", "cat", "x", "y"], &[]);
        config.identities = IdentityMap::new("no-such-user-for-harness-tests", "judge");

        assert!(BaselineProbe::new(&config).run().is_none());
    }
}
