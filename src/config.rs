//! This module maintains the invocation contract of the harness: nine order-significant
//! positional arguments followed by optional flags, collected into an immutable `HarnessConfig`.
//!

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sandbox::{IdentityMap, PipePairChannel, ResourceLimitSpec};

use crate::{ResultExt, Result};

/// Default time the interactor may outlive the main solution, in milliseconds.
const DEFAULT_INTERACTOR_GRACE_MILLIS: u64 = 1000;

/// Provide the configuration of one harness invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct HarnessConfig {
    /// Limits applied to both the main solution and the interactor.
    pub limits: ResourceLimitSpec,

    /// Command of the baseline probe.
    pub baseline_command: String,

    /// Command of the main solution.
    pub main_command: String,

    /// Command of the interactor.
    pub interactor_command: String,

    /// The two test specific arguments appended to the interactor's command.
    pub interactor_args: [String; 2],

    /// Name prefix of the FIFO pair, with the harness pid appended if requested.
    pub fifo_prefix: String,

    /// Users backing the unprivileged identities.
    pub identities: IdentityMap,

    /// Wall clock ceiling on the main solution. `None` if disabled.
    pub wall_time_limit: Option<Duration>,

    /// How long the interactor may outlive the main solution before it is killed.
    pub interactor_grace: Duration,

    /// Working directory of all sandboxed processes.
    pub working_dir: Option<PathBuf>,

    /// File receiving the main solution's stderr. Inherited if `None`.
    pub main_error_file: Option<PathBuf>,

    /// File receiving the interactor's stderr. Inherited if `None`.
    pub interactor_error_file: Option<PathBuf>,

    /// Log verbosity passed to `stderrlog`.
    pub verbosity: usize,

    /// Whether to silence all log output.
    pub quiet: bool,
}

/// Build the command line interface of the harness.
pub fn app() -> clap::App<'static, 'static> {
    clap::App::new("interact-shell")
        .version("0.1.0")
        .author("Lancern <msrlancern@126.com>")
        .about("Run a solution against an interactor through a FIFO pair under resource limits")
        .setting(clap::AppSettings::AllowNegativeNumbers)
        .arg(clap::Arg::with_name("cpu_time_limit")
            .index(1)
            .required(true)
            .value_name("CPU_TIME_LIMIT")
            .help("CPU time limit of the main solution and the interactor, in seconds"))
        .arg(clap::Arg::with_name("memory_limit")
            .index(2)
            .required(true)
            .value_name("MEMORY_LIMIT")
            .help("address space limit, in bytes"))
        .arg(clap::Arg::with_name("output_limit")
            .index(3)
            .required(true)
            .value_name("OUTPUT_LIMIT")
            .help("output file size limit, in bytes"))
        .arg(clap::Arg::with_name("baseline_command")
            .index(4)
            .required(true)
            .value_name("BASELINE_COMMAND")
            .help("command measured to establish the baseline overhead"))
        .arg(clap::Arg::with_name("main_command")
            .index(5)
            .required(true)
            .value_name("MAIN_COMMAND")
            .help("command of the main solution"))
        .arg(clap::Arg::with_name("interactor_command")
            .index(6)
            .required(true)
            .value_name("INTERACTOR_COMMAND")
            .help("command of the interactor"))
        .arg(clap::Arg::with_name("interactor_arg1")
            .index(7)
            .required(true)
            .value_name("INTERACTOR_ARG1")
            .help("first test specific argument of the interactor"))
        .arg(clap::Arg::with_name("interactor_arg2")
            .index(8)
            .required(true)
            .value_name("INTERACTOR_ARG2")
            .help("second test specific argument of the interactor"))
        .arg(clap::Arg::with_name("fifo_prefix")
            .index(9)
            .required(true)
            .value_name("FIFO_PREFIX")
            .help("name prefix of the FIFO pair, <prefix>1 and <prefix>2 are created"))
        .arg(clap::Arg::with_name("unique_fifos")
            .long("unique-fifos")
            .help("append the harness pid to FIFO_PREFIX so concurrent runs cannot collide"))
        .arg(clap::Arg::with_name("nobody_user")
            .long("nobody-user")
            .takes_value(true)
            .value_name("USER")
            .default_value("nobody")
            .help("user executing the baseline probe and the main solution"))
        .arg(clap::Arg::with_name("judge_user")
            .long("judge-user")
            .takes_value(true)
            .value_name("USER")
            .default_value("judge")
            .help("user executing the interactor"))
        .arg(clap::Arg::with_name("wall_time_limit")
            .long("wall-time")
            .takes_value(true)
            .value_name("SECONDS")
            .help("wall clock limit of the main solution, 0 to disable [default: 2 * CPU_TIME_LIMIT + 1]"))
        .arg(clap::Arg::with_name("interactor_grace")
            .long("interactor-grace")
            .takes_value(true)
            .value_name("MILLIS")
            .help("time the interactor may outlive the main solution, in milliseconds [default: 1000]"))
        .arg(clap::Arg::with_name("cwd")
            .long("cwd")
            .takes_value(true)
            .value_name("DIR")
            .help("working directory of the sandboxed processes"))
        .arg(clap::Arg::with_name("error_file")
            .long("error")
            .takes_value(true)
            .value_name("ERROR_FILE")
            .help("file receiving the stderr of the main solution"))
        .arg(clap::Arg::with_name("interactor_error_file")
            .long("interactor-error")
            .takes_value(true)
            .value_name("ERROR_FILE")
            .help("file receiving the stderr of the interactor"))
        .arg(clap::Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("increase log verbosity, may be repeated"))
        .arg(clap::Arg::with_name("quiet")
            .short("q")
            .long("quiet")
            .help("silence all log output"))
}

/// Parse a non-negative integer argument.
fn parse_u64(matches: &clap::ArgMatches<'_>, name: &str) -> Result<u64> {
    let value = matches.value_of(name).unwrap_or_default();
    u64::from_str(value)
        .chain_err(|| format!("invalid {} value: {}", name, value))
}

/// Get the value of an argument that is required or has a default value.
fn value_of(matches: &clap::ArgMatches<'_>, name: &str) -> String {
    matches.value_of(name).unwrap_or_default().to_owned()
}

impl HarnessConfig {
    /// Collect a `HarnessConfig` from parsed command line arguments.
    pub fn from_matches(matches: &clap::ArgMatches<'_>) -> Result<HarnessConfig> {
        let cpu_seconds = parse_u64(matches, "cpu_time_limit")?;
        let limits = ResourceLimitSpec::new(
            cpu_seconds,
            parse_u64(matches, "memory_limit")?,
            parse_u64(matches, "output_limit")?);

        // The default leaves room for the solution to block on its peer without burning CPU.
        let wall_time_seconds = match matches.value_of("wall_time_limit") {
            Some(..) => parse_u64(matches, "wall_time_limit")?,
            None => cpu_seconds.saturating_mul(2).saturating_add(1)
        };
        let wall_time_limit = if wall_time_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(wall_time_seconds))
        };

        let interactor_grace = match matches.value_of("interactor_grace") {
            Some(..) => parse_u64(matches, "interactor_grace")?,
            None => DEFAULT_INTERACTOR_GRACE_MILLIS
        };

        let verbosity = 1 + matches.occurrences_of("verbose") as usize;

        let mut fifo_prefix = value_of(matches, "fifo_prefix");
        if matches.is_present("unique_fifos") {
            fifo_prefix = PipePairChannel::unique_prefix(&fifo_prefix);
        }

        Ok(HarnessConfig {
            limits,
            baseline_command: value_of(matches, "baseline_command"),
            main_command: value_of(matches, "main_command"),
            interactor_command: value_of(matches, "interactor_command"),
            interactor_args: [
                value_of(matches, "interactor_arg1"),
                value_of(matches, "interactor_arg2"),
            ],
            fifo_prefix,
            identities: IdentityMap::new(
                value_of(matches, "nobody_user"),
                value_of(matches, "judge_user")),
            wall_time_limit,
            interactor_grace: Duration::from_millis(interactor_grace),
            working_dir: matches.value_of("cwd").map(PathBuf::from),
            main_error_file: matches.value_of("error_file").map(PathBuf::from),
            interactor_error_file: matches.value_of("interactor_error_file").map(PathBuf::from),
            verbosity,
            quiet: matches.is_present("quiet"),
        })
    }

    /// Parse a `HarnessConfig` from the given command line, including the program name.
    #[cfg(test)]
    pub fn from_args<I, T>(args: I) -> Result<HarnessConfig>
        where I: IntoIterator<Item = T>, T: Into<std::ffi::OsString> + Clone {
        let matches = app().get_matches_from_safe(args)?;
        HarnessConfig::from_matches(&matches)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use crate::ErrorKind;

    const CONTRACT: [&str; 10] = [
        "interact-shell", "1", "67108864", "1048576", "true", "\"cat\"", "cat", "x", "y",
        "/tmp/testpipe",
    ];

    fn with_flags(flags: &[&str]) -> Vec<String> {
        CONTRACT.iter().chain(flags.iter()).map(|s| String::from(*s)).collect()
    }

    #[test]
    fn test_positional_contract() {
        let config = HarnessConfig::from_args(with_flags(&[])).unwrap();
        assert_eq!(ResourceLimitSpec::new(1, 67108864, 1048576), config.limits);
        assert_eq!("true", config.baseline_command);
        // Quotes are stripped when the command is resolved, not here.
        assert_eq!("\"cat\"", config.main_command);
        assert_eq!("cat", config.interactor_command);
        assert_eq!([String::from("x"), String::from("y")], config.interactor_args);
        assert_eq!("/tmp/testpipe", config.fifo_prefix);
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::from_args(with_flags(&[])).unwrap();
        assert_eq!(IdentityMap::default(), config.identities);
        assert_eq!(Some(Duration::from_secs(3)), config.wall_time_limit);
        assert_eq!(Duration::from_millis(1000), config.interactor_grace);
        assert_eq!(None, config.working_dir);
        assert_eq!(None, config.main_error_file);
        assert_eq!(None, config.interactor_error_file);
        assert_eq!(1, config.verbosity);
        assert!(!config.quiet);
    }

    #[test]
    fn test_flags() {
        let config = HarnessConfig::from_args(with_flags(&[
            "--nobody-user", "runner", "--judge-user", "jury", "--wall-time", "0",
            "--interactor-grace", "250", "--cwd", "/srv/box", "--error", "main.err",
            "--interactor-error", "interactor.err", "-vv",
        ])).unwrap();

        assert_eq!(IdentityMap::new("runner", "jury"), config.identities);
        assert_eq!(None, config.wall_time_limit);
        assert_eq!(Duration::from_millis(250), config.interactor_grace);
        assert_eq!(Some(PathBuf::from("/srv/box")), config.working_dir);
        assert_eq!(Some(PathBuf::from("main.err")), config.main_error_file);
        assert_eq!(Some(PathBuf::from("interactor.err")), config.interactor_error_file);
        assert_eq!(3, config.verbosity);
    }

    #[test]
    fn test_unique_fifos_appends_pid() {
        let config = HarnessConfig::from_args(with_flags(&["--unique-fifos"])).unwrap();
        assert_eq!(format!("/tmp/testpipe.{}.", std::process::id()), config.fifo_prefix);

        let config = HarnessConfig::from_args(with_flags(&[])).unwrap();
        assert_eq!("/tmp/testpipe", config.fifo_prefix);
    }

    #[test]
    fn test_negative_interactor_argument() {
        let mut args = with_flags(&[]);
        args[7] = String::from("-1");
        let config = HarnessConfig::from_args(args).unwrap();
        assert_eq!("-1", config.interactor_args[0]);
    }

    #[test]
    fn test_zero_limits_are_kept() {
        let mut args = with_flags(&[]);
        args[1] = String::from("0");
        let config = HarnessConfig::from_args(args).unwrap();
        assert_eq!(Some(0), config.limits.cpu_seconds);
        assert_eq!(Some(Duration::from_secs(1)), config.wall_time_limit);
    }

    #[test]
    fn test_missing_positional() {
        match HarnessConfig::from_args(CONTRACT[..9].to_vec()) {
            Err(crate::Error(ErrorKind::Clap(..), _)) => (),
            other => panic!("unexpected result: {:?}", other)
        };
    }

    #[test]
    fn test_invalid_limit() {
        let mut args = with_flags(&[]);
        args[2] = String::from("lots");
        assert!(HarnessConfig::from_args(args).is_err());

        let mut args = with_flags(&[]);
        args[1] = String::from("-3");
        assert!(HarnessConfig::from_args(args).is_err());
    }
}
