//! This module implements the privilege separation boundary of the sandbox: resolution of named
//! user identities into credentials, and the `PrivilegeDroppedCommand` type which binds a command
//! line to the identity it must execute under.
//!

use std::ffi::{CStr, CString};

use nix::errno::Errno;
use nix::unistd::{Uid, Gid};

use super::{Error, ErrorKind, Result, ProcessBuilder};
use crate::misc;

/// Initial size of the buffer handed to `getpwnam_r` and `getpwuid_r`.
const PASSWD_BUFFER_LEN: usize = 4096;

/// Upper bound on the buffer size tried before giving up on a `passwd` lookup.
const PASSWD_BUFFER_MAX_LEN: usize = 1024 * 1024;

/// The unprivileged identities a sandboxed command can be executed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Identity {
    /// Identity for contestant supplied code and the baseline probe.
    Nobody,

    /// Identity for trusted judge side code, i.e. the interactor.
    Judge,
}

/// Map each `Identity` to the name of the host user account that backs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityMap {
    /// User name backing `Identity::Nobody`.
    pub nobody: String,

    /// User name backing `Identity::Judge`.
    pub judge: String,
}

impl IdentityMap {
    /// Create a new `IdentityMap` instance.
    pub fn new<T1, T2>(nobody: T1, judge: T2) -> Self
        where T1: Into<String>, T2: Into<String> {
        IdentityMap {
            nobody: nobody.into(),
            judge: judge.into(),
        }
    }

    /// Get the user name backing the given identity.
    pub fn user_name(&self, identity: Identity) -> &str {
        match identity {
            Identity::Nobody => &self.nobody,
            Identity::Judge => &self.judge,
        }
    }

    /// Resolve the credentials of the user backing the given identity.
    pub fn credentials(&self, identity: Identity) -> Result<Credentials> {
        Credentials::lookup(self.user_name(identity))
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        IdentityMap::new("nobody", "judge")
    }
}

/// Credentials of a host user account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Name of the user.
    pub name: String,

    /// User ID.
    pub uid: Uid,

    /// Primary group ID.
    pub gid: Gid,
}

/// Run a reentrant `passwd` lookup, growing the scratch buffer on `ERANGE`. `lookup` receives the
/// output record, the buffer and the result pointer, and returns the native error code.
fn passwd_lookup<F>(mut lookup: F) -> std::io::Result<Option<(String, Uid, Gid)>>
    where F: FnMut(&mut libc::passwd, &mut [libc::c_char], &mut *mut libc::passwd) -> libc::c_int {
    let mut buffer_len = PASSWD_BUFFER_LEN;
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buffer = vec![0 as libc::c_char; buffer_len];
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let ret = lookup(&mut pwd, &mut buffer, &mut result);
        if ret == libc::ERANGE && buffer_len < PASSWD_BUFFER_MAX_LEN {
            buffer_len *= 2;
            continue;
        }
        if ret != 0 {
            return Err(std::io::Error::from_raw_os_error(ret));
        }
        if result.is_null() {
            return Ok(None);
        }

        let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned();
        return Ok(Some((name, Uid::from_raw(pwd.pw_uid), Gid::from_raw(pwd.pw_gid))));
    }
}

impl Credentials {
    /// Look up the credentials of the user with the given name. Returns
    /// `Err(ErrorKind::UnknownUser(..))` if there is no such user.
    pub fn lookup(name: &str) -> Result<Credentials> {
        let native_name = CString::new(name)
            .map_err(|_| Error::from(ErrorKind::UnknownUser(name.to_owned())))?;

        let entry = passwd_lookup(|pwd, buffer, result| unsafe {
            libc::getpwnam_r(native_name.as_ptr(), pwd, buffer.as_mut_ptr(), buffer.len(), result)
        })?;

        match entry {
            Some((_, uid, gid)) => Ok(Credentials { name: name.to_owned(), uid, gid }),
            None => {
                debug!("No passwd entry for user \"{}\"", name);
                bail!(ErrorKind::UnknownUser(name.to_owned()))
            }
        }
    }

    /// Get the credentials of the user the calling process runs as.
    pub fn current() -> Result<Credentials> {
        let uid = nix::unistd::geteuid();
        let entry = passwd_lookup(|pwd, buffer, result| unsafe {
            libc::getpwuid_r(uid.as_raw(), pwd, buffer.as_mut_ptr(), buffer.len(), result)
        })?;

        match entry {
            Some((name, uid, gid)) => Ok(Credentials { name, uid, gid }),
            None => bail!(ErrorKind::UnknownUser(format!("uid {}", uid)))
        }
    }

    /// Check whether the calling process already runs with exactly these credentials.
    pub fn is_current(&self) -> bool {
        nix::unistd::getuid() == self.uid && nix::unistd::geteuid() == self.uid
            && nix::unistd::getgid() == self.gid && nix::unistd::getegid() == self.gid
    }

    /// Switch the calling process to these credentials. This function is called in the child
    /// process after `fork`. It fails if the switch is not permitted or does not stick, in which
    /// case the caller must not go on to execute the command.
    pub(crate) fn switch_to(&self) -> nix::Result<()> {
        if self.is_current() {
            return Ok(());
        }

        nix::unistd::setgroups(&[self.gid])?;
        nix::unistd::setgid(self.gid)?;
        nix::unistd::setuid(self.uid)?;

        if !self.is_current() {
            return Err(nix::Error::Sys(Errno::EPERM));
        }

        Ok(())
    }
}

/// A command line bound to the unprivileged identity it must execute under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivilegeDroppedCommand {
    /// The command line with one layer of enclosing quotes stripped.
    raw_command: String,

    /// The identity to execute the command under.
    identity: Identity,
}

impl PrivilegeDroppedCommand {
    /// Create a new `PrivilegeDroppedCommand` from raw argument text. One layer of matching
    /// enclosing quote characters is stripped. Returns `Err(ErrorKind::EmptyCommand)` if nothing
    /// remains to be executed.
    pub fn new<T>(raw_command: T, identity: Identity) -> Result<Self>
        where T: AsRef<str> {
        let command = misc::strip_enclosing_quotes(raw_command.as_ref());
        if command.trim().is_empty() {
            bail!(ErrorKind::EmptyCommand);
        }

        Ok(PrivilegeDroppedCommand {
            raw_command: command.to_owned(),
            identity
        })
    }

    /// Get the command line, without enclosing quotes.
    pub fn command(&self) -> &str {
        &self.raw_command
    }

    /// Get the identity the command will execute under.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Split the command line into an argument vector.
    pub fn argv(&self) -> Result<Vec<String>> {
        let argv = match misc::split_command_line(&self.raw_command) {
            Some(argv) => argv,
            None => {
                debug!("Unbalanced quotes in command: \"{}\"", self.raw_command);
                bail!(ErrorKind::InvalidProcessArgument)
            }
        };
        if argv.is_empty() {
            bail!(ErrorKind::EmptyCommand);
        }

        Ok(argv)
    }

    /// Render the command in the equivalent `sudo` form, e.g. `sudo -u nobody ./a.out`.
    pub fn describe(&self, identities: &IdentityMap) -> String {
        format!("sudo -u {} {}", identities.user_name(self.identity), self.raw_command)
    }

    /// Consume the command and produce a `ProcessBuilder` that will execute it under the bound
    /// identity. The user backing the identity is resolved now, in the calling process.
    pub fn resolve(self, identities: &IdentityMap) -> Result<ProcessBuilder> {
        let argv = self.argv()?;
        let credentials = identities.credentials(self.identity)?;
        trace!("Resolved identity {:?} to {:?}", self.identity, credentials);

        let mut args = argv.into_iter();
        let mut builder = match args.next() {
            Some(file) => ProcessBuilder::new(file),
            None => bail!(ErrorKind::EmptyCommand)
        };
        for arg in args {
            builder.add_arg(arg)?;
        }
        builder.credentials = Some(credentials);

        Ok(builder)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_quotes_are_stripped() {
        let cmd = PrivilegeDroppedCommand::new("\"echo hi\"", Identity::Nobody).unwrap();
        assert_eq!("echo hi", cmd.command());
        assert_eq!(vec![String::from("echo"), String::from("hi")], cmd.argv().unwrap());

        let cmd = PrivilegeDroppedCommand::new("echo hi", Identity::Judge).unwrap();
        assert_eq!("echo hi", cmd.command());
        assert_eq!(Identity::Judge, cmd.identity());
    }

    #[test]
    fn test_empty_command_is_rejected() {
        for raw in &["", "   ", "\"\"", "' '"] {
            match PrivilegeDroppedCommand::new(raw, Identity::Nobody) {
                Err(Error(ErrorKind::EmptyCommand, _)) => (),
                other => panic!("unexpected result for {:?}: {:?}", raw, other)
            }
        }
    }

    #[test]
    fn test_describe_uses_backing_user() {
        let identities = IdentityMap::new("runner", "jury");
        let main = PrivilegeDroppedCommand::new("'./a.out'", Identity::Nobody).unwrap();
        let interactor = PrivilegeDroppedCommand::new("./interactor", Identity::Judge).unwrap();
        assert_eq!("sudo -u runner ./a.out", main.describe(&identities));
        assert_eq!("sudo -u jury ./interactor", interactor.describe(&identities));
    }

    #[test]
    fn test_identity_map_defaults() {
        let identities = IdentityMap::default();
        assert_eq!("nobody", identities.user_name(Identity::Nobody));
        assert_eq!("judge", identities.user_name(Identity::Judge));
    }

    #[test]
    fn test_lookup_unknown_user() {
        match Credentials::lookup("no-such-user-for-sandbox-tests") {
            Err(Error(ErrorKind::UnknownUser(name), _)) =>
                assert_eq!("no-such-user-for-sandbox-tests", name),
            other => panic!("unexpected result: {:?}", other)
        }
    }

    #[test]
    fn test_current_credentials_round_trip() {
        let current = Credentials::current().unwrap();
        assert_eq!(nix::unistd::geteuid(), current.uid);
        assert_eq!(current, Credentials::lookup(&current.name).unwrap());
    }

    #[test]
    fn test_resolve_binds_credentials() {
        let current = Credentials::current().unwrap();
        let identities = IdentityMap::new(current.name.clone(), current.name.clone());
        let builder = PrivilegeDroppedCommand::new("cat x y", Identity::Judge).unwrap()
            .resolve(&identities)
            .unwrap();
        assert_eq!(Some(current), builder.credentials);
        assert_eq!(&["cat", "x", "y"], builder.args());
    }
}
