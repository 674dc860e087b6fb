//! This module implements `PipePairChannel`, a duplex byte channel made of two named FIFOs that
//! connects the standard streams of two sandboxed processes.
//!
//! The channel is wired purely through the filesystem namespace. One side reads `<prefix>1` and
//! writes `<prefix>2`, the other side does the mirror image. Backpressure is whatever the kernel
//! FIFO buffer provides.
//!

use std::fs::Permissions;
use std::path::{Path, PathBuf};

use std::os::unix::fs::{FileTypeExt, PermissionsExt};

use nix::errno::Errno;
use nix::sys::stat::Mode;

use super::{ErrorKind, ResultExt, Result};

/// Permission bits of both FIFOs. Both the unprivileged and the judge identity read and write
/// them, so the mode is applied explicitly after creation regardless of the umask.
pub const FIFO_MODE: u32 = 0o666;

/// A pair of named FIFOs owned by one interactive execution.
///
/// Both FIFOs exist once `create` returns. They are removed by `teardown`, or when the channel is
/// dropped, whichever comes first.
#[derive(Debug)]
pub struct PipePairChannel {
    /// The caller supplied name prefix.
    name_prefix: String,

    /// Path to `<prefix>1`.
    fifo_a_path: PathBuf,

    /// Path to `<prefix>2`.
    fifo_b_path: PathBuf,

    /// Whether the FIFOs have been torn down already.
    torn_down: bool,
}

/// Create a FIFO at the given path. An existing FIFO at the path is reused, any other existing
/// file is an error.
fn make_fifo(path: &Path) -> Result<()> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(FIFO_MODE as _)) {
        Ok(()) => (),
        Err(nix::Error::Sys(Errno::EEXIST)) => {
            let file_type = std::fs::symlink_metadata(path)
                .chain_err(|| ErrorKind::ChannelSetupFailed(path.display().to_string()))?
                .file_type();
            if !file_type.is_fifo() {
                bail!(ErrorKind::ChannelSetupFailed(path.display().to_string()));
            }
            warn!("Reusing stale FIFO at {}", path.display());
        },
        Err(e) => return Err(e)
            .chain_err(|| ErrorKind::ChannelSetupFailed(path.display().to_string()))
    };

    std::fs::set_permissions(path, Permissions::from_mode(FIFO_MODE))
        .chain_err(|| ErrorKind::ChannelSetupFailed(path.display().to_string()))?;

    Ok(())
}

/// Remove the file at the given path, logging but otherwise ignoring any failure.
fn remove_best_effort(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => trace!("Removed FIFO {}", path.display()),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => warn!("Cannot remove FIFO {}: {}", path.display(), e)
    }
}

impl PipePairChannel {
    /// Create the two FIFOs `<prefix>1` and `<prefix>2`. If the second FIFO cannot be created the
    /// first one is removed again before the error is returned.
    pub fn create<T>(name_prefix: T) -> Result<PipePairChannel>
        where T: Into<String> {
        let name_prefix = name_prefix.into();
        let mut channel = PipePairChannel {
            fifo_a_path: PathBuf::from(format!("{}1", name_prefix)),
            fifo_b_path: PathBuf::from(format!("{}2", name_prefix)),
            name_prefix,
            torn_down: true,
        };

        make_fifo(&channel.fifo_a_path)?;
        if let Err(e) = make_fifo(&channel.fifo_b_path) {
            remove_best_effort(&channel.fifo_a_path);
            return Err(e);
        }
        debug!("Created FIFO pair {} / {}",
            channel.fifo_a_path.display(), channel.fifo_b_path.display());

        channel.torn_down = false;
        Ok(channel)
    }

    /// Derive a name prefix that cannot collide with a concurrent invocation on the same host, by
    /// appending the calling process's ID to `base`.
    pub fn unique_prefix(base: &str) -> String {
        format!("{}.{}.", base, nix::unistd::getpid())
    }

    /// Get the name prefix of the channel.
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Path to FIFO `<prefix>1`.
    pub fn fifo_a(&self) -> &Path {
        &self.fifo_a_path
    }

    /// Path to FIFO `<prefix>2`.
    pub fn fifo_b(&self) -> &Path {
        &self.fifo_b_path
    }

    /// The FIFO the main solution reads as its standard input.
    pub fn main_input(&self) -> &Path {
        self.fifo_a()
    }

    /// The FIFO the main solution writes as its standard output.
    pub fn main_output(&self) -> &Path {
        self.fifo_b()
    }

    /// The FIFO the interactor reads as its standard input.
    pub fn interactor_input(&self) -> &Path {
        self.fifo_b()
    }

    /// The FIFO the interactor writes as its standard output.
    pub fn interactor_output(&self) -> &Path {
        self.fifo_a()
    }

    /// Remove both FIFOs. Removal is best effort and calling this more than once is harmless.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }

        remove_best_effort(&self.fifo_a_path);
        remove_best_effort(&self.fifo_b_path);
        self.torn_down = true;
    }
}

impl Drop for PipePairChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}
