//! This module provide Rust friendly bindings to the native `rlimit` mechanism, and the
//! `ResourceLimitSpec` value describing the ceilings installed into a sandboxed child before it
//! executes untrusted code.
//!

use libc::rlimit;

/// Represent a resource.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// Maximum size of the process's virtual memory (address space). This
    /// variant corresponds to the `RLIMIT_AS` native constant.
    AddressSpace = libc::RLIMIT_AS,

    /// Limit, in seconds, on the amount of CPU time that the process can
    /// consume. This variant corresponds to the `RLIMIT_CPU` native constant.
    CPUTime = libc::RLIMIT_CPU,

    /// Maximum size, in bytes, of any file the process may create or extend.
    /// This variant corresponds to the `RLIMIT_FSIZE` native constant.
    FileSize = libc::RLIMIT_FSIZE,
}

/// Specify the soft limit and the hard limit for some resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimit {
    /// The soft limit of the resource.
    pub soft_limit: u64,

    /// The hard limit of the resource.
    pub hard_limit: u64
}

impl ResourceLimit {
    /// Convert the `ResourceLimit` structure into native representation.
    fn as_native(&self) -> rlimit {
        rlimit {
            rlim_cur: self.soft_limit as libc::rlim_t,
            rlim_max: self.hard_limit as libc::rlim_t
        }
    }
}

/// Set resource limit for the calling process, using the native `rlimit` mechanism.
pub fn setrlimit(resource: Resource, limit: &ResourceLimit) -> std::io::Result<()> {
    let ret = unsafe { libc::setrlimit(resource as _, &limit.as_native()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Set resource limit for the calling process. The soft limit and the hard
/// limit are both set to the given `limit` value.
pub fn setrlimit_hard(resource: Resource, limit: u64) -> std::io::Result<()> {
    setrlimit(resource, &ResourceLimit {
        soft_limit: limit,
        hard_limit: limit
    })
}

/// Get the current resource limit of the calling process.
pub fn getrlimit(resource: Resource) -> std::io::Result<ResourceLimit> {
    let mut native = rlimit { rlim_cur: 0, rlim_max: 0 };
    let ret = unsafe { libc::getrlimit(resource as _, &mut native) };
    if ret == 0 {
        Ok(ResourceLimit {
            soft_limit: native.rlim_cur as u64,
            hard_limit: native.rlim_max as u64
        })
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Ceilings on CPU time, address space and output size applied to one child process.
///
/// A `None` field leaves the corresponding resource untouched. A limit of `Some(0)` is a hard cap
/// of zero, not "unlimited".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimitSpec {
    /// CPU time ceiling, in seconds.
    pub cpu_seconds: Option<u64>,

    /// Address space ceiling, in bytes.
    pub address_space_bytes: Option<u64>,

    /// Ceiling on the size of files written by the process, in bytes.
    pub output_bytes: Option<u64>,
}

impl ResourceLimitSpec {
    /// Create a `ResourceLimitSpec` that bounds all three resources.
    pub fn new(cpu_seconds: u64, address_space_bytes: u64, output_bytes: u64) -> Self {
        ResourceLimitSpec {
            cpu_seconds: Some(cpu_seconds),
            address_space_bytes: Some(address_space_bytes),
            output_bytes: Some(output_bytes),
        }
    }

    /// Create a `ResourceLimitSpec` that only bounds CPU time.
    pub fn cpu_only(cpu_seconds: u64) -> Self {
        ResourceLimitSpec {
            cpu_seconds: Some(cpu_seconds),
            ..ResourceLimitSpec::default()
        }
    }

    /// Install the limits into the calling process as hard limits.
    ///
    /// This must run in the child, after `fork` and before `exec`.
    pub fn apply(&self) -> std::io::Result<()> {
        if let Some(cpu) = self.cpu_seconds {
            setrlimit_hard(Resource::CPUTime, cpu)?;
        }
        if let Some(bytes) = self.address_space_bytes {
            setrlimit_hard(Resource::AddressSpace, bytes)?;
        }
        if let Some(bytes) = self.output_bytes {
            setrlimit_hard(Resource::FileSize, bytes)?;
        }

        Ok(())
    }
}
