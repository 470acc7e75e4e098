//! Worker-to-core placement.

use std::str::FromStr;

use tracing::debug;

use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AffinityPolicy {
    /// Leave placement to the scheduler.
    #[default]
    None,
    /// Every worker on this core. A core past the last one available
    /// falls back to round-robin.
    Core(usize),
    /// Worker `i` on core `i % cpus`.
    RoundRobin,
}

impl AffinityPolicy {
    /// Core for worker `idx` on a machine with `cpus` cores.
    pub fn core_for(&self, idx: usize, cpus: usize) -> Option<usize> {
        let cpus = cpus.max(1);
        match *self {
            AffinityPolicy::None => None,
            AffinityPolicy::Core(c) if c < cpus => Some(c),
            AffinityPolicy::Core(_) | AffinityPolicy::RoundRobin => Some(idx % cpus),
        }
    }
}

/// `none`, `rr`, or a core number.
impl FromStr for AffinityPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "-1" => Ok(AffinityPolicy::None),
            "rr" => Ok(AffinityPolicy::RoundRobin),
            n => n
                .parse::<usize>()
                .map(AffinityPolicy::Core)
                .map_err(|_| Error::Config(format!("bad affinity {n:?}"))),
        }
    }
}

/// Binds the calling thread to `core`.
#[cfg(target_os = "linux")]
pub fn bind_current(core: usize) -> Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(core).map_err(|source| Error::Affinity { core, source })?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|source| Error::Affinity { core, source })?;
    debug!(core, "thread bound");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_current(core: usize) -> Result<()> {
    Err(Error::Affinity {
        core,
        source: nix::Error::ENOTSUP,
    })
}
