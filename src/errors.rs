use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to set affinity to core {core}: {source}")]
    Affinity { core: usize, source: nix::Error },
    #[error("Unable to open {spec}: {reason}")]
    Open { spec: String, reason: String },
    #[error("invalid nthreads mode for {0}: device pins a ring selection")]
    RingPerThread(String),
    #[error("poll error on queue {0}")]
    Poll(usize),
    #[error("Too big packet: {0}")]
    TooBigPacket(usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("can't build packet template: {0}")]
    Template(String),
    #[error("{0} packets are not implemented")]
    Unsupported(&'static str),
    #[error("{0} support is not compiled in")]
    Disabled(&'static str),
    #[error("{0}")]
    Nix(#[from] nix::Error),
    #[error("{0}")]
    Generic(#[from] io::Error),
    #[error("{0}")]
    #[cfg(feature = "netmap")]
    Netmap(#[from] netmap_rs::errors::Error),
    #[error("{0}")]
    #[cfg(feature = "pcap")]
    Pcap(#[from] pcap::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
