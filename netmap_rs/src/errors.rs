use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("can't open {0}: {1}")]
    Open(String, &'static str),
    #[error("port {0} is already open in this process")]
    Busy(String),
    #[error("{0} is not a valid port spec")]
    BadSpec(String),
    #[error("ring {0} out of range")]
    NoSuchRing(usize),
    #[error("{0} sync failed: {1}")]
    Sync(&'static str, nix::Error),
    #[error("poll failed: {0}")]
    Poll(nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
