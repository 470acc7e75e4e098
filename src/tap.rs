//! Raw `write(2)`/`read(2)` transport on any openable path: a tap device,
//! a FIFO, `/dev/null`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};

use crate::api::{Backend, Direction, Error, Readiness, Result, Transport};
use crate::config::{GlobalConfig, TransportKind};
use crate::packet::{MAX_PKT_SIZE, hexdump};

pub struct TapTransport {
    file: File,
    worker: usize,
    rx_buf: Vec<u8>,
}

impl TapTransport {
    pub fn new(file: File, worker: usize) -> Self {
        Self {
            file,
            worker,
            rx_buf: vec![0; MAX_PKT_SIZE],
        }
    }
}

/// Milliseconds for `poll(2)`, saturating.
fn poll_timeout(timeout: Duration) -> PollTimeout {
    PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX))
}

impl Transport for TapTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RawWrite
    }

    fn poll_ready(&mut self, dir: Direction, timeout: Duration) -> Result<Readiness> {
        let events = match dir {
            Direction::Tx => PollFlags::POLLOUT,
            Direction::Rx => PollFlags::POLLIN,
        };
        let mut fds = [PollFd::new(self.file.as_fd(), events)];
        let n = match poll(&mut fds, poll_timeout(timeout)) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => return Ok(Readiness::Timeout),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(Readiness::Timeout);
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Err(Error::Poll(self.worker));
        }
        Ok(Readiness::Ready)
    }

    fn send_one(&mut self, frame: &[u8]) -> Result<bool> {
        match self.file.write(frame) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv_batch(&mut self, limit: usize, dump: bool) -> Result<usize> {
        let mut received = 0;
        while received < limit {
            match self.file.read(&mut self.rx_buf) {
                Ok(0) => break,
                Ok(n) => {
                    if dump {
                        debug!(worker = self.worker, "rx\n{}", hexdump(&self.rx_buf[..n]));
                    }
                    received += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(received)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Opens the path once and hands every worker its own duplicate of the
/// descriptor.
#[derive(Debug)]
pub struct TapBackend {
    path: PathBuf,
    file: File,
}

impl TapBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&path)
            .map_err(|e| Error::Open {
                spec: format!("tap:{}", path.display()),
                reason: e.to_string(),
            })?;
        trace!(path = %path.display(), "tap opened");
        Ok(Self { path, file })
    }
}

impl Backend for TapBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::RawWrite
    }

    fn open(&self, _cfg: &GlobalConfig, worker: usize) -> Result<Box<dyn Transport>> {
        let file = self.file.try_clone().map_err(|e| Error::Open {
            spec: format!("tap:{}", self.path.display()),
            reason: e.to_string(),
        })?;
        Ok(Box::new(TapTransport::new(file, worker)))
    }
}
