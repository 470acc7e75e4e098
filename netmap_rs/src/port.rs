use std::collections::HashSet;
use std::ffi::CString;
use std::ops::RangeInclusive;
use std::os::fd::BorrowedFd;
use std::sync::{LazyLock, Mutex};

use netmap_sys::{
    NIOCRXSYNC, NIOCTXSYNC, NR_REG_ALL_NIC, NR_REG_ONE_NIC, netmap_if, netmap_ring, nmport_close,
    nmport_d, nmport_open_desc, nmport_prepare,
};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::errors::{Error, Result};
use crate::ring::RawRing;

static OPEN_PORTS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Claims `spec` for this process. Two handles on the same rings would
/// corrupt each other's cursors.
fn claim(spec: &str) -> bool {
    match OPEN_PORTS.lock() {
        Ok(mut ports) => ports.insert(spec.to_owned()),
        Err(_) => false,
    }
}

fn release(spec: &str) {
    if let Ok(mut ports) = OPEN_PORTS.lock() {
        ports.remove(spec);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
}

/// An open netmap port.
///
/// Opening happens in two steps so the caller can restrict the rings
/// between parsing the spec and registering the port.
pub struct Port {
    inner: *mut nmport_d,
    spec: String,
    opened: bool,
}

unsafe impl Send for Port {}

impl Drop for Port {
    fn drop(&mut self) {
        unsafe { nmport_close(self.inner) };
        if self.opened {
            release(&self.spec);
        }
    }
}

impl Port {
    /// Parses `spec` without registering anything.
    pub fn prepare(spec: &str) -> Result<Self> {
        let cstr = CString::new(spec).map_err(|_| Error::BadSpec(spec.to_owned()))?;
        let p = unsafe { nmport_prepare(cstr.as_ptr()) };
        if p.is_null() {
            return Err(Error::BadSpec(spec.to_owned()));
        }
        Ok(Self {
            inner: p,
            spec: spec.to_owned(),
            opened: false,
        })
    }

    /// Prepares and registers `spec` as given.
    pub fn open(spec: &str) -> Result<Self> {
        let mut port = Self::prepare(spec)?;
        port.register()?;
        Ok(port)
    }

    /// Whether the spec binds every hardware ring, i.e. does not already
    /// select a single ring, the host stack or a pipe.
    pub fn binds_all_rings(&self) -> bool {
        unsafe { (*self.inner).reg.nr_mode == NR_REG_ALL_NIC as u32 }
    }

    /// Restricts the port to hardware ring pair `ring`.
    pub fn select_ring(&mut self, ring: u16) {
        unsafe {
            (*self.inner).reg.nr_mode = NR_REG_ONE_NIC as u32;
            (*self.inner).reg.nr_ringid = ring;
        }
        self.spec = format!("{}-{ring}", self.spec);
    }

    /// Registers the prepared port with the kernel and maps its rings.
    pub fn register(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        if !claim(&self.spec) {
            return Err(Error::Busy(self.spec.clone()));
        }
        if unsafe { nmport_open_desc(self.inner) } < 0 {
            release(&self.spec);
            return Err(Error::Open(self.spec.clone(), "can't open descriptor"));
        }
        self.opened = true;
        Ok(())
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw((*self.inner).fd) }
    }

    fn nifp(&self) -> *mut netmap_if {
        unsafe { (*self.inner).nifp }
    }

    pub fn tx_rings(&self) -> RangeInclusive<usize> {
        unsafe { (*self.inner).first_tx_ring as usize..=(*self.inner).last_tx_ring as usize }
    }

    pub fn rx_rings(&self) -> RangeInclusive<usize> {
        unsafe { (*self.inner).first_rx_ring as usize..=(*self.inner).last_rx_ring as usize }
    }

    fn ring_offset(&self, slot: usize) -> isize {
        unsafe { *(*self.nifp()).ring_ofs.as_ptr().add(slot) }
    }

    /// TX ring `index` of the interface.
    pub fn tx_ring(&self, index: usize) -> Result<RawRing> {
        let nifp = self.nifp();
        let total = unsafe { ((*nifp).ni_tx_rings + (*nifp).ni_host_tx_rings) as usize };
        if !self.opened || index >= total {
            return Err(Error::NoSuchRing(index));
        }
        let ptr = unsafe { (nifp as *mut u8).offset(self.ring_offset(index)) as *mut netmap_ring };
        Ok(unsafe { RawRing::from_raw(ptr, index) })
    }

    /// RX ring `index` of the interface.
    pub fn rx_ring(&self, index: usize) -> Result<RawRing> {
        let nifp = self.nifp();
        let (tx, rx) = unsafe {
            (
                ((*nifp).ni_tx_rings + (*nifp).ni_host_tx_rings) as usize,
                ((*nifp).ni_rx_rings + (*nifp).ni_host_rx_rings) as usize,
            )
        };
        if !self.opened || index >= rx {
            return Err(Error::NoSuchRing(index));
        }
        let ptr =
            unsafe { (nifp as *mut u8).offset(self.ring_offset(tx + index)) as *mut netmap_ring };
        Ok(unsafe { RawRing::from_raw(ptr, index) })
    }

    pub fn tx_sync(&self) -> Result<()> {
        let null: *mut libc::c_void = std::ptr::null_mut();
        if unsafe { libc::ioctl((*self.inner).fd, NIOCTXSYNC as _, null) } < 0 {
            return Err(Error::Sync("tx", nix::Error::last()));
        }
        Ok(())
    }

    pub fn rx_sync(&self) -> Result<()> {
        let null: *mut libc::c_void = std::ptr::null_mut();
        if unsafe { libc::ioctl((*self.inner).fd, NIOCRXSYNC as _, null) } < 0 {
            return Err(Error::Sync("rx", nix::Error::last()));
        }
        Ok(())
    }

    /// Waits for `events` on the port descriptor and returns the reported
    /// events alongside the readiness.
    pub fn poll(&self, events: PollFlags, timeout_ms: u16) -> Result<(Readiness, PollFlags)> {
        let mut fds = [PollFd::new(self.fd(), events)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) | Err(nix::Error::EINTR) => Ok((Readiness::Timeout, PollFlags::empty())),
            Ok(_) => Ok((Readiness::Ready, fds[0].revents().unwrap_or(PollFlags::empty()))),
            Err(e) => Err(Error::Poll(e)),
        }
    }
}
