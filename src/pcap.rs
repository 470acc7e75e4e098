//! Injection and capture through libpcap, one handle per worker.

use std::time::Duration;

use pcap::{Active, Capture};
use tracing::{debug, trace};

use crate::api::{Backend, Direction, Error, Readiness, Result, Transport};
use crate::config::{GlobalConfig, TransportKind};
use crate::packet::hexdump;

#[derive(Clone, Debug)]
pub struct PcapFlags {
    pub snaplen: i32,
    pub promiscuous: bool,
    /// Read timeout in milliseconds.
    pub timeout_ms: i32,
    pub immediate: bool,
}

impl Default for PcapFlags {
    fn default() -> Self {
        Self {
            snaplen: 65535,
            promiscuous: true,
            timeout_ms: 1,
            immediate: true,
        }
    }
}

pub struct PcapTransport {
    cap: Capture<Active>,
    worker: usize,
}

impl Transport for PcapTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CaptureInject
    }

    /// Injection never waits; reads wait inside libpcap up to the read
    /// timeout.
    fn poll_ready(&mut self, _dir: Direction, _timeout: Duration) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    fn send_one(&mut self, frame: &[u8]) -> Result<bool> {
        match self.cap.sendpacket(frame) {
            Ok(()) => Ok(true),
            Err(e) => {
                trace!(worker = self.worker, "inject failed: {e}");
                Ok(false)
            }
        }
    }

    fn recv_batch(&mut self, limit: usize, dump: bool) -> Result<usize> {
        let mut received = 0;
        while received < limit {
            match self.cap.next_packet() {
                Ok(pkt) => {
                    if dump {
                        debug!(worker = self.worker, caplen = pkt.header.caplen, "rx\n{}", hexdump(pkt.data));
                    }
                    received += 1;
                }
                Err(pcap::Error::TimeoutExpired) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(received)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct PcapBackend {
    device: String,
    flags: PcapFlags,
}

impl PcapBackend {
    pub fn new(device: impl Into<String>, flags: PcapFlags) -> Self {
        Self {
            device: device.into(),
            flags,
        }
    }
}

impl Backend for PcapBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::CaptureInject
    }

    fn open(&self, _cfg: &GlobalConfig, worker: usize) -> Result<Box<dyn Transport>> {
        let open_err = |e: pcap::Error| Error::Open {
            spec: format!("pcap:{}", self.device),
            reason: e.to_string(),
        };
        let cap = Capture::from_device(self.device.as_str())
            .map_err(open_err)?
            .promisc(self.flags.promiscuous)
            .snaplen(self.flags.snaplen)
            .timeout(self.flags.timeout_ms)
            .immediate_mode(self.flags.immediate)
            .open()
            .map_err(open_err)?;
        trace!(worker, device = %self.device, "pcap handle open");
        Ok(Box::new(PcapTransport { cap, worker }))
    }
}
