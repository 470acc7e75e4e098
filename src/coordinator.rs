//! Spawning, monitoring and joining the workers.

use std::sync::Arc as StdArc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::time::TimeSpec;
use tracing::{error, info, warn};
use triomphe::Arc;

use crate::api::{Backend, Error, Result};
use crate::config::{Device, GlobalConfig, Mode};
use crate::mem::MemBackend;
use crate::packet::PacketTemplate;
use crate::report::{RunSummary, live_pps};
use crate::tap::TapBackend;
use crate::worker::{Worker, WorkerReport, WorkerState};

/// Samples shorter than this are not reported.
const MIN_SAMPLE: Duration = Duration::from_millis(10);

/// The backend that opens `device` for every worker.
pub fn backend_for(device: &Device) -> Result<Box<dyn Backend>> {
    match device {
        Device::Mem { rings } => Ok(Box::new(MemBackend::new(*rings))),
        Device::Tap(path) => Ok(Box::new(TapBackend::open(path)?)),
        #[cfg(feature = "netmap")]
        Device::Netmap(spec) => Ok(Box::new(crate::netmap::NetmapBackend::new(spec.as_str()))),
        #[cfg(not(feature = "netmap"))]
        Device::Netmap(_) => Err(Error::Disabled("netmap")),
        #[cfg(feature = "pcap")]
        Device::Pcap(dev) => Ok(Box::new(crate::pcap::PcapBackend::new(
            dev.as_str(),
            crate::pcap::PcapFlags::default(),
        ))),
        #[cfg(not(feature = "pcap"))]
        Device::Pcap(_) => Err(Error::Disabled("pcap")),
    }
}

/// Run interval over the given reports: earliest start to latest end.
/// Reports without both timestamps are ignored.
pub fn run_interval<'a>(reports: impl IntoIterator<Item = &'a WorkerReport>) -> Duration {
    let mut span: Option<(TimeSpec, TimeSpec)> = None;
    for r in reports {
        let (Some(tic), Some(toc)) = (r.tic, r.toc) else {
            continue;
        };
        span = Some(match span {
            None => (tic, toc),
            Some((lo, hi)) => (lo.min(tic), hi.max(toc)),
        });
    }
    match span {
        Some((lo, hi)) if hi > lo => Duration::from(hi - lo),
        _ => Duration::ZERO,
    }
}

/// Sets `cancel` on every worker; cheap to clone into a signal handler.
#[derive(Clone, Debug)]
pub struct Canceller {
    states: Vec<StdArc<WorkerState>>,
}

impl Canceller {
    pub fn cancel(&self) {
        for s in &self.states {
            s.cancel();
        }
    }
}

struct WorkerHandle {
    state: StdArc<WorkerState>,
    join: Option<JoinHandle<WorkerReport>>,
}

pub struct Coordinator {
    cfg: Arc<GlobalConfig>,
    template: Option<PacketTemplate>,
    workers: Vec<WorkerHandle>,
}

impl Coordinator {
    /// Validates `cfg` against `backend` and sets up the state of every
    /// worker without starting any thread, so a [`Canceller`] can be
    /// installed first.
    pub fn new(cfg: GlobalConfig, backend: &dyn Backend) -> Result<Self> {
        cfg.validate()?;
        if cfg.transport != backend.kind() {
            return Err(Error::Config(format!(
                "transport {:?} does not match the device ({:?})",
                cfg.transport,
                backend.kind()
            )));
        }
        let template = match cfg.mode {
            Mode::Tx => Some(cfg.template()?),
            Mode::Rx => None,
        };
        let cpus = num_cpus::get();
        let workers = (0..cfg.nthreads)
            .map(|i| WorkerHandle {
                state: StdArc::new(WorkerState::new(i, cfg.affinity.core_for(i, cpus))),
                join: None,
            })
            .collect();
        Ok(Self {
            cfg: Arc::new(cfg),
            template,
            workers,
        })
    }

    /// Opens a transport for each worker and starts the ones that opened.
    /// A worker whose transport or thread fails to come up stays unused;
    /// the run goes on without it.
    pub fn launch(&mut self, backend: &dyn Backend) {
        for (i, handle) in self.workers.iter_mut().enumerate() {
            if handle.join.is_some() {
                continue;
            }
            let transport = match backend.open(&self.cfg, i) {
                Ok(t) => t,
                Err(e) => {
                    error!(worker = i, "Unable to open transport: {e}");
                    continue;
                }
            };
            let state = handle.state.clone();
            let worker = Worker::new(state.clone(), self.cfg.clone(), transport, self.template.as_ref());
            state.set_used(true);
            match thread::Builder::new()
                .name(format!("pktgen-{i}"))
                .spawn(move || worker.run())
            {
                Ok(join) => handle.join = Some(join),
                Err(e) => {
                    error!(worker = i, "Unable to create thread: {e}");
                    state.set_used(false);
                }
            }
        }
    }

    /// [`Coordinator::new`] followed by [`Coordinator::launch`].
    pub fn start(cfg: GlobalConfig, backend: &dyn Backend) -> Result<Self> {
        let mut coordinator = Self::new(cfg, backend)?;
        coordinator.launch(backend);
        Ok(coordinator)
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.cfg
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            states: self.workers.iter().map(|w| w.state.clone()).collect(),
        }
    }

    /// Packets handled so far, summed over all workers.
    pub fn total(&self) -> u64 {
        self.workers.iter().map(|w| w.state.count()).sum()
    }

    fn running(&self) -> bool {
        self.workers.iter().any(|w| w.state.used())
    }

    /// Logs the aggregate rate every report interval until no worker is
    /// running.
    pub fn monitor(&self) {
        let mut prev = Instant::now();
        let mut prev_count = 0u64;
        loop {
            thread::sleep(self.cfg.report_interval);
            let done = !self.running();
            let now = Instant::now();
            let elapsed = now - prev;
            if elapsed >= MIN_SAMPLE {
                let count = self.total();
                let npkts = count.saturating_sub(prev_count);
                let usec = elapsed.as_micros() as u64;
                info!("{} pps ({} pkts in {} usec)", live_pps(npkts, usec), npkts, usec);
                prev = now;
                prev_count = count;
            }
            if done {
                break;
            }
        }
    }

    /// Joins every started worker and aggregates over those that
    /// completed.
    pub fn join(self) -> RunSummary {
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut packets = 0u64;
        for w in self.workers {
            let report = match w.join.map(JoinHandle::join) {
                Some(Ok(r)) => r,
                Some(Err(_)) => {
                    error!(worker = w.state.index, "worker panicked");
                    WorkerReport::default()
                }
                None => WorkerReport::default(),
            };
            packets += w.state.count();
            if w.state.completed() {
                reports.push(report);
            } else {
                warn!("thread {} exited with error", w.state.index);
            }
        }
        RunSummary {
            mode: self.cfg.mode,
            packets,
            pkt_size: self.cfg.pkt_size,
            elapsed: run_interval(&reports),
            workers: self.cfg.nthreads,
            completed: reports.len(),
        }
    }

    /// Starts, monitors and joins.
    pub fn run(cfg: GlobalConfig, backend: &dyn Backend) -> Result<RunSummary> {
        let coordinator = Self::start(cfg, backend)?;
        coordinator.monitor();
        Ok(coordinator.join())
    }
}
