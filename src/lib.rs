pub mod affinity;
pub mod api;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod mem;
#[cfg(feature = "netmap")]
pub mod netmap;
pub mod packet;
#[cfg(feature = "pcap")]
pub mod pcap;
pub mod rate;
pub mod report;
pub mod rotate;
pub mod tap;
pub mod worker;

pub use config::GlobalConfig;
pub use coordinator::Coordinator;
pub use report::RunSummary;
