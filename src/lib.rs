pub mod api;
pub mod barrier;
pub mod bypass;
pub mod clock;
pub mod config;
#[cfg(feature = "dpdk")]
pub mod dpdk;
pub mod errors;
pub mod flow;
pub mod hugepages;
pub mod packet;
pub mod poll;
pub mod pool;
pub mod ring;
pub mod soft;
pub mod stats;
pub mod worker;
