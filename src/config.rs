//! Interface and queue configuration.
//!
//! An [`IfaceConfig`] describes one capture interface. It is consumed once by
//! [`IfaceConfig::into_queues`], which hands every receive thread its own
//! [`QueueConfig`].

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicU16;
use std::time::Duration;

use triomphe::Arc as TArc;

use crate::api::Result;
use crate::barrier::WorkerSync;
use crate::bypass::BypassChannel;
use crate::errors::Error;
use crate::ring::Ring;
use crate::stats::LiveDevice;

/// Where a receive thread takes its packets from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpMode {
    /// Directly from a NIC queue.
    #[default]
    EthDev,
    /// From a ring fed by another process or thread owning the NIC.
    Ring,
}

/// What happens to a packet after inspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CopyMode {
    /// Packets are only inspected.
    #[default]
    None,
    /// Every packet is forwarded to the peer port.
    Tap,
    /// Packets are forwarded unless the pipeline dropped them.
    Ips,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Verify checksums in software.
    #[default]
    Enable,
    Disable,
    /// Trust the NIC's checksum verdicts.
    Offload,
}

macro_rules! impl_from_str {
    ($ty:ident { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(Error::Config(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

impl_from_str!(OpMode { "ethdev" => EthDev, "ring" => Ring });
impl_from_str!(CopyMode { "none" => None, "tap" => Tap, "ips" => Ips });
impl_from_str!(ChecksumMode { "enable" => Enable, "disable" => Disable, "offload" => Offload });

/// Thresholds of the empty-poll backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdlePolicy {
    /// Empty polls tolerated before backing off at all.
    pub min_zero_poll_count: u32,
    /// Empty polls after which the standard sleep applies.
    pub zero_poll_count_to_sleep: u32,
    pub min_sleep_us: u32,
    pub standard_sleep_us: u32,
    /// Upper bound of one wait for an RX interrupt.
    pub max_epoll_timeout: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            min_zero_poll_count: 10,
            zero_poll_count_to_sleep: 10,
            min_sleep_us: 1,
            standard_sleep_us: 100,
            max_epoll_timeout: Duration::from_millis(500),
        }
    }
}

/// Rings served by one receive thread in ring mode.
pub struct QueueRings<B> {
    pub rx: TArc<Ring<B>>,
    pub tx: Option<TArc<Ring<B>>>,
    pub bypass: Option<BypassChannel>,
}

impl<B> QueueRings<B> {
    pub fn new(rx: TArc<Ring<B>>) -> Self {
        Self {
            rx,
            tx: None,
            bypass: None,
        }
    }

    pub fn with_tx(mut self, tx: TArc<Ring<B>>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn with_bypass(mut self, bypass: BypassChannel) -> Self {
        self.bypass = Some(bypass);
        self
    }
}

/// Settings shared by every queue of an interface.
#[derive(Clone, Debug)]
pub struct IfaceSettings {
    pub iface: String,
    pub port_id: u16,
    pub out_iface: Option<String>,
    pub out_port_id: Option<u16>,
    /// NUMA node the port is attached to, when known.
    pub socket_id: Option<u32>,
    pub threads: u16,
    pub copy_mode: CopyMode,
    pub checksum_mode: ChecksumMode,
    pub interrupts: bool,
    pub op_mode: OpMode,
    pub idle: IdlePolicy,
    /// Packet objects preallocated per thread.
    pub packet_pool_size: usize,
}

impl Default for IfaceSettings {
    fn default() -> Self {
        Self {
            iface: String::new(),
            port_id: 0,
            out_iface: None,
            out_port_id: None,
            socket_id: None,
            threads: 1,
            copy_mode: CopyMode::None,
            checksum_mode: ChecksumMode::Enable,
            interrupts: false,
            op_mode: OpMode::EthDev,
            idle: IdlePolicy::default(),
            packet_pool_size: 1024,
        }
    }
}

pub struct IfaceConfig<B> {
    pub settings: IfaceSettings,
    /// One entry per thread in ring mode, empty otherwise.
    pub rings: Vec<QueueRings<B>>,
}

impl<B> Default for IfaceConfig<B> {
    fn default() -> Self {
        Self {
            settings: IfaceSettings::default(),
            rings: Vec::new(),
        }
    }
}

impl<B> IfaceConfig<B> {
    pub fn new(settings: IfaceSettings) -> Self {
        Self {
            settings,
            rings: Vec::new(),
        }
    }

    pub fn with_rings(mut self, rings: Vec<QueueRings<B>>) -> Self {
        self.rings = rings;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if s.threads == 0 {
            return Err(Error::Config(format!("{}: at least one thread is required", s.iface)));
        }
        if s.packet_pool_size == 0 {
            return Err(Error::Config(format!("{}: packet pool size must not be 0", s.iface)));
        }
        if s.idle.zero_poll_count_to_sleep < s.idle.min_zero_poll_count {
            return Err(Error::Config(format!(
                "{}: zero poll count to sleep ({}) is below the minimum zero poll count ({})",
                s.iface, s.idle.zero_poll_count_to_sleep, s.idle.min_zero_poll_count
            )));
        }

        match s.op_mode {
            OpMode::EthDev => {
                if s.copy_mode != CopyMode::None && s.out_port_id.is_none() {
                    return Err(Error::Config(format!(
                        "{}: copy mode {:?} needs an output port",
                        s.iface, s.copy_mode
                    )));
                }
                if !self.rings.is_empty() {
                    return Err(Error::Config(format!(
                        "{}: rings are only used in ring mode",
                        s.iface
                    )));
                }
            }
            OpMode::Ring => {
                if self.rings.len() != s.threads as usize {
                    return Err(Error::Config(format!(
                        "{}: {} threads but {} ring sets",
                        s.iface,
                        s.threads,
                        self.rings.len()
                    )));
                }
                if s.copy_mode != CopyMode::None && self.rings.iter().any(|r| r.tx.is_none()) {
                    return Err(Error::Config(format!(
                        "{}: copy mode {:?} needs a TX ring on every queue",
                        s.iface, s.copy_mode
                    )));
                }
                if s.interrupts {
                    return Err(Error::Config(format!(
                        "{}: interrupt mode is only available on devices",
                        s.iface
                    )));
                }
            }
        }
        Ok(())
    }

    /// Splits the interface into one configuration per receive thread.
    pub fn into_queues(self) -> Result<Vec<QueueConfig<B>>> {
        self.validate()?;

        let IfaceConfig { settings, rings } = self;
        let sync = Arc::new(WorkerSync::new(settings.threads));
        let livedev = Arc::new(LiveDevice::new(settings.iface.clone()));
        let numa_mismatch = Arc::new(AtomicU16::new(0));

        let mut rings = rings.into_iter();
        let queues = (0..settings.threads)
            .map(|queue_id| QueueConfig {
                settings: settings.clone(),
                queue_id,
                rings: rings.next(),
                sync: Arc::clone(&sync),
                livedev: Arc::clone(&livedev),
                numa_mismatch: Arc::clone(&numa_mismatch),
            })
            .collect();
        Ok(queues)
    }
}

/// Everything one receive thread needs, moved into that thread.
pub struct QueueConfig<B> {
    pub settings: IfaceSettings,
    pub queue_id: u16,
    pub rings: Option<QueueRings<B>>,
    pub sync: Arc<WorkerSync>,
    pub livedev: Arc<LiveDevice>,
    /// Threads of the interface running on a foreign NUMA node.
    pub numa_mismatch: Arc<AtomicU16>,
}

impl<B> QueueConfig<B> {
    /// The highest queue id starts the device once its peers are set up.
    pub fn is_last(&self) -> bool {
        self.queue_id + 1 == self.settings.threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rings(n: usize) -> Vec<QueueRings<u32>> {
        (0..n)
            .map(|i| QueueRings::new(TArc::new(Ring::new(format!("rx{i}"), 8))))
            .collect()
    }

    #[test]
    fn test_into_queues_shares_sync() {
        let cfg: IfaceConfig<u32> = IfaceConfig::new(IfaceSettings {
            iface: "soft0".into(),
            threads: 3,
            ..Default::default()
        });
        let queues = cfg.into_queues().unwrap();
        assert_eq!(queues.len(), 3);
        assert!(Arc::ptr_eq(&queues[0].sync, &queues[2].sync));
        assert_eq!(queues[0].sync.worker_cnt(), 3);
        assert!(!queues[1].is_last());
        assert!(queues[2].is_last());
        assert!(queues.iter().all(|q| q.rings.is_none()));
    }

    #[test]
    fn test_ring_mode_needs_one_ring_set_per_thread() {
        let settings = IfaceSettings {
            iface: "ring0".into(),
            threads: 2,
            op_mode: OpMode::Ring,
            ..Default::default()
        };
        let cfg = IfaceConfig::new(settings.clone()).with_rings(rings(1));
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = IfaceConfig::new(settings.clone()).with_rings(rings(2));
        let queues = cfg.into_queues().unwrap();
        assert_eq!(queues[1].rings.as_ref().unwrap().rx.name(), "rx1");

        let cfg = IfaceConfig::new(IfaceSettings {
            copy_mode: CopyMode::Ips,
            ..settings
        })
        .with_rings(rings(2));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_copy_mode_needs_out_port() {
        let mut settings = IfaceSettings {
            iface: "soft0".into(),
            copy_mode: CopyMode::Tap,
            ..Default::default()
        };
        assert!(IfaceConfig::<u32>::new(settings.clone()).validate().is_err());
        settings.out_port_id = Some(1);
        assert!(IfaceConfig::<u32>::new(settings).validate().is_ok());
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("IPS".parse::<CopyMode>().unwrap(), CopyMode::Ips);
        assert_eq!("offload".parse::<ChecksumMode>().unwrap(), ChecksumMode::Offload);
        assert_eq!("ring".parse::<OpMode>().unwrap(), OpMode::Ring);
        assert!("bogus".parse::<CopyMode>().is_err());
    }
}
