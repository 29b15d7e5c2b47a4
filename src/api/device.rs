//! Poll-mode device interface and the per-port device manager.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use tracing::{error, info};

use super::buffer::BufferHandle;
use super::Result;
use crate::errors::Error;

/// Maximum number of buffers fetched by one poll.
pub const BURST_SIZE: usize = 32;

/// Highest port id (exclusive) the manager keeps locks for.
pub const MAX_PORTS: usize = 32;

/// One poll worth of buffers.
pub type Burst<B> = ArrayVec<B, BURST_SIZE>;

/// Role of this process towards the shared packet memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessRole {
    /// Owns the NIC and the buffer pools.
    Primary,
    /// Attached to pools and rings owned by another process.
    Secondary,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver_name: String,
    pub socket_id: Option<u32>,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
}

/// Port level counters as reported by the NIC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub ibytes: u64,
    pub obytes: u64,
    pub imissed: u64,
    pub ierrors: u64,
    pub oerrors: u64,
    pub rx_nombuf: u64,
}

/// Free running cycle counter (TSC on x86).
pub trait CycleCounter {
    fn cycles(&self) -> u64;

    /// Counter frequency in Hz.
    fn cycles_hz(&self) -> u64;
}

/// The hardware side of the capture loop.
///
/// Every call is non-blocking except [`PollDevice::wait_rx_event`], which is
/// bounded by its timeout, and [`PollDevice::delay_us`].
pub trait PollDevice: CycleCounter + Send + Sync + 'static {
    type Buffer: BufferHandle;

    fn port_name(&self, port: u16) -> Result<String>;

    /// Appends up to the free space of `burst` buffers received on the queue
    /// and returns how many this call added.
    fn rx_burst(&self, port: u16, queue: u16, burst: &mut Burst<Self::Buffer>) -> usize;

    /// Transmits a single buffer; on failure the buffer is handed back.
    fn tx_one(&self, port: u16, queue: u16, buf: Self::Buffer) -> std::result::Result<(), Self::Buffer>;

    fn start(&self, port: u16) -> Result<()>;

    fn stop(&self, port: u16) -> Result<()>;

    fn close(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    fn info(&self, port: u16) -> Result<DeviceInfo>;

    fn stats(&self, port: u16) -> Result<PortStats>;

    /// Extended driver statistics as name/value pairs.
    fn xstats(&self, _port: u16) -> Result<Vec<(String, u64)>> {
        Ok(Vec::new())
    }

    fn stats_reset(&self, port: u16);

    fn supports_rx_interrupts(&self, _port: u16) -> bool {
        false
    }

    /// Registers the queue interrupt with this thread's event set.
    fn rx_intr_register(&self, _port: u16, _queue: u16) -> Result<()> {
        Err(Error::Unsupported("RX interrupts"))
    }

    fn rx_intr_enable(&self, _port: u16, _queue: u16) {}

    fn rx_intr_disable(&self, _port: u16, _queue: u16) {}

    /// Blocks until an RX event arrives for the queue or `timeout` passes.
    /// Returns `true` when woken by an event.
    fn wait_rx_event(&self, _port: u16, _queue: u16, timeout: Duration) -> bool {
        std::thread::sleep(timeout);
        false
    }

    /// Driver specific actions that need a started port.
    fn post_start(&self, _port: u16, _info: &DeviceInfo, _threads: u16) {}

    /// Driver specific cleanup before a port stops.
    fn pre_stop(&self, _port: u16, _info: &DeviceInfo) {}

    fn process_role(&self) -> ProcessRole {
        ProcessRole::Primary
    }

    /// NUMA node of the calling thread, if known.
    fn current_socket_id(&self) -> Option<u32> {
        None
    }

    /// Busy-waits for `us` microseconds.
    fn delay_us(&self, us: u32) {
        let until = Instant::now() + Duration::from_micros(us as u64);
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }
}

/// Shared owner of a [`PollDevice`] and of the per-port interrupt locks.
///
/// Several queue threads of one port may arm or disarm interrupts at the same
/// time; the lock for that port serializes them.
pub struct DeviceManager<D> {
    device: Arc<D>,
    intr_locks: Box<[Mutex<()>]>,
}

impl<D: PollDevice> DeviceManager<D> {
    pub fn new(device: D) -> Self {
        Self::from_arc(Arc::new(device))
    }

    pub fn from_arc(device: Arc<D>) -> Self {
        let intr_locks = (0..MAX_PORTS).map(|_| Mutex::new(())).collect();
        Self { device, intr_locks }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Port name, or a synthetic one when the device can't resolve it.
    pub fn port_name(&self, port: u16) -> String {
        self.device
            .port_name(port)
            .unwrap_or_else(|_| format!("port{port}"))
    }

    /// Registers the RX interrupt of `queue` for this thread.
    pub fn interrupts_rx_enable(&self, port: u16, queue: u16) -> Result<()> {
        self.device.rx_intr_register(port, queue).inspect_err(|e| {
            error!("{}-Q{}: failed to enable interrupt mode: {}", self.port_name(port), queue, e);
        })
    }

    /// Arms (`on`) or disarms the RX interrupt of a queue under the port lock.
    pub fn interrupts_turn_on_off(&self, port: u16, queue: u16, on: bool) {
        let _guard = self.intr_locks[port as usize % MAX_PORTS].lock();
        if on {
            self.device.rx_intr_enable(port, queue);
        } else {
            self.device.rx_intr_disable(port, queue);
        }
    }

    pub fn stop_port(&self, port: u16) {
        if let Err(e) = self.device.stop(port) {
            error!("{}: failed to stop port: {}", self.port_name(port), e);
        }
    }

    /// Releases a stopped port. Called once every queue thread is done.
    pub fn close_port(&self, port: u16) {
        info!("{}: closing device", self.port_name(port));
        if let Err(e) = self.device.close(port) {
            error!("{}: failed to close port: {}", self.port_name(port), e);
        }
    }
}

#[cfg_attr(not(feature = "dpdk"), allow(dead_code))]
pub(crate) fn resultify(x: i32) -> io::Result<u32> {
    match x >= 0 {
        true => Ok(x as u32),
        false => Err(io::Error::from_raw_os_error(-x)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENODEV: i32 = 19;

    #[test]
    fn test_close_port_after_stop() {
        use crate::soft::{SoftConfig, SoftDevice};

        let dev = Arc::new(SoftDevice::new(SoftConfig {
            ports: 2,
            ..Default::default()
        }));
        let mgr = DeviceManager::from_arc(Arc::clone(&dev));
        mgr.stop_port(1);
        mgr.close_port(1);
        assert_eq!(dev.close_calls(1), 1);
        assert_eq!(dev.close_calls(0), 0);
        // unknown ports are logged, not fatal
        mgr.close_port(7);
    }

    #[test]
    fn test_resultify() {
        assert_eq!(resultify(3).unwrap(), 3);
        assert_eq!(resultify(-ENODEV).unwrap_err().raw_os_error(), Some(ENODEV));
    }
}
