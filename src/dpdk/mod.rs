//! DPDK poll-mode backend.

mod wrapper;

use std::mem;
use std::ptr::{self, NonNull};
use std::time::Duration;

use dpdk_sys::*;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::api::{
    Burst, CycleCounter, DeviceInfo, PollDevice, PortStats, ProcessRole, Result, resultify,
};
use crate::errors::Error;

pub use wrapper::RteMbuf;
use wrapper::{Mempool, PortSetup};

pub const NUM_MBUFS: u32 = 8192;
pub const MBUF_CACHE_SIZE: u32 = 250;
pub const RX_RING_SIZE: u16 = 1024;
pub const TX_RING_SIZE: u16 = 1024;

/// Ports to bring up, by EAL device name.
#[derive(Clone, Debug)]
pub struct DpdkPortSpec {
    pub name: String,
    pub queues: u16,
    pub rx_interrupts: bool,
    pub promiscuous: bool,
    pub mempool_size: u32,
}

impl DpdkPortSpec {
    pub fn new(name: impl Into<String>, queues: u16) -> Self {
        Self {
            name: name.into(),
            queues,
            rx_interrupts: false,
            promiscuous: true,
            mempool_size: NUM_MBUFS,
        }
    }
}

/// A port configured by this process and the mempool feeding its queues.
struct OwnedPort {
    id: u16,
    rx_interrupts: bool,
    pool: Mempool,
}

/// Ports set up by a primary process are closed, their mempools released and
/// the EAL cleaned up when the device is dropped.
pub struct DpdkDevice {
    ports: Mutex<Vec<OwnedPort>>,
    hz: u64,
    role: ProcessRole,
}

impl DpdkDevice {
    /// Initializes the EAL and configures every port of `ports`.
    ///
    /// Returns the device along with the port id of each spec. A secondary
    /// process attaches to ports configured by the primary and sets none up.
    pub fn new(eal_args: &[String], ports: &[DpdkPortSpec]) -> Result<(Self, Vec<u16>)> {
        wrapper::eal_init(eal_args).map_err(|e| Error::device("eal", "rte_eal_init", e))?;

        let role = match unsafe { rust_rte_is_primary() } {
            0 => ProcessRole::Secondary,
            _ => ProcessRole::Primary,
        };
        let hz = unsafe { rte_get_tsc_hz() };

        let mut owned = Vec::new();
        let mut ids = Vec::with_capacity(ports.len());
        for spec in ports {
            let port = wrapper::find_port(&spec.name).ok_or_else(|| {
                Error::Config(format!("{}: no such DPDK port", spec.name))
            })?;
            ids.push(port);
            if role == ProcessRole::Secondary {
                continue;
            }

            let pool = Mempool::new(
                &format!("mempool_{}", spec.name),
                spec.mempool_size,
                MBUF_CACHE_SIZE,
                wrapper::socket_id(port),
            )
            .map_err(|e| Error::device(&spec.name, "rte_pktmbuf_pool_create", e))?;
            let setup = PortSetup {
                queues: spec.queues,
                rx_descriptors: RX_RING_SIZE,
                tx_descriptors: TX_RING_SIZE,
                rx_interrupts: spec.rx_interrupts,
                promiscuous: spec.promiscuous,
            };
            unsafe { wrapper::init_port(port, setup, &pool) }
                .map_err(|e| Error::device(&spec.name, "port setup", e))?;
            info!("{}: configured {} queues", spec.name, spec.queues);
            owned.push(OwnedPort {
                id: port,
                rx_interrupts: spec.rx_interrupts,
                pool,
            });
        }

        Ok((
            Self {
                ports: Mutex::new(owned),
                hz,
                role,
            },
            ids,
        ))
    }

    fn raw_info(&self, port: u16) -> Result<rte_eth_dev_info> {
        let mut info: rte_eth_dev_info = unsafe { mem::zeroed() };
        unsafe { resultify(rte_eth_dev_info_get(port, &mut info)) }
            .map_err(|e| Error::device(&self.name_or_id(port), "rte_eth_dev_info_get", e))?;
        Ok(info)
    }

    fn name_or_id(&self, port: u16) -> String {
        wrapper::port_name(port).unwrap_or_else(|_| format!("port{port}"))
    }
}

impl CycleCounter for DpdkDevice {
    #[inline]
    fn cycles(&self) -> u64 {
        unsafe { rust_rte_get_tsc_cycles() }
    }

    fn cycles_hz(&self) -> u64 {
        self.hz
    }
}

impl PollDevice for DpdkDevice {
    type Buffer = RteMbuf;

    fn port_name(&self, port: u16) -> Result<String> {
        wrapper::port_name(port).map_err(|e| Error::device(&format!("port{port}"), "port name", e))
    }

    #[inline]
    fn rx_burst(&self, port: u16, queue: u16, burst: &mut Burst<RteMbuf>) -> usize {
        let room = burst.remaining_capacity();
        if room == 0 {
            return 0;
        }
        let mut raw = [ptr::null_mut::<rte_mbuf>(); crate::api::BURST_SIZE];
        let n = unsafe { rust_rte_eth_rx_burst(port, queue, raw.as_mut_ptr(), room as u16) } as usize;
        for m in &raw[..n] {
            if let Some(m) = NonNull::new(*m) {
                burst.push(unsafe { RteMbuf::from_raw(m) });
            }
        }
        n
    }

    fn tx_one(&self, port: u16, queue: u16, buf: RteMbuf) -> std::result::Result<(), RteMbuf> {
        let mut raw = [buf.into_raw()];
        match unsafe { rust_rte_eth_tx_burst(port, queue, raw.as_mut_ptr(), 1) } {
            1 => Ok(()),
            // not taken by the NIC, ownership comes back
            _ => Err(unsafe { RteMbuf::from_raw(NonNull::new_unchecked(raw[0])) }),
        }
    }

    fn start(&self, port: u16) -> Result<()> {
        unsafe { resultify(rte_eth_dev_start(port)) }
            .map(|_| ())
            .map_err(|e| Error::device(&self.name_or_id(port), "rte_eth_dev_start", e))
    }

    fn stop(&self, port: u16) -> Result<()> {
        unsafe { resultify(rte_eth_dev_stop(port)) }
            .map(|_| ())
            .map_err(|e| Error::device(&self.name_or_id(port), "rte_eth_dev_stop", e))
    }

    fn close(&self, port: u16) -> Result<()> {
        let owned = {
            let mut ports = self.ports.lock();
            match ports.iter().position(|p| p.id == port) {
                Some(i) => ports.swap_remove(i),
                // secondary process or already closed
                None => return Ok(()),
            }
        };
        let rv = unsafe { resultify(rte_eth_dev_close(port)) };
        debug!("{}: releasing packet mempool", self.name_or_id(port));
        drop(owned.pool);
        rv.map(|_| ())
            .map_err(|e| Error::device(&self.name_or_id(port), "rte_eth_dev_close", e))
    }

    fn info(&self, port: u16) -> Result<DeviceInfo> {
        let info = self.raw_info(port)?;
        Ok(DeviceInfo {
            driver_name: wrapper::driver_name(&info),
            socket_id: wrapper::socket_id(port),
            max_rx_queues: info.max_rx_queues,
            max_tx_queues: info.max_tx_queues,
        })
    }

    fn stats(&self, port: u16) -> Result<PortStats> {
        let mut st: rte_eth_stats = unsafe { mem::zeroed() };
        unsafe { resultify(rte_eth_stats_get(port, &mut st)) }
            .map_err(|e| Error::device(&self.name_or_id(port), "rte_eth_stats_get", e))?;
        Ok(PortStats {
            ipackets: st.ipackets,
            opackets: st.opackets,
            ibytes: st.ibytes,
            obytes: st.obytes,
            imissed: st.imissed,
            ierrors: st.ierrors,
            oerrors: st.oerrors,
            rx_nombuf: st.rx_nombuf,
        })
    }

    fn xstats(&self, port: u16) -> Result<Vec<(String, u64)>> {
        let name = self.name_or_id(port);
        let cnt = unsafe { rte_eth_xstats_get_names(port, ptr::null_mut(), 0) };
        let cnt = resultify(cnt).map_err(|e| Error::device(&name, "rte_eth_xstats_get_names", e))?
            as usize;
        if cnt == 0 {
            return Ok(Vec::new());
        }

        let mut names: Vec<rte_eth_xstat_name> = vec![unsafe { mem::zeroed() }; cnt];
        let mut values: Vec<rte_eth_xstat> = vec![unsafe { mem::zeroed() }; cnt];
        let got = unsafe { rte_eth_xstats_get_names(port, names.as_mut_ptr(), cnt as u32) };
        if got != cnt as i32 {
            return Err(Error::device(
                &name,
                "rte_eth_xstats_get_names",
                std::io::Error::other("xstats name count changed"),
            ));
        }
        let got = unsafe { rte_eth_xstats_get(port, values.as_mut_ptr(), cnt as u32) };
        if got != cnt as i32 {
            return Err(Error::device(
                &name,
                "rte_eth_xstats_get",
                std::io::Error::other("xstats count changed"),
            ));
        }

        Ok(values
            .iter()
            .map(|v| {
                let n = &names[v.id as usize % cnt].name;
                let n = unsafe { std::ffi::CStr::from_ptr(n.as_ptr()) };
                (n.to_string_lossy().into_owned(), v.value)
            })
            .collect())
    }

    fn stats_reset(&self, port: u16) {
        if let Err(e) = unsafe { resultify(rte_eth_stats_reset(port)) } {
            debug!("{}: failed to reset stats: {}", self.name_or_id(port), e);
        }
    }

    fn supports_rx_interrupts(&self, port: u16) -> bool {
        // rte_eth_dev_configure rejects intr_conf.rxq on drivers without support
        self.ports
            .lock()
            .iter()
            .any(|p| p.id == port && p.rx_interrupts)
    }

    fn rx_intr_register(&self, port: u16, queue: u16) -> Result<()> {
        unsafe { resultify(rust_rx_intr_register(port, queue)) }
            .map(|_| ())
            .map_err(|e| Error::device(&self.name_or_id(port), "rte_eth_dev_rx_intr_ctl_q", e))
    }

    fn rx_intr_enable(&self, port: u16, queue: u16) {
        unsafe { rte_eth_dev_rx_intr_enable(port, queue) };
    }

    fn rx_intr_disable(&self, port: u16, queue: u16) {
        unsafe { rte_eth_dev_rx_intr_disable(port, queue) };
    }

    fn wait_rx_event(&self, _port: u16, _queue: u16, timeout: Duration) -> bool {
        unsafe { rust_rx_intr_wait(timeout.as_millis() as i32) > 0 }
    }

    fn post_start(&self, port: u16, info: &DeviceInfo, threads: u16) {
        // i40e takes its RSS configuration as rte_flow rules, after start
        if info.driver_name != "net_i40e" {
            return;
        }
        let mut msg = ptr::null();
        let rv = unsafe { rust_flow_rss_all_queues(port, threads, &mut msg) };
        if rv != 0 {
            error!(
                "{}: unable to set RSS rules: {}",
                self.name_or_id(port),
                wrapper::flow_error(msg)
            );
        }
    }

    fn pre_stop(&self, port: u16, info: &DeviceInfo) {
        if info.driver_name != "net_i40e" {
            return;
        }
        let mut msg = ptr::null();
        let rv = unsafe { rust_flow_flush(port, &mut msg) };
        if rv != 0 {
            error!(
                "{}: unable to flush rte_flow rules: {}",
                self.name_or_id(port),
                wrapper::flow_error(msg)
            );
        }
    }

    fn process_role(&self) -> ProcessRole {
        self.role
    }

    fn current_socket_id(&self) -> Option<u32> {
        Some(unsafe { rte_socket_id() })
    }

    fn delay_us(&self, us: u32) {
        unsafe { rte_delay_us_block(us) };
    }
}

impl Drop for DpdkDevice {
    fn drop(&mut self) {
        let open: Vec<u16> = self.ports.get_mut().iter().map(|p| p.id).collect();
        for port in open {
            info!("{}: closing device", self.name_or_id(port));
            if let Err(e) = self.close(port) {
                error!("{}", e);
            }
        }
        if self.role == ProcessRole::Primary {
            if let Err(e) = unsafe { resultify(rte_eal_cleanup()) } {
                error!("EAL cleanup failed: {}", e);
            }
        }
    }
}
