use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::raw::{c_char, c_int};
use std::ptr::{self, NonNull};
use std::slice;

use dpdk_sys::*;

use crate::api::{BufferHandle, ChecksumFlags, CksumStatus, resultify};

/// Hands the EAL its arguments. `args[0]` is the program name.
pub(crate) fn eal_init(args: &[String]) -> io::Result<()> {
    let cstrings = args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut c_ptrs: Vec<*mut c_char> = cstrings.iter().map(|c| c.as_ptr() as *mut c_char).collect();
    let argc = c_ptrs.len() as c_int;
    unsafe { resultify(rte_eal_init(argc, c_ptrs.as_mut_ptr()))? };
    Ok(())
}

pub(crate) fn find_port(name: &str) -> Option<u16> {
    let cname = CString::new(name).ok()?;
    let mut port_id = 0u16;
    match unsafe { rte_eth_dev_get_port_by_name(cname.as_ptr(), &mut port_id) } {
        0 => Some(port_id),
        _ => None,
    }
}

pub(crate) fn port_name(port: u16) -> io::Result<String> {
    let mut buf = [0 as c_char; RTE_ETH_NAME_MAX_LEN as usize];
    unsafe { resultify(rte_eth_dev_get_name_by_port(port, buf.as_mut_ptr()))? };
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

pub(crate) fn socket_id(port: u16) -> Option<u32> {
    let id = unsafe { rte_eth_dev_socket_id(port) };
    (id >= 0).then_some(id as u32)
}

/// mbuf pool backing the RX queues of one port.
pub(crate) struct Mempool {
    ptr: NonNull<rte_mempool>,
}

// rte_mempool is multi-producer multi-consumer
unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
    pub(crate) fn new(name: &str, size: u32, cache_size: u32, socket: Option<u32>) -> io::Result<Self> {
        let cname =
            CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let socket = socket.map(|s| s as i32).unwrap_or(SOCKET_ID_ANY);
        let ptr = unsafe {
            rte_pktmbuf_pool_create(
                cname.as_ptr(),
                size,
                cache_size,
                0,
                RTE_MBUF_DEFAULT_BUF_SIZE as u16,
                socket,
            )
        };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr })
            .ok_or_else(|| io::Error::other(format!("cannot create mbuf pool {name}")))
    }

    pub(crate) fn as_ptr(&self) -> *mut rte_mempool {
        self.ptr.as_ptr()
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        unsafe { rte_mempool_free(self.ptr.as_ptr()) };
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PortSetup {
    pub queues: u16,
    pub rx_descriptors: u16,
    pub tx_descriptors: u16,
    pub rx_interrupts: bool,
    pub promiscuous: bool,
}

/// Configures RX and TX queues of a port. The port is started separately.
pub(crate) unsafe fn init_port(port: u16, setup: PortSetup, pool: &Mempool) -> io::Result<()> {
    let mut port_conf: rte_eth_conf = unsafe { mem::zeroed() };
    if setup.rx_interrupts {
        port_conf.intr_conf.set_rxq(1);
    }
    unsafe {
        resultify(rte_eth_dev_configure(
            port,
            setup.queues,
            setup.queues,
            &port_conf,
        ))?
    };

    let socket = socket_id(port).unwrap_or(SOCKET_ID_ANY as u32);
    for queue in 0..setup.queues {
        unsafe {
            resultify(rte_eth_rx_queue_setup(
                port,
                queue,
                setup.rx_descriptors,
                socket,
                ptr::null(),
                pool.as_ptr(),
            ))?
        };
        unsafe {
            resultify(rte_eth_tx_queue_setup(
                port,
                queue,
                setup.tx_descriptors,
                socket,
                ptr::null(),
            ))?
        };
    }

    if setup.promiscuous {
        unsafe { resultify(rte_eth_promiscuous_enable(port))? };
    }
    Ok(())
}

pub(crate) fn driver_name(info: &rte_eth_dev_info) -> String {
    if info.driver_name.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(info.driver_name) }
        .to_string_lossy()
        .into_owned()
}

pub(crate) fn flow_error(msg: *const c_char) -> String {
    if msg.is_null() {
        return "unknown".to_string();
    }
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

/// An mbuf owned by the capture. Freed to its pool on drop.
pub struct RteMbuf {
    ptr: NonNull<rte_mbuf>,
}

// an mbuf has a single owner at a time
unsafe impl Send for RteMbuf {}

impl RteMbuf {
    /// # Safety
    /// `ptr` must be a valid mbuf no one else frees.
    pub(crate) unsafe fn from_raw(ptr: NonNull<rte_mbuf>) -> Self {
        Self { ptr }
    }

    /// Gives up ownership, e.g. after the NIC took the mbuf for transmit.
    pub(crate) fn into_raw(self) -> *mut rte_mbuf {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }
}

impl Drop for RteMbuf {
    fn drop(&mut self) {
        unsafe { rust_rte_pktmbuf_free(self.ptr.as_ptr()) };
    }
}

fn cksum_status(v: c_int) -> CksumStatus {
    match v as u32 {
        RUST_CKSUM_GOOD => CksumStatus::Good,
        RUST_CKSUM_BAD => CksumStatus::Bad,
        RUST_CKSUM_NONE => CksumStatus::None,
        _ => CksumStatus::Unknown,
    }
}

impl BufferHandle for RteMbuf {
    fn data(&self) -> &[u8] {
        unsafe {
            let m = self.ptr.as_ptr();
            let len = rust_rte_pktmbuf_data_len(m) as usize;
            slice::from_raw_parts(rust_rte_pktmbuf_mtod(m) as *const u8, len)
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            let m = self.ptr.as_ptr();
            let len = rust_rte_pktmbuf_data_len(m) as usize;
            slice::from_raw_parts_mut(rust_rte_pktmbuf_mtod(m) as *mut u8, len)
        }
    }

    fn pkt_len(&self) -> usize {
        unsafe { rust_rte_pktmbuf_pkt_len(self.ptr.as_ptr()) as usize }
    }

    fn is_contiguous(&self) -> bool {
        unsafe { rust_rte_pktmbuf_nb_segs(self.ptr.as_ptr()) == 1 }
    }

    fn checksum_flags(&self) -> ChecksumFlags {
        let (mut ip, mut l4) = (0, 0);
        unsafe { rust_rte_mbuf_cksum(self.ptr.as_ptr(), &mut ip, &mut l4) };
        ChecksumFlags::new(cksum_status(ip), cksum_status(l4))
    }
}
