//! Interfaces between the capture core and its collaborators.

mod buffer;
mod device;
mod pipeline;

pub use buffer::{BufferHandle, ChecksumFlags, CksumStatus};
#[cfg_attr(not(feature = "dpdk"), allow(unused_imports))]
pub(crate) use device::resultify;
pub use device::{
    BURST_SIZE, Burst, CycleCounter, DeviceInfo, DeviceManager, MAX_PORTS, PollDevice, PortStats,
    ProcessRole,
};
pub use pipeline::Pipeline;

pub type Result<T> = std::result::Result<T, crate::errors::Error>;

#[inline]
#[cold]
fn cold() {}

/// Hints to the compiler that the condition is unlikely true.
#[inline]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}
