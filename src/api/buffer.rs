//! Hardware buffer handles.

/// Checksum verdict reported by the NIC for one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CksumStatus {
    /// The NIC did not look at this checksum.
    #[default]
    Unknown,
    Good,
    Bad,
    /// The checksum field is missing or was not computed.
    None,
}

/// Receive-side checksum offload flags of a buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChecksumFlags {
    pub ip: CksumStatus,
    pub l4: CksumStatus,
}

impl ChecksumFlags {
    pub const fn new(ip: CksumStatus, l4: CksumStatus) -> Self {
        Self { ip, l4 }
    }

    pub const fn good() -> Self {
        Self::new(CksumStatus::Good, CksumStatus::Good)
    }
}

/// Storage for one received packet, owned by exactly one holder.
///
/// Dropping a handle frees the buffer to the pool it came from; a successful
/// transmit consumes it. There is no other way to give a buffer back, so a
/// buffer can never be freed twice or referenced by two packets.
pub trait BufferHandle: Send + 'static {
    /// Bytes of the first segment.
    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Length of the whole packet across all segments.
    fn pkt_len(&self) -> usize;

    fn is_contiguous(&self) -> bool;

    fn checksum_flags(&self) -> ChecksumFlags;
}
