//! Typed views over the shared region: the mailbox header and the command
//! ring.
//!
//! The kernel is the only other party touching this memory. Entries between
//! `cmd_tail` and `cmd_head` are owned by userspace for reading; everything
//! else belongs to the kernel. Hand-off is ordered by an acquire load of
//! `cmd_head` and a release store of `cmd_tail`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::{io, ptr};

use rustix::fd::BorrowedFd;
use rustix::mm;

use crate::error::{Error, Result};

/// Mailbox word offsets, fixed by the kernel ABI.
const MB_VERSION: usize = 0;
const MB_FLAGS: usize = 2;
const MB_CMDR_OFF: usize = 4;
const MB_CMDR_SIZE: usize = 8;
const MB_CMD_HEAD: usize = 12;
const MB_CMD_TAIL: usize = 16;

/// Entry header: `len_op` u32 carrying the opcode in its low 3 bits and the
/// stride (distance to the next entry) in the rest, then the command id.
const ENT_LEN_OP: usize = 0;
const ENT_CMD_ID: usize = 4;
const ENT_OP_MASK: u32 = 0x7;

/// CMD request block, u32 words following the header. `cdb_off`, `iov_off`
/// and `sense_off` are relative to the entry start; scatter/gather
/// descriptors address the data area.
const REQ_CDB_LEN: usize = 8;
const REQ_CDB_OFF: usize = 12;
const REQ_IOV_CNT: usize = 16;
const REQ_IOV_OFF: usize = 20;
const REQ_SENSE_OFF: usize = 24;
const REQ_SENSE_CAP: usize = 28;
pub(crate) const REQ_BLOCK_END: usize = 32;

/// The response overlays the request block.
pub(crate) const RSP_STATUS: usize = 8;

/// One scatter/gather descriptor: data-area offset u64 + length u32.
pub(crate) const IOVEC_SIZE: usize = 12;

pub(crate) const MAILBOX_VERSION: u16 = 2;

bitflags::bitflags! {
    /// Capability bits advertised in the mailbox `flags` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MailboxFlags: u16 {
        /// The kernel accepts out-of-order completion of ring entries.
        const CAP_OOOC = 1 << 0;
    }
}

/// Ring entry opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub(crate) enum RingOp {
    Pad = 0,
    Cmd = 1,
    Tmr = 2,
}

/// Owner of the shared memory area. Unmapped when the last holder drops it.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    mapped: bool,
}

// SAFETY: The region is plain shared memory; all cross-thread (and
// cross-party) hand-off goes through the head/tail atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        if self.mapped {
            // SAFETY: Mapped by us with this exact length.
            if let Err(err) = unsafe { mm::munmap(self.base.as_ptr().cast(), self.len) } {
                log::error!("failed to unmap shared region: {err}");
            }
        } else {
            let layout = Self::heap_layout(self.len);
            // SAFETY: Allocated by `Region::anonymous` with this layout.
            unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl Region {
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        // SAFETY: Mapping a new region; the kernel validates the length.
        let ptr = unsafe {
            mm::mmap(
                ptr::null_mut(),
                len,
                mm::ProtFlags::READ | mm::ProtFlags::WRITE,
                mm::MapFlags::SHARED,
                fd,
                0,
            )?
        };
        Ok(Self {
            base: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
            mapped: true,
        })
    }

    fn heap_layout(len: usize) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(len, 4096).expect("invalid region length")
    }

    /// A zeroed heap-backed region standing in for a kernel mapping.
    #[cfg(test)]
    pub fn anonymous(len: usize) -> Self {
        let layout = Self::heap_layout(len);
        // SAFETY: Non-zero length, valid layout.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self {
            base,
            len,
            mapped: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn check(&self, off: usize, len: usize) {
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.len),
            "region access out of bounds: {off}+{len} > {}",
            self.len,
        );
    }

    pub fn u16_at(&self, off: usize) -> u16 {
        self.check(off, 2);
        // SAFETY: In bounds; entry fields may be unaligned.
        unsafe { ptr::read_unaligned(self.base.as_ptr().add(off).cast()) }
    }

    pub fn u32_at(&self, off: usize) -> u32 {
        self.check(off, 4);
        // SAFETY: See `u16_at`.
        unsafe { ptr::read_unaligned(self.base.as_ptr().add(off).cast()) }
    }

    pub fn u64_at(&self, off: usize) -> u64 {
        self.check(off, 8);
        // SAFETY: See `u16_at`.
        unsafe { ptr::read_unaligned(self.base.as_ptr().add(off).cast()) }
    }

    pub fn write_u8_at(&self, off: usize, v: u8) {
        self.check(off, 1);
        // SAFETY: In bounds. Ordering against the kernel is provided by the
        // release store of `cmd_tail` that follows.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(off), v) };
    }

    pub fn copy_out(&self, off: usize, dst: &mut [u8]) {
        self.check(off, dst.len());
        // SAFETY: In bounds; `dst` cannot overlap the mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(off), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn copy_in(&self, off: usize, src: &[u8]) {
        self.check(off, src.len());
        // SAFETY: See `copy_out`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(off), src.len());
        }
    }

    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        self.check(off, 4);
        debug_assert_eq!(off % 4, 0);
        // SAFETY: In bounds, aligned, and both parties access this word
        // atomically.
        unsafe { AtomicU32::from_ptr(self.base.as_ptr().add(off).cast()) }
    }
}

/// Decoded entry header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    /// Ring offset of this entry.
    pub off: u32,
    /// Distance to the next entry's start. Always a nonzero multiple of 8.
    pub stride: u32,
    op_raw: u8,
    pub cmd_id: u16,
}

impl EntryHeader {
    pub fn op(&self) -> Option<RingOp> {
        RingOp::from_repr(self.op_raw)
    }
}

/// Decoded CMD request block. All offsets are absolute within the region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CmdBlock {
    pub cdb_off: usize,
    pub cdb_len: usize,
    pub iov_off: usize,
    pub iov_cnt: usize,
    pub sense_off: usize,
    pub sense_cap: usize,
}

/// Accessors over the mailbox and the command ring it describes.
///
/// `version`, `flags` and the ring geometry are stable after attach and
/// cached here; `cmd_head` and `cmd_tail` always hit shared memory.
#[derive(Debug)]
pub(crate) struct Mailbox {
    region: Arc<Region>,
    version: u16,
    flags: MailboxFlags,
    cmdr_off: u32,
    cmdr_size: u32,
}

impl Mailbox {
    pub fn new(region: Arc<Region>) -> Result<Self> {
        let version = region.u16_at(MB_VERSION);
        let flags = MailboxFlags::from_bits_truncate(region.u16_at(MB_FLAGS));
        let cmdr_off = region.u32_at(MB_CMDR_OFF);
        let cmdr_size = region.u32_at(MB_CMDR_SIZE);

        let corrupt = |reason| Error::RingCorruption { offset: 0, reason };
        if cmdr_size == 0 || cmdr_size % 8 != 0 {
            return Err(corrupt("bad command ring size"));
        }
        let end = u64::from(cmdr_off) + u64::from(cmdr_size);
        if (cmdr_off as usize) < MB_CMD_TAIL + 4 || end > region.len() as u64 {
            return Err(corrupt("command ring outside the mapped region"));
        }
        Ok(Self {
            region,
            version,
            flags,
            cmdr_off,
            cmdr_size,
        })
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn flags(&self) -> MailboxFlags {
        self.flags
    }

    pub fn cmdr_off(&self) -> u32 {
        self.cmdr_off
    }

    pub fn cmdr_size(&self) -> u32 {
        self.cmdr_size
    }

    /// Offset of the data area (everything past the command ring).
    pub fn data_base(&self) -> usize {
        (self.cmdr_off + self.cmdr_size) as usize
    }

    pub fn data_len(&self) -> usize {
        self.region.len() - self.data_base()
    }

    /// Fresh load of the kernel-owned producer index. The acquire ordering
    /// makes every entry published before the head advance visible.
    pub fn cmd_head(&self) -> u32 {
        self.region.atomic_u32(MB_CMD_HEAD).load(Ordering::Acquire)
    }

    pub fn cmd_tail(&self) -> u32 {
        self.region.atomic_u32(MB_CMD_TAIL).load(Ordering::Relaxed)
    }

    /// Publish the consumer index. The release ordering commits every
    /// response byte written before it.
    pub fn set_cmd_tail(&self, v: u32) {
        self.region.atomic_u32(MB_CMD_TAIL).store(v, Ordering::Release);
    }

    /// Decode the entry header at ring offset `off`.
    pub fn entry_at(&self, off: u32) -> Result<EntryHeader> {
        let corrupt = |reason| Error::RingCorruption { offset: off, reason };
        if off % 8 != 0 || off >= self.cmdr_size {
            return Err(corrupt("entry offset out of range"));
        }
        let base = (self.cmdr_off + off) as usize;
        let len_op = self.region.u32_at(base + ENT_LEN_OP);
        let stride = len_op & !ENT_OP_MASK;
        if stride == 0 {
            return Err(corrupt("zero-length entry"));
        }
        if stride > self.cmdr_size - off {
            return Err(corrupt("entry crosses the ring end"));
        }
        Ok(EntryHeader {
            off,
            stride,
            op_raw: (len_op & ENT_OP_MASK) as u8,
            cmd_id: self.region.u16_at(base + ENT_CMD_ID),
        })
    }

    /// Decode and validate the request block of a CMD entry.
    pub fn cmd_block(&self, hdr: &EntryHeader) -> Result<CmdBlock> {
        let corrupt = |reason| Error::RingCorruption {
            offset: hdr.off,
            reason,
        };
        let base = (self.cmdr_off + hdr.off) as usize;
        let stride = hdr.stride as usize;
        if stride < REQ_BLOCK_END {
            return Err(corrupt("entry too short for a command"));
        }

        let in_entry = |off: u32, len: usize| {
            (off as usize) >= REQ_BLOCK_END
                && (off as usize)
                    .checked_add(len)
                    .is_some_and(|end| end <= stride)
        };

        let cdb_len = self.region.u32_at(base + REQ_CDB_LEN) as usize;
        let cdb_off = self.region.u32_at(base + REQ_CDB_OFF);
        if cdb_len == 0 {
            return Err(corrupt("empty CDB"));
        }
        if !in_entry(cdb_off, cdb_len) {
            return Err(corrupt("CDB outside the entry"));
        }

        let iov_cnt = self.region.u32_at(base + REQ_IOV_CNT) as usize;
        let iov_off = self.region.u32_at(base + REQ_IOV_OFF);
        if !in_entry(iov_off, iov_cnt * IOVEC_SIZE) {
            return Err(corrupt("scatter/gather table outside the entry"));
        }

        let sense_off = self.region.u32_at(base + REQ_SENSE_OFF);
        let sense_cap = self.region.u32_at(base + REQ_SENSE_CAP) as usize;
        if !in_entry(sense_off, sense_cap) {
            return Err(corrupt("sense buffer outside the entry"));
        }

        // Validate the descriptors up front so payload copies can trust them.
        let data_len = self.data_len() as u64;
        for i in 0..iov_cnt {
            let desc = base + iov_off as usize + i * IOVEC_SIZE;
            let data_off = self.region.u64_at(desc);
            let len = u64::from(self.region.u32_at(desc + 8));
            if data_off.checked_add(len).is_none_or(|end| end > data_len) {
                return Err(corrupt("scatter/gather descriptor outside the data area"));
            }
        }

        Ok(CmdBlock {
            cdb_off: base + cdb_off as usize,
            cdb_len,
            iov_off: base + iov_off as usize,
            iov_cnt,
            sense_off: base + sense_off as usize,
            sense_cap,
        })
    }
}
