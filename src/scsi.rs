//! The request/response surface handed to command handlers.

use std::fmt;
use std::sync::Arc;

use crate::ring::{CmdBlock, Region, IOVEC_SIZE};

/// SCSI status bytes.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// SCSI sense keys for CHECK CONDITION responses.
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x0;
    pub const RECOVERED_ERROR: u8 = 0x1;
    pub const NOT_READY: u8 = 0x2;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const HARDWARE_ERROR: u8 = 0x4;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
    pub const DATA_PROTECT: u8 = 0x7;
    pub const ABORTED_COMMAND: u8 = 0xB;
}

/// One SCSI command decoded from the ring.
///
/// The CDB and payload accessors reference the shared region rather than
/// copying it; they are only meaningful until the command's response is
/// posted, after which the kernel is free to reuse the entry and the data
/// area behind it.
pub struct ScsiCmd {
    region: Arc<Region>,
    id: u16,
    block: CmdBlock,
    data_base: usize,
}

impl fmt::Debug for ScsiCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiCmd")
            .field("id", &self.id)
            .field("opcode", &format_args!("{:#04x}", self.opcode()))
            .field("cdb_len", &self.block.cdb_len)
            .field("iov_cnt", &self.block.iov_cnt)
            .finish_non_exhaustive()
    }
}

impl ScsiCmd {
    pub(crate) fn new(region: Arc<Region>, id: u16, block: CmdBlock, data_base: usize) -> Self {
        Self {
            region,
            id,
            block,
            data_base,
        }
    }

    /// The ring command id, echoed back in the response.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn cdb_len(&self) -> usize {
        self.block.cdb_len
    }

    /// The `i`th CDB byte.
    ///
    /// # Panics
    ///
    /// Panic if `i >= self.cdb_len()`.
    #[must_use]
    pub fn cdb(&self, i: usize) -> u8 {
        assert!(i < self.block.cdb_len, "CDB index out of range");
        let mut b = [0u8; 1];
        self.region.copy_out(self.block.cdb_off + i, &mut b);
        b[0]
    }

    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.cdb(0)
    }

    fn cdb_be(&self, range: std::ops::Range<usize>) -> u64 {
        range.fold(0u64, |acc, i| acc << 8 | u64::from(self.cdb(i)))
    }

    /// The logical block address, parsed per the CDB group of the opcode
    /// (6/10/12/16-byte shapes). Zero for shapes that carry none.
    #[must_use]
    pub fn lba(&self) -> u64 {
        match self.opcode() >> 5 {
            0 => u64::from(self.cdb(1) & 0x1f) << 16 | self.cdb_be(2..4),
            1 | 2 => self.cdb_be(2..6),
            4 => self.cdb_be(2..10),
            5 => self.cdb_be(2..6),
            _ => 0,
        }
    }

    /// The transfer length in blocks, parsed per the CDB group. For 6-byte
    /// CDBs a stored zero means 256 blocks.
    #[must_use]
    pub fn xfer_len(&self) -> u32 {
        match self.opcode() >> 5 {
            0 => match self.cdb(4) {
                0 => 256,
                n => u32::from(n),
            },
            1 | 2 => self.cdb_be(7..9) as u32,
            4 => self.cdb_be(10..14) as u32,
            5 => self.cdb_be(6..10) as u32,
            _ => 0,
        }
    }

    fn iovec(&self, i: usize) -> (u64, u32) {
        let desc = self.block.iov_off + i * IOVEC_SIZE;
        (self.region.u64_at(desc), self.region.u32_at(desc + 8))
    }

    /// Total payload length described by the scatter/gather vector.
    #[must_use]
    pub fn data_len(&self) -> usize {
        (0..self.block.iov_cnt)
            .map(|i| self.iovec(i).1 as usize)
            .sum()
    }

    /// Copy payload out of the data area into `dst`, concatenating the
    /// scatter/gather slices in order. Returns the number of bytes copied
    /// (bounded by both `dst` and the payload length).
    pub fn read_into(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for i in 0..self.block.iov_cnt {
            if copied == dst.len() {
                break;
            }
            let (data_off, len) = self.iovec(i);
            let n = (len as usize).min(dst.len() - copied);
            self.region
                .copy_out(self.data_base + data_off as usize, &mut dst[copied..copied + n]);
            copied += n;
        }
        copied
    }

    /// Copy `src` into the data area, filling the scatter/gather slices in
    /// order. Returns the number of bytes copied.
    pub fn write_from(&self, src: &[u8]) -> usize {
        let mut copied = 0;
        for i in 0..self.block.iov_cnt {
            if copied == src.len() {
                break;
            }
            let (data_off, len) = self.iovec(i);
            let n = (len as usize).min(src.len() - copied);
            self.region
                .copy_in(self.data_base + data_off as usize, &src[copied..copied + n]);
            copied += n;
        }
        copied
    }

    /// A GOOD response for this command.
    #[must_use]
    pub fn ok(&self) -> ScsiResponse {
        ScsiResponse::new(self.id, status::GOOD)
    }

    /// A CHECK CONDITION response carrying fixed-format sense data with the
    /// given sense key and additional sense code (ASC in the high byte,
    /// ASCQ in the low byte).
    #[must_use]
    pub fn check_condition(&self, key: u8, asc: u16) -> ScsiResponse {
        ScsiResponse::new(self.id, status::CHECK_CONDITION).with_sense(fixed_sense(key, asc))
    }
}

/// Fixed-format sense data (response code 70h), 18 bytes.
fn fixed_sense(key: u8, asc: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 18];
    buf[0] = 0x70;
    buf[2] = key & 0xf;
    buf[7] = 10; // additional length: bytes 8..18
    buf[12] = (asc >> 8) as u8;
    buf[13] = asc as u8;
    buf
}

/// The completion posted back for a [`ScsiCmd`].
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    id: u16,
    status: u8,
    sense: Vec<u8>,
}

impl ScsiResponse {
    #[must_use]
    pub fn new(id: u16, status: u8) -> Self {
        Self {
            id,
            status,
            sense: Vec::new(),
        }
    }

    /// Attach sense data. It is truncated to the entry's sense capacity
    /// when posted.
    #[must_use]
    pub fn with_sense(mut self, sense: Vec<u8>) -> Self {
        self.sense = sense;
        self
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }

    #[must_use]
    pub fn sense(&self) -> &[u8] {
        &self.sense
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::ring::testing::TestRing;

    fn decode(ring: &TestRing, off: u32) -> ScsiCmd {
        let mb = ring.mailbox();
        let hdr = mb.entry_at(off).unwrap();
        let block = mb.cmd_block(&hdr).unwrap();
        ScsiCmd::new(Arc::clone(mb.region()), hdr.cmd_id, block, mb.data_base())
    }

    fn cmd_with_cdb(cdb: &[u8]) -> (TestRing, ScsiCmd) {
        let mut ring = TestRing::new(64, 1024, 8192);
        let ent = ring.push_cmd(3, cdb, &[], 32);
        let cmd = decode(&ring, ent.off);
        (ring, cmd)
    }

    #[rstest]
    #[case::read_6(&[0x08, 0x12, 0x34, 0x56, 0x10, 0], 0x12_3456, 0x10)]
    #[case::read_6_zero_len(&[0x08, 0, 0, 1, 0, 0], 1, 256)]
    #[case::read_10(
        &[0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0x05, 0x06, 0],
        0x0102_0304,
        0x0506,
    )]
    #[case::read_12(
        &[0xa8, 0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0, 0],
        0x0102_0304,
        0x0506_0708,
    )]
    #[case::read_16(
        &[0x88, 0, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0x20, 0, 0],
        0x0102_0304_0506_0708,
        0x20,
    )]
    fn cdb_shapes(#[case] cdb: &[u8], #[case] lba: u64, #[case] xfer: u32) {
        let (_ring, cmd) = cmd_with_cdb(cdb);
        assert_eq!(cmd.opcode(), cdb[0]);
        assert_eq!(cmd.cdb_len(), cdb.len());
        assert_eq!(cmd.lba(), lba);
        assert_eq!(cmd.xfer_len(), xfer);
    }

    #[test]
    fn payload_follows_scatter_gather_order() {
        let mut ring = TestRing::new(64, 1024, 8192);
        let iovecs = [(256u64, 4u32), (0, 3), (1024, 5)];
        let ent = ring.push_cmd(9, &[0x2a, 0], &iovecs, 32);
        let cmd = decode(&ring, ent.off);
        assert_eq!(cmd.data_len(), 12);

        let src: Vec<u8> = (1..=12).collect();
        assert_eq!(cmd.write_from(&src), 12);
        assert_eq!(ring.data_read(256, 4), src[0..4]);
        assert_eq!(ring.data_read(0, 3), src[4..7]);
        assert_eq!(ring.data_read(1024, 5), src[7..12]);

        let mut dst = vec![0u8; 12];
        assert_eq!(cmd.read_into(&mut dst), 12);
        assert_eq!(dst, src);

        // A short destination stops at the slice boundary mid-descriptor.
        let mut short = vec![0u8; 6];
        assert_eq!(cmd.read_into(&mut short), 6);
        assert_eq!(short, src[0..6]);
    }

    #[test]
    fn fixed_sense_layout() {
        let (_ring, cmd) = cmd_with_cdb(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        let resp = cmd.check_condition(sense_key::ILLEGAL_REQUEST, 0x2400);
        assert_eq!(resp.id(), cmd.id());
        assert_eq!(resp.status(), status::CHECK_CONDITION);
        let sense = resp.sense();
        assert_eq!(sense.len(), 18);
        assert_eq!(sense[0], 0x70);
        assert_eq!(sense[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense[7], 10);
        assert_eq!(sense[12], 0x24);
        assert_eq!(sense[13], 0x00);
    }
}
