// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use byteorder::{ByteOrder, LittleEndian};
use vm_memory::GuestAddress;

use crate::interrupt::MsiMessage;

/// Each MSI-X table entry is 16 bytes: address low, address high, data,
/// vector control.
pub const MSIX_TABLE_ENTRY_SIZE: usize = 16;

/// Fixed length of the MSI-X capability structure.
pub const MSIX_CAP_SIZE: usize = 12;

/// Offset of the vector control dword within a table entry.
pub const MSIX_ENTRY_VECTOR_CTRL: u64 = 0xc;

/// Mask bit in the vector control dword.
pub const MSIX_ENTRY_CTRL_MASKBIT: u32 = 0x1;

// Message control word bits.
const MSIX_CTL_TABLE_SIZE: u16 = 0x7ff;
pub const MSIX_CTL_FUNCTION_MASK: u16 = 0x4000;
pub const MSIX_CTL_ENABLE: u16 = 0x8000;

// Table and PBA dwords: BAR indicator in the low bits, offset above.
const MSIX_BIR_MASK: u32 = 0x7;
const MSIX_OFFSET_MASK: u32 = 0xffff_fff8;

/// Decoded MSI-X capability registers.
#[derive(Copy, Clone, Default)]
pub struct MsixCap {
    // Message Control Register
    //   10-0:  MSI-X Table size
    //   13-11: Reserved
    //   14:    Mask. Mask all MSI-X when set.
    //   15:    Enable. Enable all MSI-X when set.
    pub msg_ctl: u16,
    // Table. Contains the offset and the BAR indicator (BIR)
    //   2-0:  Table BAR indicator (BIR). Can be 0 to 5.
    //   31-3: Table offset in the BAR pointed by the BIR.
    pub table: u32,
    // Pending Bit Array. Contains the offset and the BAR indicator (BIR)
    //   2-0:  PBA BAR indicator (BIR). Can be 0 to 5.
    //   31-3: PBA offset in the BAR pointed by the BIR.
    pub pba: u32,
}

impl MsixCap {
    pub fn table_size(&self) -> u16 {
        (self.msg_ctl & MSIX_CTL_TABLE_SIZE) + 1
    }

    pub fn table_bir(&self) -> u32 {
        self.table & MSIX_BIR_MASK
    }

    pub fn table_offset(&self) -> u32 {
        self.table & MSIX_OFFSET_MASK
    }

    pub fn pba_bir(&self) -> u32 {
        self.pba & MSIX_BIR_MASK
    }

    pub fn pba_offset(&self) -> u32 {
        self.pba & MSIX_OFFSET_MASK
    }
}

/// One in-memory MSI-X table entry, the guest's view of a vector.
#[derive(Debug, Clone, Default)]
pub struct MsixTableEntry {
    pub msg_addr_lo: u32,
    pub msg_addr_hi: u32,
    pub msg_data: u32,
    pub vector_ctl: u32,
}

impl MsixTableEntry {
    pub fn masked(&self) -> bool {
        self.vector_ctl & MSIX_ENTRY_CTRL_MASKBIT != 0
    }

    pub fn message(&self) -> MsiMessage {
        MsiMessage {
            addr_lo: self.msg_addr_lo,
            addr_hi: self.msg_addr_hi,
            data: self.msg_data,
        }
    }

    pub fn set_message(&mut self, msg: MsiMessage) {
        self.msg_addr_lo = msg.addr_lo;
        self.msg_addr_hi = msg.addr_hi;
        self.msg_data = msg.data;
    }
}

/// Reads an aligned 4- or 8-byte window of a table entry. The caller has
/// already validated alignment, so `field` lands on a dword boundary.
pub fn read_entry(entry: &MsixTableEntry, field: u64, data: &mut [u8]) {
    match (data.len(), field) {
        (4, 0x0) => LittleEndian::write_u32(data, entry.msg_addr_lo),
        (4, 0x4) => LittleEndian::write_u32(data, entry.msg_addr_hi),
        (4, 0x8) => LittleEndian::write_u32(data, entry.msg_data),
        (4, MSIX_ENTRY_VECTOR_CTRL) => LittleEndian::write_u32(data, entry.vector_ctl),
        (8, 0x0) => LittleEndian::write_u64(
            data,
            u64::from(entry.msg_addr_hi) << 32 | u64::from(entry.msg_addr_lo),
        ),
        (8, 0x8) => LittleEndian::write_u64(
            data,
            u64::from(entry.vector_ctl) << 32 | u64::from(entry.msg_data),
        ),
        _ => error!("invalid MSI-X table entry read at 0x{:x}", field),
    }
}

/// Writes an aligned 4- or 8-byte window of a table entry.
pub fn write_entry(entry: &mut MsixTableEntry, field: u64, data: &[u8]) {
    match (data.len(), field) {
        (4, 0x0) => entry.msg_addr_lo = LittleEndian::read_u32(data),
        (4, 0x4) => entry.msg_addr_hi = LittleEndian::read_u32(data),
        (4, 0x8) => entry.msg_data = LittleEndian::read_u32(data),
        (4, MSIX_ENTRY_VECTOR_CTRL) => entry.vector_ctl = LittleEndian::read_u32(data),
        (8, 0x0) => {
            let value = LittleEndian::read_u64(data);
            entry.msg_addr_lo = value as u32;
            entry.msg_addr_hi = (value >> 32) as u32;
        }
        (8, 0x8) => {
            let value = LittleEndian::read_u64(data);
            entry.msg_data = value as u32;
            entry.vector_ctl = (value >> 32) as u32;
        }
        _ => error!("invalid MSI-X table entry write at 0x{:x}", field),
    }
}

/// The trapped guest window holding the virtual MSI-X table.
#[derive(Copy, Clone)]
pub struct MsixTable {
    pub bar: u32,
    pub size: u64,
    pub guest_addr: GuestAddress,
}

/// The trapped guest window holding the Pending Bit Array.
///
/// `fd_offset` is the absolute offset into the device fd at which guest PBA
/// reads are served; `bar_offset` is where the PBA sits within its BAR when
/// it shares the BAR with the table.
#[derive(Copy, Clone)]
pub struct MsixPba {
    pub bar: u32,
    pub size: u64,
    pub bar_offset: u64,
    pub fd_offset: u64,
    pub guest_addr: GuestAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_decoding() {
        let cap = MsixCap {
            msg_ctl: 0x8003,
            table: 0x0000_0001,
            pba: 0x0000_0803,
        };

        assert_eq!(cap.table_size(), 4);
        assert_eq!(cap.table_bir(), 1);
        assert_eq!(cap.table_offset(), 0);
        assert_eq!(cap.pba_bir(), 3);
        assert_eq!(cap.pba_offset(), 0x800);
    }

    #[test]
    fn entry_dword_access() {
        let mut entry = MsixTableEntry::default();

        write_entry(&mut entry, 0x0, &0xfee0_0000u32.to_le_bytes());
        write_entry(&mut entry, 0x8, &0x21u32.to_le_bytes());
        write_entry(&mut entry, 0xc, &1u32.to_le_bytes());

        assert_eq!(entry.msg_addr_lo, 0xfee0_0000);
        assert_eq!(entry.msg_data, 0x21);
        assert!(entry.masked());

        let mut data = [0u8; 4];
        read_entry(&entry, 0x0, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xfee0_0000);
    }

    #[test]
    fn entry_qword_access() {
        let mut entry = MsixTableEntry::default();

        write_entry(&mut entry, 0x0, &0x0000_0001_fee0_0000u64.to_le_bytes());
        write_entry(&mut entry, 0x8, &0x0000_0000_0000_0042u64.to_le_bytes());

        assert_eq!(entry.msg_addr_lo, 0xfee0_0000);
        assert_eq!(entry.msg_addr_hi, 1);
        assert_eq!(entry.msg_data, 0x42);
        assert!(!entry.masked());

        let mut data = [0u8; 8];
        read_entry(&entry, 0x8, &mut data);
        assert_eq!(u64::from_le_bytes(data), 0x42);

        let msg = entry.message();
        assert_eq!(msg.addr_lo, 0xfee0_0000);
        assert_eq!(msg.addr_hi, 1);
        assert_eq!(msg.data, 0x42);
    }
}
