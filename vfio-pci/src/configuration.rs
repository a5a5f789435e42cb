// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use byteorder::{ByteOrder, LittleEndian};

use crate::msi::MsiCap;
use crate::msix::MSIX_CAP_SIZE;

/// Size of the legacy PCI configuration space image presented to the guest.
pub const PCI_CFG_SPACE_SIZE: usize = 256;

// Standard header layout, <linux/pci_regs.h> names.
const PCI_STD_HEADER_SIZE: usize = 64;
const PCI_STATUS: usize = 0x06;
const PCI_HEADER_TYPE: usize = 0x0e;
const PCI_BASE_ADDRESS_0: usize = 0x10;
const PCI_CARDBUS_CIS: usize = 0x28;
pub const PCI_ROM_ADDRESS: usize = 0x30;
const PCI_CAPABILITY_LIST: usize = 0x34;
const PCI_INTERRUPT_LINE: usize = 0x3c;
const PCI_INTERRUPT_PIN: usize = 0x3d;

const PCI_STATUS_CAP_LIST: u16 = 0x10;
pub const PCI_HEADER_TYPE_NORMAL: u8 = 0;

// BAR encoding bits.
pub const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x1;
pub const PCI_BASE_ADDRESS_MEM_TYPE_64: u32 = 0x4;
pub const PCI_BASE_ADDRESS_IO_MASK: u32 = !0x3;
pub const PCI_BASE_ADDRESS_MEM_MASK: u32 = !0xf;

/// Number of BAR slots in a type 0 header.
pub const BAR_NUMS: usize = 6;

// PCIe capability clamped to the V1 root-complex-endpoint length: none of
// the link, slot or root-complex registers are exposed to the guest.
const PCI_CAP_EXP_RC_ENDPOINT_SIZE_V1: usize = 12;

/// Types of PCI capabilities.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PciCapabilityId {
    MessageSignalledInterrupts,
    PciExpress,
    MsiX,
    Other(u8),
}

impl From<u8> for PciCapabilityId {
    fn from(id: u8) -> Self {
        match id {
            0x05 => PciCapabilityId::MessageSignalledInterrupts,
            0x10 => PciCapabilityId::PciExpress,
            0x11 => PciCapabilityId::MsiX,
            other => PciCapabilityId::Other(other),
        }
    }
}

/// Offsets of the capabilities surviving the rewrite.
#[derive(Debug, Copy, Clone, Default)]
pub struct RetainedCapabilities {
    pub msi: Option<u8>,
    pub msix: Option<u8>,
    pub pcie: bool,
}

/// The synthesized configuration space image the guest sees.
///
/// Created from the 256 bytes read out of the physical function, then
/// rewritten: the capability list is filtered, the BAR slots are replaced
/// with guest addresses and the result is written back to the device so
/// that host and guest views stay consistent.
pub struct PciHeader {
    bytes: [u8; PCI_CFG_SPACE_SIZE],
}

impl PciHeader {
    pub fn from_bytes(bytes: [u8; PCI_CFG_SPACE_SIZE]) -> Self {
        PciHeader { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Serves a guest read of the synthesized image. Out-of-range bytes
    /// read as 0xff, like a missing function.
    pub fn read(&self, offset: u64, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = *self
                .bytes
                .get(offset as usize + i)
                .unwrap_or(&0xff);
        }
    }

    /// Applies a guest write to the synthesized image. Write-masking of
    /// read-only registers and BAR size probing belong to the bus layer.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        if offset + data.len() > PCI_CFG_SPACE_SIZE {
            warn!("bad config space write at 0x{:x}", offset);
            return;
        }
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn u8_at(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.bytes[offset..offset + 2])
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.bytes[offset..offset + 4])
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        LittleEndian::write_u16(&mut self.bytes[offset..offset + 2], value);
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.bytes[offset..offset + 4], value);
    }

    pub fn status(&self) -> u16 {
        self.u16_at(PCI_STATUS)
    }

    pub fn set_status(&mut self, status: u16) {
        self.set_u16(PCI_STATUS, status);
    }

    pub fn header_type(&self) -> u8 {
        self.u8_at(PCI_HEADER_TYPE)
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        self.set_u8(PCI_HEADER_TYPE, header_type);
    }

    pub fn capabilities_ptr(&self) -> u8 {
        self.u8_at(PCI_CAPABILITY_LIST)
    }

    pub fn set_capabilities_ptr(&mut self, pos: u8) {
        self.set_u8(PCI_CAPABILITY_LIST, pos);
    }

    pub fn irq_line(&self) -> u8 {
        self.u8_at(PCI_INTERRUPT_LINE)
    }

    pub fn irq_pin(&self) -> u8 {
        self.u8_at(PCI_INTERRUPT_PIN)
    }

    pub fn bar(&self, bar: usize) -> u32 {
        self.u32_at(PCI_BASE_ADDRESS_0 + bar * 4)
    }

    pub fn set_bar(&mut self, bar: usize, value: u32) {
        self.set_u32(PCI_BASE_ADDRESS_0 + bar * 4, value);
    }

    /// Address programmed in a BAR slot, with the encoding bits stripped.
    pub fn bar_address(&self, bar: usize) -> u32 {
        let value = self.bar(bar);
        if value & PCI_BASE_ADDRESS_SPACE_IO != 0 {
            value & PCI_BASE_ADDRESS_IO_MASK
        } else {
            value & PCI_BASE_ADDRESS_MEM_MASK
        }
    }

    pub fn bar_is_io(&self, bar: usize) -> bool {
        self.bar(bar) & PCI_BASE_ADDRESS_SPACE_IO != 0
    }

    pub fn set_cardbus_cis(&mut self, value: u32) {
        self.set_u32(PCI_CARDBUS_CIS, value);
    }

    pub fn set_rom_address(&mut self, value: u32) {
        self.set_u32(PCI_ROM_ADDRESS, value);
    }

    /// Walks the capability chain, yielding `(offset, id)` pairs.
    pub fn capabilities(&self) -> CapabilityIter<'_> {
        let pos = if self.status() & PCI_STATUS_CAP_LIST != 0 {
            self.capabilities_ptr() & !3
        } else {
            0
        };
        CapabilityIter { header: self, pos }
    }

    /// Finds a capability by id in the chain.
    pub fn find_capability(&self, id: PciCapabilityId) -> Option<u8> {
        self.capabilities()
            .find(|(_, cap_id)| *cap_id == id)
            .map(|(pos, _)| pos)
    }

    /// Rewrites the capability list, keeping only the capabilities this
    /// device model mediates: MSI, MSI-X and (when the platform expresses
    /// PCIe to the guest) the Express capability header. Retained
    /// capabilities stay at their original offsets and are relinked in the
    /// order they are encountered; everything else above the standard
    /// header is wiped.
    pub fn filter_capabilities(&mut self, keep_pcie: bool) -> RetainedCapabilities {
        let mut retained = RetainedCapabilities::default();

        if self.status() & PCI_STATUS_CAP_LIST == 0 {
            return retained;
        }

        let mut virt = [0u8; PCI_CFG_SPACE_SIZE];
        let mut pos = self.capabilities_ptr() & !3;
        self.set_status(self.status() & !PCI_STATUS_CAP_LIST);
        self.set_capabilities_ptr(0);

        let mut last: Option<usize> = None;
        while pos != 0 {
            let cap = pos as usize;
            if cap < PCI_STD_HEADER_SIZE || cap + 2 > PCI_CFG_SPACE_SIZE {
                warn!("capability chain points at 0x{:x}, stopping", cap);
                break;
            }

            let id = self.bytes[cap];
            let next = self.bytes[cap + 1];

            let size = match PciCapabilityId::from(id) {
                PciCapabilityId::MsiX => Some(MSIX_CAP_SIZE),
                PciCapabilityId::MessageSignalledInterrupts => {
                    Some(MsiCap::new(self.u16_at(cap + 2)).size())
                }
                PciCapabilityId::PciExpress if keep_pcie => {
                    Some(PCI_CAP_EXP_RC_ENDPOINT_SIZE_V1)
                }
                _ => None,
            };

            if let Some(size) = size.filter(|size| cap + size <= PCI_CFG_SPACE_SIZE) {
                virt[cap..cap + size].copy_from_slice(&self.bytes[cap..cap + size]);
                virt[cap + 1] = 0;

                match last {
                    None => {
                        self.set_capabilities_ptr(pos);
                        self.set_status(self.status() | PCI_STATUS_CAP_LIST);
                    }
                    Some(prev) => virt[prev + 1] = pos,
                }
                last = Some(cap);

                match PciCapabilityId::from(id) {
                    PciCapabilityId::MessageSignalledInterrupts => retained.msi = Some(pos),
                    PciCapabilityId::MsiX => retained.msix = Some(pos),
                    PciCapabilityId::PciExpress => retained.pcie = true,
                    PciCapabilityId::Other(_) => {}
                }
            }

            pos = next;
        }

        self.bytes[PCI_STD_HEADER_SIZE..].copy_from_slice(&virt[PCI_STD_HEADER_SIZE..]);

        retained
    }
}

pub struct CapabilityIter<'a> {
    header: &'a PciHeader,
    pos: u8,
}

impl Iterator for CapabilityIter<'_> {
    type Item = (u8, PciCapabilityId);

    fn next(&mut self) -> Option<Self::Item> {
        let cap = self.pos as usize;
        if cap < PCI_STD_HEADER_SIZE || cap + 2 > PCI_CFG_SPACE_SIZE {
            return None;
        }

        let pos = self.pos;
        let id = PciCapabilityId::from(self.header.bytes[cap]);
        self.pos = self.header.bytes[cap + 1];
        Some((pos, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_with_caps(caps: &[(u8, Vec<u8>)]) -> PciHeader {
        let mut bytes = [0u8; PCI_CFG_SPACE_SIZE];
        LittleEndian::write_u16(&mut bytes[0..2], 0x1af4);
        LittleEndian::write_u16(&mut bytes[2..4], 0x1042);

        if !caps.is_empty() {
            LittleEndian::write_u16(&mut bytes[PCI_STATUS..PCI_STATUS + 2], PCI_STATUS_CAP_LIST);
            bytes[PCI_CAPABILITY_LIST] = caps[0].0;
        }
        for (pos, data) in caps {
            let pos = *pos as usize;
            bytes[pos..pos + data.len()].copy_from_slice(data);
        }

        PciHeader::from_bytes(bytes)
    }

    // id, next, then the body of each capability kind.
    fn msi_cap(next: u8, ctrl: u16) -> Vec<u8> {
        let mut cap = vec![0x05, next, 0, 0];
        LittleEndian::write_u16(&mut cap[2..4], ctrl);
        cap.resize(24, 0xab);
        cap
    }

    fn msix_cap(next: u8, nr_entries: u16) -> Vec<u8> {
        let mut cap = vec![0x11, next];
        cap.extend_from_slice(&(nr_entries - 1).to_le_bytes());
        cap.extend_from_slice(&0u32.to_le_bytes()); // table in BAR 0
        cap.extend_from_slice(&0x800u32.to_le_bytes()); // PBA in BAR 0
        cap
    }

    fn pm_cap(next: u8) -> Vec<u8> {
        vec![0x01, next, 0x03, 0x00, 0x08, 0x00, 0x00, 0x00]
    }

    fn exp_cap(next: u8) -> Vec<u8> {
        let mut cap = vec![0x10, next];
        cap.resize(60, 0xcd);
        cap
    }

    #[test]
    fn filter_keeps_only_mediated_capabilities() {
        let mut header = header_with_caps(&[
            (0x40, pm_cap(0x50)),
            (0x50, msi_cap(0x70, 0x0180)), // 64-bit + per-vector mask
            (0x70, msix_cap(0x90, 4)),
            (0x90, exp_cap(0)),
        ]);

        let retained = header.filter_capabilities(false);

        assert_eq!(retained.msi, Some(0x50));
        assert_eq!(retained.msix, Some(0x70));
        assert!(!retained.pcie);

        // The rewritten chain lists exactly the retained capabilities, in
        // insertion order, and terminates.
        let chain: Vec<_> = header.capabilities().collect();
        assert_eq!(
            chain,
            vec![
                (0x50, PciCapabilityId::MessageSignalledInterrupts),
                (0x70, PciCapabilityId::MsiX),
            ]
        );
        assert_eq!(header.capabilities_ptr(), 0x50);
        assert_ne!(header.status() & PCI_STATUS_CAP_LIST, 0);
        assert_eq!(header.u8_at(0x71), 0);

        // Dropped capabilities are wiped.
        assert_eq!(header.u32_at(0x40), 0);
        assert_eq!(header.u32_at(0x90), 0);
    }

    #[test]
    fn filter_clamps_sizes() {
        let mut header = header_with_caps(&[
            (0x50, msi_cap(0x90, 0x0180)), // 10 + 4 + 10 = 24 bytes
            (0x90, exp_cap(0)),
        ]);

        let retained = header.filter_capabilities(true);
        assert!(retained.pcie);

        // MSI: 24 bytes survive, the next byte is gone.
        assert_eq!(header.u8_at(0x50 + 23), 0xab);
        assert_eq!(header.u8_at(0x50 + 24), 0);

        // PCIe: clamped to the V1 root-complex-endpoint size.
        assert_eq!(header.u8_at(0x90 + 11), 0xcd);
        assert_eq!(header.u8_at(0x90 + 12), 0);
    }

    #[test]
    fn filter_without_cap_list() {
        let mut header = header_with_caps(&[]);
        let retained = header.filter_capabilities(true);

        assert!(retained.msi.is_none());
        assert!(retained.msix.is_none());
        assert_eq!(header.capabilities().count(), 0);
    }

    #[test]
    fn guest_access_round_trip() {
        let mut header = header_with_caps(&[(0x50, msi_cap(0, 0x0180))]);
        header.filter_capabilities(false);

        // Every byte of a retained capability reads back as written.
        for offset in 0x50u64..0x68 {
            header.write(offset, &[0x5a]);
            let mut data = [0u8; 1];
            header.read(offset, &mut data);
            assert_eq!(data[0], 0x5a);
        }

        let mut wide = [0u8; 4];
        header.write(0x54, &[0x12, 0x34, 0x56, 0x78]);
        header.read(0x54, &mut wide);
        assert_eq!(wide, [0x12, 0x34, 0x56, 0x78]);

        // Past the end of the image reads as all ones.
        let mut past = [0u8; 2];
        header.read(0xff, &mut past);
        assert_eq!(past, [0xff, 0xff]);
    }

    #[test]
    fn bar_helpers() {
        let mut header = header_with_caps(&[]);
        header.set_bar(0, 0xc000_0000);
        header.set_bar(1, 0x3001);

        assert!(!header.bar_is_io(0));
        assert_eq!(header.bar_address(0), 0xc000_0000);
        assert!(header.bar_is_io(1));
        assert_eq!(header.bar_address(1), 0x3000);
    }
}
