// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::null_mut;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vfio_bindings::bindings::vfio::{
    VFIO_IRQ_INFO_AUTOMASKED, VFIO_IRQ_INFO_EVENTFD, VFIO_PCI_CONFIG_REGION_INDEX,
    VFIO_PCI_INTX_IRQ_INDEX, VFIO_PCI_MSIX_IRQ_INDEX, VFIO_PCI_MSI_IRQ_INDEX,
    VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ, VFIO_REGION_INFO_FLAG_WRITE,
};
use vfio_ioctls::{VfioDevice, VfioError, VfioIrq, VfioRegionInfo};
use vm_memory::{Address, GuestAddress};
use vmm_sys_util::eventfd::EventFd;

use crate::configuration::{
    PciHeader, BAR_NUMS, PCI_BASE_ADDRESS_IO_MASK, PCI_BASE_ADDRESS_MEM_MASK,
    PCI_BASE_ADDRESS_MEM_TYPE_64, PCI_BASE_ADDRESS_SPACE_IO, PCI_CFG_SPACE_SIZE,
    PCI_HEADER_TYPE_NORMAL, PCI_ROM_ADDRESS,
};
use crate::interrupt::{reserve_irq_fds, IntxRouting, IrqRouting, MsiCommon, MsiMessage};
use crate::msi::{MsiCap, MSI_ADDR_LO_OFFSET, MSI_CTL_ENABLE, MSI_CTL_MULTI_MSG_ENABLE, MSI_FLAGS_OFFSET};
use crate::msix::{
    self, MsixCap, MsixPba, MsixTable, MSIX_CAP_SIZE, MSIX_CTL_ENABLE, MSIX_CTL_FUNCTION_MASK,
    MSIX_ENTRY_CTRL_MASKBIT, MSIX_ENTRY_VECTOR_CTRL, MSIX_TABLE_ENTRY_SIZE,
};
use crate::vm::{AddressAllocator, Vm};

#[derive(Debug, Error)]
pub enum VfioPciError {
    #[error("device has no config space region")]
    MissingConfigSpace,
    #[error("failed to read the device config space: {0}")]
    ReadConfigSpace(#[source] io::Error),
    #[error("unsupported header type {0}")]
    UnsupportedHeaderType(u8),
    #[error("BAR {0} region size 0x{1:x} is not a power of two")]
    RegionSizeNotPowerOfTwo(u32, u64),
    #[error("failed to allocate 0x{0:x} bytes of guest address space")]
    GuestBlockAllocation(u64),
    #[error("MSI-X BAR {0} has no backing region")]
    MissingMsixBar(u32),
    #[error("MSI-X table overlaps with the PBA")]
    MsixTableOverlapsPba,
    #[error("MSI-X PBA exceeds its region")]
    MsixPbaOutOfRange,
    #[error("no IRQ at index {0} reported by VFIO")]
    MissingIrq(u32),
    #[error("IRQ index {0} is not event-fd capable")]
    IrqNotEventFd(u32),
    #[error("INTx IRQ is not auto-masked")]
    IntxNotAutoMasked,
    #[error("IRQ index {index} reports {reported} vectors, capability advertises {expected}")]
    InvalidVectorCount {
        index: u32,
        reported: u32,
        expected: usize,
    },
    #[error("failed to create eventfd: {0}")]
    EventFd(#[source] io::Error),
    #[error("failed to update interrupt routing: {0}")]
    Routing(#[source] io::Error),
    #[error("failed to enable INTx: {0}")]
    EnableIntx(#[source] VfioError),
    #[error("failed to enable MSI: {0}")]
    EnableMsi(#[source] VfioError),
    #[error("failed to enable MSI-X: {0}")]
    EnableMsix(#[source] VfioError),
    #[error("failed to disable interrupts: {0}")]
    DisableIrq(#[source] VfioError),
    #[error("failed to update guest MMIO traps: {0}")]
    TrapRegistration(#[source] io::Error),
    #[error("failed to map VFIO region into the guest: {0}")]
    MapRegionGuest(#[source] io::Error),
}

/// A host mapping of a device region, unmapped on drop.
pub struct DeviceMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is exclusively owned and access synchronization is
// the VMM's business.
unsafe impl Send for DeviceMapping {}
// SAFETY: see above.
unsafe impl Sync for DeviceMapping {}

impl DeviceMapping {
    pub fn mmap(fd: RawFd, offset: u64, size: u64, prot: i32) -> io::Result<Self> {
        let Ok(offset) = libc::off_t::try_from(offset) else {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        };
        let Ok(size) = usize::try_from(size) else {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        };

        // SAFETY: mapping a device fd region; the fd outlives this call and
        // the result is checked against MAP_FAILED.
        let addr = unsafe { libc::mmap(null_mut(), size, prot, libc::MAP_SHARED, fd, offset) };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(DeviceMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for DeviceMapping {
    fn drop(&mut self) {
        // SAFETY: addr and size come from a successful mmap.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// The passthrough-driver seam.
///
/// `VfioDeviceWrapper` adapts the real device fd; tests substitute
/// recording fakes.
pub trait Vfio: Send + Sync {
    fn read_config(&self, offset: u32, data: &mut [u8]) {
        self.region_read(VFIO_PCI_CONFIG_REGION_INDEX, offset.into(), data);
    }

    fn write_config(&self, offset: u32, data: &[u8]) {
        self.region_write(VFIO_PCI_CONFIG_REGION_INDEX, offset.into(), data);
    }

    fn reset(&self) {}

    fn num_regions(&self) -> u32;

    fn get_region_info(&self, index: u32) -> Option<VfioRegionInfo>;

    fn get_irq_info(&self, index: u32) -> Option<VfioIrq>;

    /// Assigns trigger event fds to `fds.len()` vectors starting at
    /// `start`; `None` entries de-assign.
    fn enable_irq_fds(&self, index: u32, start: u32, fds: &[Option<&EventFd>])
        -> Result<(), VfioError>;

    fn set_unmask_fd(&self, index: u32, fd: &EventFd) -> Result<(), VfioError>;

    fn disable_irq(&self, index: u32) -> Result<(), VfioError>;

    fn region_read(&self, index: u32, offset: u64, data: &mut [u8]);

    fn region_write(&self, index: u32, offset: u64, data: &[u8]);

    /// Reads at an absolute offset into the device fd.
    fn read_at(&self, offset: u64, data: &mut [u8]) -> io::Result<()>;

    fn mmap_region(&self, info: &VfioRegionInfo) -> io::Result<DeviceMapping>;
}

pub struct VfioDeviceWrapper {
    device: Arc<VfioDevice>,
}

impl VfioDeviceWrapper {
    pub fn new(device: Arc<VfioDevice>) -> Self {
        VfioDeviceWrapper { device }
    }
}

impl Vfio for VfioDeviceWrapper {
    fn reset(&self) {
        self.device.reset()
    }

    fn num_regions(&self) -> u32 {
        self.device.num_regions()
    }

    fn get_region_info(&self, index: u32) -> Option<VfioRegionInfo> {
        self.device.get_region_info(index)
    }

    fn get_irq_info(&self, index: u32) -> Option<VfioIrq> {
        self.device.get_irq_info(index).ok()
    }

    fn enable_irq_fds(
        &self,
        index: u32,
        start: u32,
        fds: &[Option<&EventFd>],
    ) -> Result<(), VfioError> {
        self.device.enable_irq(index, start, fds)
    }

    fn set_unmask_fd(&self, index: u32, fd: &EventFd) -> Result<(), VfioError> {
        self.device.set_unmask_eventfd(index, fd)
    }

    fn disable_irq(&self, index: u32) -> Result<(), VfioError> {
        self.device.disable_irq(index)
    }

    fn region_read(&self, index: u32, offset: u64, data: &mut [u8]) {
        self.device.region_read(index, offset, data)
    }

    fn region_write(&self, index: u32, offset: u64, data: &[u8]) {
        self.device.region_write(index, offset, data)
    }

    fn read_at(&self, offset: u64, data: &mut [u8]) -> io::Result<()> {
        self.device.read_at(offset, data)
    }

    fn mmap_region(&self, info: &VfioRegionInfo) -> io::Result<DeviceMapping> {
        let mut prot = 0;
        if info.flags & VFIO_REGION_INFO_FLAG_READ != 0 {
            prot |= libc::PROT_READ;
        }
        if info.flags & VFIO_REGION_INFO_FLAG_WRITE != 0 {
            prot |= libc::PROT_WRITE;
        }

        DeviceMapping::mmap(self.device.as_raw_fd(), info.offset, info.size, prot)
    }
}

/// One BAR of the assigned device.
struct Region {
    info: VfioRegionInfo,
    is_ioport: bool,
    port_base: u64,
    guest_addr: GuestAddress,
    mapping: Option<DeviceMapping>,
    /// Served by trap-and-forward instead of a direct mapping.
    trapped: bool,
}

impl Default for Region {
    fn default() -> Self {
        Region {
            info: VfioRegionInfo::default(),
            is_ioport: false,
            port_base: 0,
            guest_addr: GuestAddress(0),
            mapping: None,
            trapped: false,
        }
    }
}

impl Region {
    fn absent(&self) -> bool {
        self.info.size == 0
    }
}

struct VfioMsi {
    cap_offset: u8,
    common: Mutex<MsiCommon>,
}

/// The two trapped windows of the MSI-X BAR(s). Table and PBA may share a
/// BAR; their traps are registered separately either way.
#[derive(Copy, Clone)]
struct MsixWindows {
    table: MsixTable,
    pba: MsixPba,
}

enum MsixAccess {
    Table(u64),
    Pba(MsixPba, u64),
}

impl MsixWindows {
    fn locate(&self, addr: u64) -> Option<MsixAccess> {
        let table_start = self.table.guest_addr.raw_value();
        if addr >= table_start && addr < table_start + self.table.size {
            return Some(MsixAccess::Table(addr - table_start));
        }

        let pba_start = self.pba.guest_addr.raw_value();
        if addr >= pba_start && addr < pba_start + self.pba.size {
            return Some(MsixAccess::Pba(self.pba, addr - pba_start));
        }

        None
    }
}

struct VfioMsix {
    cap_offset: u8,
    common: Mutex<MsiCommon>,
    windows: Mutex<MsixWindows>,
}

const PAGE_SIZE: u64 = 0x1000;

fn align_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// Express capability emulation needs a PCIe host bridge on the guest side,
// which only the aarch64 platform provides.
fn pcie_supported() -> bool {
    cfg!(target_arch = "aarch64")
}

fn find_mmio_region(regions: &[Region], addr: u64) -> Option<(u32, u64)> {
    regions.iter().enumerate().find_map(|(index, region)| {
        let start = region.guest_addr.raw_value();
        (!region.absent() && !region.is_ioport && addr >= start && addr < start + region.info.size)
            .then(|| (index as u32, addr - start))
    })
}

fn find_pio_region(regions: &[Region], port: u64) -> Option<(u32, u64)> {
    regions.iter().enumerate().find_map(|(index, region)| {
        (!region.absent()
            && region.is_ioport
            && port >= region.port_base
            && port < region.port_base + region.info.size)
            .then(|| (index as u32, port - region.port_base))
    })
}

/// A physical PCI function assigned to the guest.
///
/// Owns the synthesized configuration header, the BAR table and the three
/// interrupt engines. The bus subsystem routes guest config accesses to
/// [`read_header`](Self::read_header)/[`write_header`](Self::write_header)
/// plus the [`config_read`](Self::config_read)/
/// [`config_write`](Self::config_write) dispatcher, BAR reprogramming to
/// [`activate_bar`](Self::activate_bar)/
/// [`deactivate_bar`](Self::deactivate_bar), and trapped guest accesses to
/// [`mmio_read`](Self::mmio_read)/[`mmio_write`](Self::mmio_write).
pub struct VfioPciDevice {
    name: String,
    /// Routing identity handed to the interrupt controller with each MSI
    /// route, derived from the device's slot number.
    dev_id: u32,
    vfio: Arc<dyn Vfio>,
    routing: Arc<dyn IrqRouting>,
    vm: Arc<dyn Vm>,
    header: Mutex<PciHeader>,
    regions: Mutex<Vec<Region>>,
    intx: Option<Mutex<IntxRouting>>,
    msi: Option<VfioMsi>,
    msix: Option<VfioMsix>,
}

impl VfioPciDevice {
    pub fn new(
        name: &str,
        device: Arc<VfioDevice>,
        allocator: &mut dyn AddressAllocator,
        routing: Arc<dyn IrqRouting>,
        vm: Arc<dyn Vm>,
        dev_id: u32,
        legacy_gsi: Option<u32>,
    ) -> Result<Self, VfioPciError> {
        Self::with_backend(
            name,
            Arc::new(VfioDeviceWrapper::new(device)),
            allocator,
            routing,
            vm,
            dev_id,
            legacy_gsi,
        )
    }

    pub(crate) fn with_backend(
        name: &str,
        vfio: Arc<dyn Vfio>,
        allocator: &mut dyn AddressAllocator,
        routing: Arc<dyn IrqRouting>,
        vm: Arc<dyn Vm>,
        dev_id: u32,
        legacy_gsi: Option<u32>,
    ) -> Result<Self, VfioPciError> {
        vfio.reset();

        let config_info = vfio
            .get_region_info(VFIO_PCI_CONFIG_REGION_INDEX)
            .filter(|info| info.size != 0)
            .ok_or(VfioPciError::MissingConfigSpace)?;

        let mut bytes = [0u8; PCI_CFG_SPACE_SIZE];
        vfio.read_at(config_info.offset, &mut bytes)
            .map_err(VfioPciError::ReadConfigSpace)?;
        let mut header = PciHeader::from_bytes(bytes);

        // Multi-function assignment is not supported; strip bit 7.
        header.set_header_type(header.header_type() & 0x7f);
        if header.header_type() != PCI_HEADER_TYPE_NORMAL {
            return Err(VfioPciError::UnsupportedHeaderType(header.header_type()));
        }

        let retained = header.filter_capabilities(pcie_supported());

        let msix = match retained.msix {
            Some(pos) => Some(Self::create_msix(&mut header, pos, &*vfio, allocator)?),
            None => None,
        };

        let msi = retained.msi.map(|pos| {
            let cap = MsiCap::new(header.u16_at(pos as usize + MSI_FLAGS_OFFSET as usize));
            VfioMsi {
                cap_offset: pos,
                common: Mutex::new(MsiCommon::new(VFIO_PCI_MSI_IRQ_INDEX, cap.num_vectors())),
            }
        });

        let regions = Self::configure_bars(&header, &*vfio, allocator, msix.as_ref())?;

        Self::fixup_header(&mut header, &regions);

        // Install the synthesized image on the device, so the hardware view
        // of config space matches what the guest will be told.
        vfio.write_config(0, header.as_bytes());

        let mut device = VfioPciDevice {
            name: name.to_owned(),
            dev_id,
            vfio,
            routing,
            vm,
            header: Mutex::new(header),
            regions: Mutex::new(regions),
            intx: None,
            msi,
            msix,
        };

        device.initialize_irqs(legacy_gsi)?;

        Ok(device)
    }

    fn create_msix(
        header: &mut PciHeader,
        pos: u8,
        vfio: &dyn Vfio,
        allocator: &mut dyn AddressAllocator,
    ) -> Result<VfioMsix, VfioPciError> {
        let cap_base = pos as usize;
        let cap = MsixCap {
            msg_ctl: header.u16_at(cap_base + 2),
            table: header.u32_at(cap_base + 4),
            pba: header.u32_at(cap_base + 8),
        };

        let nr_entries = cap.table_size() as usize;
        let table_bar = cap.table_bir();
        let pba_bar = cap.pba_bir();
        let table_size = (nr_entries * MSIX_TABLE_ENTRY_SIZE) as u64;
        let pba_size = (nr_entries as u64 + 63) / 64 * 8;
        let pba_bar_offset = u64::from(cap.pba_offset());

        let table_info = vfio
            .get_region_info(table_bar)
            .filter(|info| info.size != 0)
            .ok_or(VfioPciError::MissingMsixBar(table_bar))?;
        let table_addr = allocator
            .allocate_mmio_block(align_page(table_info.size))
            .ok_or(VfioPciError::GuestBlockAllocation(table_info.size))?;

        // The physical PBA is usually smaller than a page and may not be
        // handed to the guest on its own, so it is always trapped. When it
        // shares the table's BAR it keeps its offset there; a dedicated PBA
        // BAR puts it at offset 0.
        let (pba_addr, bar_offset, fd_offset) = if table_bar == pba_bar {
            if table_size > pba_bar_offset {
                return Err(VfioPciError::MsixTableOverlapsPba);
            }
            if pba_bar_offset + pba_size > table_info.size {
                return Err(VfioPciError::MsixPbaOutOfRange);
            }
            (
                table_addr + pba_bar_offset,
                pba_bar_offset,
                table_info.offset + pba_bar_offset,
            )
        } else {
            let pba_info = vfio
                .get_region_info(pba_bar)
                .filter(|info| info.size != 0)
                .ok_or(VfioPciError::MissingMsixBar(pba_bar))?;
            let addr = allocator
                .allocate_mmio_block(align_page(pba_info.size))
                .ok_or(VfioPciError::GuestBlockAllocation(pba_info.size))?;
            (addr, 0, pba_info.offset + pba_bar_offset)
        };

        // The guest sees the virtual table at offset 0 of its BAR. Keep the
        // PBA offset when the BAR is shared, zero it otherwise.
        header.set_u32(cap_base + 4, cap.table_bir());
        if table_bar != pba_bar {
            header.set_u32(cap_base + 8, cap.pba_bir());
        }

        let mut common = MsiCommon::new(VFIO_PCI_MSIX_IRQ_INDEX, nr_entries);
        for vector in &mut common.vectors {
            // Reset state of the table: every vector masked.
            vector.config.vector_ctl = MSIX_ENTRY_CTRL_MASKBIT;
        }

        Ok(VfioMsix {
            cap_offset: pos,
            common: Mutex::new(common),
            windows: Mutex::new(MsixWindows {
                table: MsixTable {
                    bar: table_bar,
                    size: table_size,
                    guest_addr: GuestAddress(table_addr),
                },
                pba: MsixPba {
                    bar: pba_bar,
                    size: pba_size,
                    bar_offset,
                    fd_offset,
                    guest_addr: GuestAddress(pba_addr),
                },
            }),
        })
    }

    fn configure_bars(
        header: &PciHeader,
        vfio: &dyn Vfio,
        allocator: &mut dyn AddressAllocator,
        msix: Option<&VfioMsix>,
    ) -> Result<Vec<Region>, VfioPciError> {
        let mut regions: Vec<Region> = (0..BAR_NUMS).map(|_| Region::default()).collect();
        let mut is_64bit = false;

        for bar in 0..BAR_NUMS {
            if is_64bit {
                // Top half of the previous 64-bit BAR.
                is_64bit = false;
                continue;
            }

            let bar_value = header.bar(bar);
            is_64bit = bar_value & PCI_BASE_ADDRESS_SPACE_IO == 0
                && bar_value & PCI_BASE_ADDRESS_MEM_TYPE_64 != 0;

            if bar as u32 >= vfio.num_regions() {
                break;
            }
            let Some(info) = vfio.get_region_info(bar as u32) else {
                continue;
            };

            let region = &mut regions[bar];
            region.info = info;
            region.is_ioport = bar_value & PCI_BASE_ADDRESS_SPACE_IO != 0;

            if info.size == 0 {
                continue;
            }
            if !info.size.is_power_of_two() {
                return Err(VfioPciError::RegionSizeNotPowerOfTwo(bar as u32, info.size));
            }

            // MSI-X table and PBA BARs are trap-only: the guest address is
            // assigned but no host mapping will ever back it.
            if let Some(msix) = msix {
                let windows = msix.windows.lock().unwrap();
                if bar as u32 == windows.table.bar {
                    region.guest_addr = windows.table.guest_addr;
                    continue;
                }
                if bar as u32 == windows.pba.bar {
                    region.guest_addr = windows.pba.guest_addr;
                    continue;
                }
            }

            if region.is_ioport {
                region.port_base = allocator
                    .allocate_io_block(info.size)
                    .ok_or(VfioPciError::GuestBlockAllocation(info.size))?;
            } else {
                let map_size = align_page(info.size);
                region.guest_addr = GuestAddress(
                    allocator
                        .allocate_mmio_block(map_size)
                        .ok_or(VfioPciError::GuestBlockAllocation(map_size))?,
                );
            }
        }

        Ok(regions)
    }

    /// Rewrites the BAR slots with the guest's view of the device and drops
    /// the pieces that are not forwarded.
    fn fixup_header(header: &mut PciHeader, regions: &[Region]) {
        for (bar, region) in regions.iter().enumerate() {
            let base = if region.is_ioport {
                (region.port_base as u32 & PCI_BASE_ADDRESS_IO_MASK) | PCI_BASE_ADDRESS_SPACE_IO
            } else {
                region.guest_addr.raw_value() as u32 & PCI_BASE_ADDRESS_MEM_MASK
            };
            header.set_bar(bar, base);
        }

        // CardBus is not supported and the expansion ROM is not mapped into
        // the guest.
        header.set_cardbus_cis(0);
        header.set_rom_address(0);
    }

    fn initialize_irqs(&mut self, legacy_gsi: Option<u32>) -> Result<(), VfioPciError> {
        if let Some(msix) = &self.msix {
            let common = msix.common.lock().unwrap();
            Self::validate_irq_info(&*self.vfio, &common)?;
            reserve_irq_fds(common.vectors.len() as u64);
        }

        if let Some(msi) = &self.msi {
            let common = msi.common.lock().unwrap();
            Self::validate_irq_info(&*self.vfio, &common)?;
            reserve_irq_fds(common.vectors.len() as u64);
        }

        if self.header.lock().unwrap().irq_pin() == 0 {
            return Ok(());
        }
        let Some(gsi) = legacy_gsi else {
            // The platform did not wire a legacy line for this slot.
            return Ok(());
        };

        reserve_irq_fds(2);

        let irq = self
            .vfio
            .get_irq_info(VFIO_PCI_INTX_IRQ_INDEX)
            .filter(|irq| irq.count != 0)
            .ok_or(VfioPciError::MissingIrq(VFIO_PCI_INTX_IRQ_INDEX))?;
        if irq.flags & VFIO_IRQ_INFO_EVENTFD == 0 {
            return Err(VfioPciError::IrqNotEventFd(VFIO_PCI_INTX_IRQ_INDEX));
        }
        if irq.flags & VFIO_IRQ_INFO_AUTOMASKED == 0 {
            return Err(VfioPciError::IntxNotAutoMasked);
        }

        // INTx is armed from the start: there is no reliable way to know
        // when the guest begins using it.
        let mut intx = IntxRouting::new(gsi);
        intx.enable(&*self.vfio, &*self.routing)?;
        self.intx = Some(Mutex::new(intx));

        Ok(())
    }

    fn validate_irq_info(vfio: &dyn Vfio, common: &MsiCommon) -> Result<(), VfioPciError> {
        let irq = vfio
            .get_irq_info(common.irq_index)
            .filter(|irq| irq.count != 0)
            .ok_or(VfioPciError::MissingIrq(common.irq_index))?;

        if irq.flags & VFIO_IRQ_INFO_EVENTFD == 0 {
            return Err(VfioPciError::IrqNotEventFd(common.irq_index));
        }
        if irq.count as usize != common.vectors.len() {
            return Err(VfioPciError::InvalidVectorCount {
                index: common.irq_index,
                reported: irq.count,
                expected: common.vectors.len(),
            });
        }

        Ok(())
    }

    /// Serves a guest read of the synthesized configuration image; the bus
    /// layer calls this for accesses below 256 bytes.
    pub fn read_header(&self, offset: u64, data: &mut [u8]) {
        self.header.lock().unwrap().read(offset, data);
    }

    /// Applies a guest write to the synthesized configuration image. The
    /// side-effect dispatch stays in [`config_write`](Self::config_write).
    pub fn write_header(&self, offset: u64, data: &[u8]) {
        self.header.lock().unwrap().write(offset, data);
    }

    /// Config-space read callback: the data returned to the guest comes
    /// from the synthesized header, this only replays the access on the
    /// device in case it has read side effects.
    pub fn config_read(&self, offset: u64, len: usize) {
        let mut scratch = [0u8; 4];
        let len = len.min(scratch.len());
        self.vfio.read_config(offset as u32, &mut scratch[..len]);
    }

    /// Config-space write callback: forwards the write to the device, then
    /// dispatches to the MSI/MSI-X emulation when a mediated capability was
    /// touched, then replays a read for read-back side effects.
    pub fn config_write(&self, offset: u64, data: &[u8]) {
        if data.len() > 4 {
            warn!("{}: oversized config space write at 0x{:x}", self.name, offset);
            return;
        }

        // The ROM BAR is never propagated to the device.
        if offset as usize == PCI_ROM_ADDRESS {
            return;
        }

        self.vfio.write_config(offset as u32, data);

        if let Some(msix) = &self.msix {
            let cap_base = u64::from(msix.cap_offset);
            if offset >= cap_base && offset < cap_base + MSIX_CAP_SIZE as u64 {
                self.update_msix_cap(msix, offset - cap_base, data);
            }
        }

        if let Some(msi) = &self.msi {
            let cap_base = u64::from(msi.cap_offset);
            let cap_size = {
                let header = self.header.lock().unwrap();
                MsiCap::new(header.u16_at(msi.cap_offset as usize + MSI_FLAGS_OFFSET as usize))
                    .size() as u64
            };
            if offset >= cap_base && offset < cap_base + cap_size {
                self.update_msi_cap(msi, offset - cap_base, data);
            }
        }

        let mut scratch = [0u8; 4];
        self.vfio.read_config(offset as u32, &mut scratch[..data.len()]);
    }

    fn update_msix_cap(&self, msix: &VfioMsix, offset: u64, data: &[u8]) {
        // Only the byte holding the Enable and Function Mask bits matters.
        let enable_pos = 3u64;
        if offset > enable_pos || offset + data.len() as u64 <= enable_pos {
            return;
        }
        let flags = u16::from(data[(enable_pos - offset) as usize]) << 8;

        let mut common = msix.common.lock().unwrap();
        common
            .guest_state
            .set_masked(flags & MSIX_CTL_FUNCTION_MASK != 0);
        let enable = flags & MSIX_CTL_ENABLE != 0;
        common.guest_state.set_enabled(enable);

        if enable {
            if let Err(e) = self.enable_msis(&mut common) {
                error!("{}: cannot enable MSI-X: {}", self.name, e);
            }
        } else if let Err(e) = self.disable_msis(&mut common) {
            error!("{}: cannot disable MSI-X: {}", self.name, e);
        }
    }

    fn update_msi_cap(&self, msi: &VfioMsi, offset: u64, data: &[u8]) {
        let mut common = msi.common.lock().unwrap();

        // Guest poking the per-vector mask register?
        if self.msi_vector_write(msi, &mut common, offset, data) {
            return;
        }

        // Only changes to the enable byte modify routes.
        if offset > MSI_FLAGS_OFFSET || offset + data.len() as u64 <= MSI_FLAGS_OFFSET {
            return;
        }
        let ctrl = u16::from(data[(MSI_FLAGS_OFFSET - offset) as usize]);

        common.guest_state.set_enabled(ctrl & MSI_CTL_ENABLE != 0);
        if !common.guest_state.enabled() {
            if let Err(e) = self.disable_msis(&mut common) {
                error!("{}: cannot disable MSI: {}", self.name, e);
            }
            return;
        }

        let nr_vectors =
            (1usize << ((ctrl & MSI_CTL_MULTI_MSG_ENABLE) >> 4)).min(common.vectors.len());

        let cap_base = msi.cap_offset as usize;
        let (addr_lo, addr_hi, base_data) = {
            let header = self.header.lock().unwrap();
            let cap = MsiCap::new(header.u16_at(cap_base + MSI_FLAGS_OFFSET as usize));
            let addr_lo = header.u32_at(cap_base + MSI_ADDR_LO_OFFSET);
            let addr_hi = cap
                .addr_hi_offset()
                .map_or(0, |offset| header.u32_at(cap_base + offset));
            (addr_lo, addr_hi, header.u16_at(cap_base + cap.msg_data_offset()))
        };

        for i in 0..nr_vectors {
            // The message data low bits carry the vector number.
            let data16 = (base_data & !(nr_vectors as u16 - 1)) | i as u16;
            let vector = &mut common.vectors[i];
            vector.config.set_message(MsiMessage {
                addr_lo,
                addr_hi,
                data: u32::from(data16),
            });
            if let Err(e) = vector.update(&*self.routing, self.dev_id) {
                error!("{}: cannot configure MSI vector {}: {}", self.name, i, e);
            }
        }

        if let Err(e) = self.enable_msis(&mut common) {
            error!("{}: cannot enable MSI: {}", self.name, e);
        }
    }

    /// Handles writes hitting the MSI per-vector mask register. Returns
    /// false when the capability has no such register or the write misses
    /// it.
    fn msi_vector_write(
        &self,
        msi: &VfioMsi,
        common: &mut MsiCommon,
        offset: u64,
        data: &[u8],
    ) -> bool {
        let cap_base = msi.cap_offset as usize;
        let cap = {
            let header = self.header.lock().unwrap();
            MsiCap::new(header.u16_at(cap_base + MSI_FLAGS_OFFSET as usize))
        };

        let Some(mask_offset) = cap.mask_bits_offset() else {
            return false;
        };
        let mask_offset = mask_offset as u64;
        if offset >= mask_offset + 4 || offset + data.len() as u64 <= mask_offset {
            return false;
        }

        // Rebuild the register from the current guest state, then overlay
        // the intersection of the access with the register.
        let mut mask: u32 = 0;
        for (i, vector) in common.vectors.iter().enumerate() {
            if vector.guest_state.masked() {
                mask |= 1 << i;
            }
        }

        let mut bytes = mask.to_le_bytes();
        let start = offset.max(mask_offset);
        let limit = (offset + data.len() as u64).min(mask_offset + 4);
        for i in start..limit {
            bytes[(i - mask_offset) as usize] = data[(i - offset) as usize];
        }
        let mask = u32::from_le_bytes(bytes);

        for (i, vector) in common.vectors.iter_mut().enumerate() {
            let masked = mask & (1 << i) != 0;
            if masked != vector.guest_state.masked() {
                vector.guest_state.set_masked(masked);
                if let Err(e) = vector.update(&*self.routing, self.dev_id) {
                    error!("{}: cannot update MSI vector {} mask: {}", self.name, i, e);
                }
            }
        }

        true
    }

    /// Reconciles the physical capability with the guest state, called with
    /// the capability mutex held.
    fn enable_msis(&self, common: &mut MsiCommon) -> Result<(), VfioPciError> {
        if !common.guest_state.enabled() {
            return Ok(());
        }

        // INTx, MSI and MSI-X cannot be live at the same time; INTx has
        // been armed since setup, take it down first.
        self.disable_intx();

        let irq_index = common.irq_index;
        let wrap = move |e| {
            if irq_index == VFIO_PCI_MSIX_IRQ_INDEX {
                VfioPciError::EnableMsix(e)
            } else {
                VfioPciError::EnableMsi(e)
            }
        };

        // A Linux guest enables a large MSI-X capability masked, fills the
        // table, then unmasks the whole function once. Program the full
        // range with a single SET_IRQS on the initial enable and on that
        // first unmask; per-vector programming rounds would be pathological
        // with 2048 vectors.
        if !common.host_state.enabled()
            || (!common.guest_state.masked() && common.host_state.empty())
        {
            let mut empty = true;
            for i in 0..common.vectors.len() {
                let fd = common.vectors[i].raw_fd();
                common.programmed[i] = fd;
                if fd >= 0 {
                    empty = false;
                }
            }

            let fds: Vec<Option<&EventFd>> = common
                .vectors
                .iter()
                .map(|vector| {
                    if vector.gsi.is_some() {
                        vector.eventfd.as_ref()
                    } else {
                        None
                    }
                })
                .collect();

            self.vfio
                .enable_irq_fds(irq_index, 0, &fds)
                .map_err(wrap)?;

            common.host_state.set_enabled(true);
            common.host_state.set_empty(empty);

            return Ok(());
        }

        if common.guest_state.masked() {
            // TODO: mask every routed vector when the guest masks the whole
            // capability while the host side is live.
            return Ok(());
        }

        // Update individual vectors, leaving the ones in use alone.
        for i in 0..common.vectors.len() {
            let fd = common.vectors[i].raw_fd();
            if fd == common.programmed[i] {
                continue;
            }

            let entry = if fd >= 0 {
                common.vectors[i].eventfd.as_ref()
            } else {
                None
            };
            if let Err(e) = self.vfio.enable_irq_fds(irq_index, i as u32, &[entry]) {
                error!(
                    "{}: single-vector SET_IRQS failed for vector {}: {}",
                    self.name, i, e
                );
                break;
            }

            common.programmed[i] = fd;
            if common.host_state.empty() && fd >= 0 {
                common.host_state.set_empty(false);
            }
        }

        Ok(())
    }

    fn disable_msis(&self, common: &mut MsiCommon) -> Result<(), VfioPciError> {
        if !common.host_state.enabled() {
            return Ok(());
        }

        self.vfio
            .disable_irq(common.irq_index)
            .map_err(VfioPciError::DisableIrq)?;

        common.host_state.set_enabled(false);
        common.host_state.set_empty(true);

        // A driver dropping MSI after an interrupt failure expects the pin
        // interrupt to work again.
        self.enable_intx()?;

        Ok(())
    }

    fn enable_intx(&self) -> Result<(), VfioPciError> {
        if let Some(intx) = &self.intx {
            intx.lock()
                .unwrap()
                .enable(&*self.vfio, &*self.routing)?;
        }

        Ok(())
    }

    fn disable_intx(&self) {
        if let Some(intx) = &self.intx {
            intx.lock().unwrap().disable(&*self.vfio, &*self.routing);
        }
    }

    /// BAR activation callback, invoked by the bus after the guest wrote a
    /// new base address.
    pub fn activate_bar(&self, bar: u32, base: u64) -> Result<(), VfioPciError> {
        let mut regions = self.regions.lock().unwrap();
        let Some(region) = regions.get_mut(bar as usize) else {
            warn!("{}: activating unknown BAR {}", self.name, bar);
            return Ok(());
        };
        if region.absent() {
            return Ok(());
        }

        if region.is_ioport {
            region.port_base = base;
        } else {
            region.guest_addr = GuestAddress(base);
        }

        if let Some(msix) = &self.msix {
            let mut windows = msix.windows.lock().unwrap();

            if bar == windows.table.bar {
                windows.table.guest_addr = region.guest_addr;
                self.vm
                    .register_mmio_trap(windows.table.guest_addr, windows.table.size)
                    .map_err(VfioPciError::TrapRegistration)?;
                if windows.table.bar != windows.pba.bar {
                    return Ok(());
                }
            }

            if bar == windows.pba.bar {
                windows.pba.guest_addr = if windows.pba.bar == windows.table.bar {
                    GuestAddress(windows.table.guest_addr.raw_value() + windows.pba.bar_offset)
                } else {
                    region.guest_addr
                };
                self.vm
                    .register_mmio_trap(windows.pba.guest_addr, windows.pba.size)
                    .map_err(VfioPciError::TrapRegistration)?;
                return Ok(());
            }
        }

        self.map_region(region)
    }

    /// BAR deactivation callback, invoked by the bus before the guest moves
    /// or disables a BAR.
    pub fn deactivate_bar(&self, bar: u32) -> Result<(), VfioPciError> {
        let mut regions = self.regions.lock().unwrap();
        let Some(region) = regions.get_mut(bar as usize) else {
            warn!("{}: deactivating unknown BAR {}", self.name, bar);
            return Ok(());
        };
        if region.absent() {
            return Ok(());
        }

        if let Some(msix) = &self.msix {
            let windows = msix.windows.lock().unwrap();

            if bar == windows.table.bar {
                self.vm
                    .unregister_mmio_trap(windows.table.guest_addr, windows.table.size)
                    .map_err(VfioPciError::TrapRegistration)?;
                if windows.table.bar != windows.pba.bar {
                    return Ok(());
                }
            }

            if bar == windows.pba.bar {
                self.vm
                    .unregister_mmio_trap(windows.pba.guest_addr, windows.pba.size)
                    .map_err(VfioPciError::TrapRegistration)?;
                return Ok(());
            }
        }

        self.unmap_region(region);

        Ok(())
    }

    fn map_region(&self, region: &mut Region) -> Result<(), VfioPciError> {
        if region.is_ioport {
            self.vm
                .register_pio_trap(region.port_base, region.info.size)
                .map_err(VfioPciError::TrapRegistration)?;
            region.trapped = true;
            return Ok(());
        }

        if region.info.flags & VFIO_REGION_INFO_FLAG_MMAP != 0 {
            match self.vfio.mmap_region(&region.info) {
                Ok(mapping) => {
                    self.vm
                        .map_user_memory(region.guest_addr, mapping.addr(), mapping.size() as u64)
                        .map_err(VfioPciError::MapRegionGuest)?;
                    region.mapping = Some(mapping);
                    return Ok(());
                }
                Err(e) => warn!("{}: cannot mmap region: {}", self.name, e),
            }
        }

        // No direct mapping possible: trap the window and forward accesses.
        self.vm
            .register_mmio_trap(region.guest_addr, region.info.size)
            .map_err(VfioPciError::TrapRegistration)?;
        region.trapped = true;

        Ok(())
    }

    fn unmap_region(&self, region: &mut Region) {
        if let Some(mapping) = region.mapping.take() {
            if let Err(e) =
                self.vm
                    .unmap_user_memory(region.guest_addr, mapping.addr(), mapping.size() as u64)
            {
                error!("{}: cannot unmap region from the guest: {}", self.name, e);
            }
        }

        if region.trapped {
            let result = if region.is_ioport {
                self.vm
                    .unregister_pio_trap(region.port_base, region.info.size)
            } else {
                self.vm
                    .unregister_mmio_trap(region.guest_addr, region.info.size)
            };
            if let Err(e) = result {
                error!("{}: cannot unregister region trap: {}", self.name, e);
            }
            region.trapped = false;
        }
    }

    /// Trapped MMIO read: MSI-X table, PBA, or a forwarded data BAR.
    pub fn mmio_read(&self, addr: u64, data: &mut [u8]) {
        if let Some(msix) = &self.msix {
            let access = msix.windows.lock().unwrap().locate(addr);
            match access {
                Some(MsixAccess::Table(offset)) => return self.msix_table_read(msix, offset, data),
                Some(MsixAccess::Pba(pba, offset)) => return self.msix_pba_read(&pba, offset, data),
                None => {}
            }
        }

        let regions = self.regions.lock().unwrap();
        if let Some((index, offset)) = find_mmio_region(&regions, addr) {
            return self.vfio.region_read(index, offset, data);
        }

        warn!("{}: unhandled MMIO read at 0x{:x}", self.name, addr);
    }

    /// Trapped MMIO write.
    pub fn mmio_write(&self, addr: u64, data: &[u8]) {
        if let Some(msix) = &self.msix {
            let access = msix.windows.lock().unwrap().locate(addr);
            match access {
                Some(MsixAccess::Table(offset)) => return self.msix_table_write(msix, offset, data),
                // The Pending Bit Array is read-only.
                Some(MsixAccess::Pba(..)) => return,
                None => {}
            }
        }

        let regions = self.regions.lock().unwrap();
        if let Some((index, offset)) = find_mmio_region(&regions, addr) {
            return self.vfio.region_write(index, offset, data);
        }

        warn!("{}: unhandled MMIO write at 0x{:x}", self.name, addr);
    }

    /// Trapped IO-port read, forwarded to the device.
    pub fn pio_read(&self, port: u64, data: &mut [u8]) {
        let regions = self.regions.lock().unwrap();
        if let Some((index, offset)) = find_pio_region(&regions, port) {
            return self.vfio.region_read(index, offset, data);
        }

        warn!("{}: unhandled port read at 0x{:x}", self.name, port);
    }

    /// Trapped IO-port write, forwarded to the device.
    pub fn pio_write(&self, port: u64, data: &[u8]) {
        let regions = self.regions.lock().unwrap();
        if let Some((index, offset)) = find_pio_region(&regions, port) {
            return self.vfio.region_write(index, offset, data);
        }

        warn!("{}: unhandled port write at 0x{:x}", self.name, port);
    }

    fn table_access_valid(&self, offset: u64, len: usize) -> bool {
        // The PCI spec requires aligned 4- or 8-byte accesses for the
        // MSI-X table.
        if (len != 4 && len != 8) || offset & (len as u64 - 1) != 0 {
            warn!("{}: invalid MSI-X table access", self.name);
            return false;
        }

        true
    }

    fn msix_table_read(&self, msix: &VfioMsix, offset: u64, data: &mut [u8]) {
        if !self.table_access_valid(offset, data.len()) {
            return;
        }

        let vector = (offset / MSIX_TABLE_ENTRY_SIZE as u64) as usize;
        let field = offset % MSIX_TABLE_ENTRY_SIZE as u64;

        let common = msix.common.lock().unwrap();
        let Some(entry) = common.vectors.get(vector) else {
            warn!("{}: access outside of the MSI-X table", self.name);
            return;
        };

        // The guest must read back exactly what it last wrote.
        msix::read_entry(&entry.config, field, data);
    }

    fn msix_table_write(&self, msix: &VfioMsix, offset: u64, data: &[u8]) {
        if !self.table_access_valid(offset, data.len()) {
            return;
        }

        let vector = (offset / MSIX_TABLE_ENTRY_SIZE as u64) as usize;
        let field = offset % MSIX_TABLE_ENTRY_SIZE as u64;

        let mut common = msix.common.lock().unwrap();
        {
            let Some(entry) = common.vectors.get_mut(vector) else {
                warn!("{}: access outside of the MSI-X table", self.name);
                return;
            };

            msix::write_entry(&mut entry.config, field, data);

            // Nothing else to do unless the access touched the vector
            // control word at the end of the entry.
            if field + data.len() as u64 <= MSIX_ENTRY_VECTOR_CTRL {
                return;
            }

            entry.guest_state.set_masked(entry.config.masked());
            if let Err(e) = entry.update(&*self.routing, self.dev_id) {
                error!(
                    "{}: failed to configure MSI-X vector {}: {}",
                    self.name, vector, e
                );
            }
        }

        // Update the physical capability if necessary.
        if let Err(e) = self.enable_msis(&mut common) {
            error!("{}: cannot enable MSI-X: {}", self.name, e);
        }
    }

    /// PBA reads are served straight from the host region: the physical
    /// function is never masked there, so the array carries no useful
    /// pending state, but forwarding it is harmless.
    fn msix_pba_read(&self, pba: &MsixPba, offset: u64, data: &mut [u8]) {
        if offset >= pba.size {
            warn!("{}: access outside of the MSI-X PBA", self.name);
            return;
        }

        if let Err(e) = self.vfio.read_at(pba.fd_offset + offset, data) {
            error!("{}: cannot access the MSI-X PBA: {}", self.name, e);
        }
    }
}

impl Drop for VfioPciDevice {
    fn drop(&mut self) {
        if let Some(msix) = &self.msix {
            let mut common = msix.common.lock().unwrap();
            if common.host_state.enabled() {
                if let Err(e) = self.disable_msis(&mut common) {
                    error!("{}: {}", self.name, e);
                }
            }
        }

        if let Some(msi) = &self.msi {
            let mut common = msi.common.lock().unwrap();
            if common.host_state.enabled() {
                if let Err(e) = self.disable_msis(&mut common) {
                    error!("{}: {}", self.name, e);
                }
            }
        }

        self.disable_intx();

        let mut regions = self.regions.lock().unwrap();
        for region in regions.iter_mut() {
            self.unmap_region(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    const RW: u32 = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;

    #[derive(Debug, Clone, PartialEq)]
    enum IrqOp {
        Trigger {
            index: u32,
            start: u32,
            fds: Vec<RawFd>,
        },
        Unmask {
            index: u32,
        },
        Disable {
            index: u32,
        },
    }

    struct FakeDevice {
        config: Mutex<Vec<u8>>,
        regions: Vec<VfioRegionInfo>,
        irqs: HashMap<u32, VfioIrq>,
        ops: Mutex<Vec<IrqOp>>,
    }

    // Offsets of the fake regions within the fake device fd.
    fn region_offset(index: u32) -> u64 {
        u64::from(index + 1) << 32
    }

    impl FakeDevice {
        fn new(config: Vec<u8>, bars: &[(u32, u64, u32)], irqs: &[(u32, u32, u32)]) -> Self {
            let mut regions = vec![VfioRegionInfo::default(); 9];
            for (index, size, flags) in bars {
                regions[*index as usize] = VfioRegionInfo {
                    flags: *flags,
                    size: *size,
                    offset: region_offset(*index),
                };
            }
            regions[VFIO_PCI_CONFIG_REGION_INDEX as usize] = VfioRegionInfo {
                flags: RW,
                size: 0x1000,
                offset: region_offset(VFIO_PCI_CONFIG_REGION_INDEX),
            };

            let irqs = irqs
                .iter()
                .map(|(index, flags, count)| {
                    (
                        *index,
                        VfioIrq {
                            index: *index,
                            flags: *flags,
                            count: *count,
                        },
                    )
                })
                .collect();

            FakeDevice {
                config: Mutex::new(config),
                regions,
                irqs,
                ops: Mutex::new(Vec::new()),
            }
        }

        fn trigger_ops(&self, index: u32) -> Vec<IrqOp> {
            self.ops
                .lock()
                .unwrap()
                .iter()
                .filter(|op| matches!(op, IrqOp::Trigger { index: i, .. } if *i == index))
                .cloned()
                .collect()
        }

        fn has_disable(&self, index: u32) -> bool {
            self.ops
                .lock()
                .unwrap()
                .iter()
                .any(|op| matches!(op, IrqOp::Disable { index: i } if *i == index))
        }
    }

    impl Vfio for FakeDevice {
        fn num_regions(&self) -> u32 {
            self.regions.len() as u32
        }

        fn get_region_info(&self, index: u32) -> Option<VfioRegionInfo> {
            self.regions.get(index as usize).copied()
        }

        fn get_irq_info(&self, index: u32) -> Option<VfioIrq> {
            self.irqs.get(&index).copied()
        }

        fn enable_irq_fds(
            &self,
            index: u32,
            start: u32,
            fds: &[Option<&EventFd>],
        ) -> Result<(), VfioError> {
            self.ops.lock().unwrap().push(IrqOp::Trigger {
                index,
                start,
                fds: fds.iter().map(|fd| fd.map_or(-1, |fd| fd.as_raw_fd())).collect(),
            });
            Ok(())
        }

        fn set_unmask_fd(&self, index: u32, _fd: &EventFd) -> Result<(), VfioError> {
            self.ops.lock().unwrap().push(IrqOp::Unmask { index });
            Ok(())
        }

        fn disable_irq(&self, index: u32) -> Result<(), VfioError> {
            self.ops.lock().unwrap().push(IrqOp::Disable { index });
            Ok(())
        }

        fn region_read(&self, index: u32, offset: u64, data: &mut [u8]) {
            if index == VFIO_PCI_CONFIG_REGION_INDEX {
                let config = self.config.lock().unwrap();
                let offset = offset as usize;
                data.copy_from_slice(&config[offset..offset + data.len()]);
            } else {
                data.fill(0);
            }
        }

        fn region_write(&self, index: u32, offset: u64, data: &[u8]) {
            if index == VFIO_PCI_CONFIG_REGION_INDEX {
                let mut config = self.config.lock().unwrap();
                let offset = offset as usize;
                config[offset..offset + data.len()].copy_from_slice(data);
            }
        }

        fn read_at(&self, offset: u64, data: &mut [u8]) -> io::Result<()> {
            let config_base = region_offset(VFIO_PCI_CONFIG_REGION_INDEX);
            if offset >= config_base {
                let offset = (offset - config_base) as usize;
                let config = self.config.lock().unwrap();
                if offset + data.len() <= config.len() {
                    data.copy_from_slice(&config[offset..offset + data.len()]);
                    return Ok(());
                }
            }
            data.fill(0);
            Ok(())
        }

        fn mmap_region(&self, _info: &VfioRegionInfo) -> io::Result<DeviceMapping> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    #[derive(Default)]
    struct FakeRouting {
        next_gsi: AtomicU32,
        routes: Mutex<Vec<(u32, MsiMessage)>>,
        updates: Mutex<Vec<(u32, MsiMessage)>>,
        irqfds: Mutex<Vec<(u32, RawFd, Option<RawFd>)>>,
        removed: Mutex<Vec<(u32, RawFd)>>,
    }

    impl IrqRouting for FakeRouting {
        fn add_msix_route(&self, msg: MsiMessage, _dev_id: u32) -> io::Result<u32> {
            let gsi = 32 + self.next_gsi.fetch_add(1, Ordering::SeqCst);
            self.routes.lock().unwrap().push((gsi, msg));
            Ok(gsi)
        }

        fn update_msix_route(&self, gsi: u32, msg: MsiMessage) -> io::Result<()> {
            self.updates.lock().unwrap().push((gsi, msg));
            Ok(())
        }

        fn add_irqfd(&self, gsi: u32, trigger: &EventFd, unmask: Option<&EventFd>) -> io::Result<()> {
            self.irqfds.lock().unwrap().push((
                gsi,
                trigger.as_raw_fd(),
                unmask.map(|fd| fd.as_raw_fd()),
            ));
            Ok(())
        }

        fn del_irqfd(&self, gsi: u32, trigger: &EventFd) -> io::Result<()> {
            self.removed.lock().unwrap().push((gsi, trigger.as_raw_fd()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeVm {
        mmio_traps: Mutex<Vec<(u64, u64)>>,
        mmio_untraps: Mutex<Vec<(u64, u64)>>,
        pio_traps: Mutex<Vec<(u64, u64)>>,
    }

    impl Vm for FakeVm {
        fn register_mmio_trap(&self, base: GuestAddress, len: u64) -> io::Result<()> {
            self.mmio_traps.lock().unwrap().push((base.raw_value(), len));
            Ok(())
        }

        fn unregister_mmio_trap(&self, base: GuestAddress, len: u64) -> io::Result<()> {
            self.mmio_untraps
                .lock()
                .unwrap()
                .push((base.raw_value(), len));
            Ok(())
        }

        fn register_pio_trap(&self, base: u64, len: u64) -> io::Result<()> {
            self.pio_traps.lock().unwrap().push((base, len));
            Ok(())
        }

        fn unregister_pio_trap(&self, _base: u64, _len: u64) -> io::Result<()> {
            Ok(())
        }

        fn map_user_memory(
            &self,
            _guest_addr: GuestAddress,
            _host: u64,
            _len: u64,
        ) -> io::Result<()> {
            Ok(())
        }

        fn unmap_user_memory(
            &self,
            _guest_addr: GuestAddress,
            _host: u64,
            _len: u64,
        ) -> io::Result<()> {
            Ok(())
        }
    }

    struct BumpAllocator {
        next_io: u64,
        next_mmio: u64,
    }

    impl Default for BumpAllocator {
        fn default() -> Self {
            BumpAllocator {
                next_io: 0x3000,
                next_mmio: 0xc000_0000,
            }
        }
    }

    impl AddressAllocator for BumpAllocator {
        fn allocate_io_block(&mut self, size: u64) -> Option<u64> {
            let base = self.next_io;
            self.next_io += size;
            Some(base)
        }

        fn allocate_mmio_block(&mut self, size: u64) -> Option<u64> {
            let base = self.next_mmio;
            self.next_mmio += size;
            Some(base)
        }
    }

    fn config_image(pin: u8, caps: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut config = vec![0u8; 0x1000];
        config[0..2].copy_from_slice(&0x1af4u16.to_le_bytes());
        config[2..4].copy_from_slice(&0x1042u16.to_le_bytes());
        config[0x3d] = pin;
        if !caps.is_empty() {
            config[0x06] = 0x10; // capability list present
            config[0x34] = caps[0].0;
        }
        for (pos, bytes) in caps {
            config[*pos as usize..*pos as usize + bytes.len()].copy_from_slice(bytes);
        }
        config
    }

    fn msi_cap_bytes(next: u8, ctrl: u16) -> Vec<u8> {
        let mut cap = vec![0x05, next, 0, 0];
        cap[2..4].copy_from_slice(&ctrl.to_le_bytes());
        cap.resize(MsiCap::new(ctrl).size(), 0);
        cap
    }

    fn msix_cap_bytes(next: u8, nr_entries: u16, table: u32, pba: u32) -> Vec<u8> {
        let mut cap = vec![0x11, next];
        cap.extend_from_slice(&(nr_entries - 1).to_le_bytes());
        cap.extend_from_slice(&table.to_le_bytes());
        cap.extend_from_slice(&pba.to_le_bytes());
        cap
    }

    const INTX_INFO: (u32, u32, u32) = (
        VFIO_PCI_INTX_IRQ_INDEX,
        VFIO_IRQ_INFO_EVENTFD | VFIO_IRQ_INFO_AUTOMASKED,
        1,
    );

    fn msix_device(pin: u8) -> Arc<FakeDevice> {
        // Four vectors, table at offset 0 and PBA at offset 0x800 of BAR 0.
        let cap = msix_cap_bytes(0, 4, 0x0, 0x800);
        let config = config_image(pin, &[(0x70, cap)]);
        let mut irqs = vec![(VFIO_PCI_MSIX_IRQ_INDEX, VFIO_IRQ_INFO_EVENTFD, 4)];
        if pin != 0 {
            irqs.push(INTX_INFO);
        }
        Arc::new(FakeDevice::new(config, &[(0, 0x1000, RW)], &irqs))
    }

    fn msi_device(pin: u8) -> Arc<FakeDevice> {
        // 64-bit addressing, per-vector masking, two vectors.
        let cap = msi_cap_bytes(0, 0x0182);
        let config = config_image(pin, &[(0x50, cap)]);
        let mut irqs = vec![(VFIO_PCI_MSI_IRQ_INDEX, VFIO_IRQ_INFO_EVENTFD, 2)];
        if pin != 0 {
            irqs.push(INTX_INFO);
        }
        Arc::new(FakeDevice::new(config, &[(0, 0x1000, RW)], &irqs))
    }

    fn try_make(
        vfio: Arc<FakeDevice>,
        legacy_gsi: Option<u32>,
    ) -> Result<(VfioPciDevice, Arc<FakeRouting>, Arc<FakeVm>), VfioPciError> {
        let routing = Arc::new(FakeRouting::default());
        let vm = Arc::new(FakeVm::default());
        let mut allocator = BumpAllocator::default();
        let device = VfioPciDevice::with_backend(
            "test-dev",
            vfio,
            &mut allocator,
            routing.clone(),
            vm.clone(),
            0x18,
            legacy_gsi,
        )?;
        Ok((device, routing, vm))
    }

    fn make(vfio: Arc<FakeDevice>, legacy_gsi: Option<u32>) -> (VfioPciDevice, Arc<FakeRouting>, Arc<FakeVm>) {
        try_make(vfio, legacy_gsi).unwrap()
    }

    fn intx_armed(device: &VfioPciDevice) -> bool {
        device.intx.as_ref().unwrap().lock().unwrap().armed()
    }

    fn bar0_base(device: &VfioPciDevice) -> u64 {
        u64::from(device.header.lock().unwrap().bar_address(0))
    }

    #[test]
    fn intx_setup() {
        let config = config_image(1, &[]);
        let vfio = Arc::new(FakeDevice::new(config, &[(0, 0x1000, RW)], &[INTX_INFO]));
        let (device, routing, _vm) = make(vfio.clone(), Some(4));

        // One route carrying both the trigger and the unmask event fds.
        {
            let irqfds = routing.irqfds.lock().unwrap();
            assert_eq!(irqfds.len(), 1);
            let (gsi, trigger, unmask) = irqfds[0];
            assert_eq!(gsi, 4);
            assert!(trigger >= 0);
            assert!(unmask.unwrap() >= 0);
        }

        // Two SET_IRQS calls: the trigger assignment and the unmask action.
        {
            let ops = vfio.ops.lock().unwrap();
            assert_eq!(ops.len(), 2);
            assert!(matches!(&ops[0], IrqOp::Trigger { index, fds, .. }
                if *index == VFIO_PCI_INTX_IRQ_INDEX && fds.len() == 1 && fds[0] >= 0));
            assert!(matches!(&ops[1], IrqOp::Unmask { index } if *index == VFIO_PCI_INTX_IRQ_INDEX));
        }

        assert!(intx_armed(&device));
    }

    #[test]
    fn synthesized_header_written_back() {
        let vfio = msix_device(0);
        let (device, _routing, _vm) = make(vfio.clone(), None);

        let config = vfio.config.lock().unwrap();
        // Capability pointer kept, BAR rewritten to the guest view, ROM
        // wiped.
        assert_eq!(config[0x34], 0x70);
        assert_eq!(
            u32::from_le_bytes(config[0x10..0x14].try_into().unwrap()),
            bar0_base(&device) as u32
        );
        assert_eq!(u32::from_le_bytes(config[0x30..0x34].try_into().unwrap()), 0);
    }

    #[test]
    fn rom_writes_not_propagated() {
        let vfio = msix_device(0);
        let (device, _routing, _vm) = make(vfio.clone(), None);

        device.config_write(PCI_ROM_ADDRESS as u64, &0xffff_fffeu32.to_le_bytes());

        let config = vfio.config.lock().unwrap();
        assert_eq!(u32::from_le_bytes(config[0x30..0x34].try_into().unwrap()), 0);
    }

    #[test]
    fn msix_fill_masked_then_unmask() {
        let vfio = msix_device(0);
        let (device, routing, vm) = make(vfio.clone(), None);

        let table_base = bar0_base(&device);
        device.activate_bar(0, table_base).unwrap();
        {
            let traps = vm.mmio_traps.lock().unwrap();
            assert_eq!(traps[0], (table_base, 64));
            assert_eq!(traps[1], (table_base + 0x800, 8));
        }

        // Enable the capability masked: one full-range programming round
        // with no fds yet.
        device.config_write(0x73, &[0xc0]);
        {
            let triggers = device_triggers(&vfio);
            assert_eq!(triggers.len(), 1);
            match &triggers[0] {
                IrqOp::Trigger { start, fds, .. } => {
                    assert_eq!(*start, 0);
                    assert_eq!(fds, &vec![-1, -1, -1, -1]);
                }
                _ => unreachable!(),
            }
        }

        // Fill the table. The capability is masked: routes appear, but not
        // a single SET_IRQS.
        for i in 0..4u64 {
            let entry = table_base + i * 16;
            device.mmio_write(entry, &0xfee0_0000u32.to_le_bytes());
            device.mmio_write(entry + 4, &0u32.to_le_bytes());
            device.mmio_write(entry + 8, &(0x21 + i as u32).to_le_bytes());
            device.mmio_write(entry + 12, &0u32.to_le_bytes());
        }
        assert_eq!(device_triggers(&vfio).len(), 1);
        assert_eq!(routing.routes.lock().unwrap().len(), 4);
        assert_eq!(routing.irqfds.lock().unwrap().len(), 4);

        // Unmask: exactly one multi-vector SET_IRQS carrying all four fds.
        device.config_write(0x73, &[0x80]);
        {
            let triggers = device_triggers(&vfio);
            assert_eq!(triggers.len(), 2);
            match &triggers[1] {
                IrqOp::Trigger { start, fds, .. } => {
                    assert_eq!(*start, 0);
                    assert_eq!(fds.len(), 4);
                    assert!(fds.iter().all(|fd| *fd >= 0));
                }
                _ => unreachable!(),
            }
        }

        // Re-writing an entry whose fd is already programmed adds no
        // single-vector calls; the existing route is just refreshed.
        device.mmio_write(table_base + 12, &0u32.to_le_bytes());
        assert_eq!(device_triggers(&vfio).len(), 2);
        assert_eq!(routing.updates.lock().unwrap().len(), 1);

        // The guest reads back what it wrote.
        let mut data = [0u8; 4];
        device.mmio_read(table_base + 8, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0x21);
    }

    fn device_triggers(vfio: &FakeDevice) -> Vec<IrqOp> {
        vfio.trigger_ops(VFIO_PCI_MSIX_IRQ_INDEX)
    }

    #[test]
    fn msix_enable_disarms_intx() {
        let vfio = msix_device(1);
        let (device, _routing, _vm) = make(vfio.clone(), Some(4));
        assert!(intx_armed(&device));

        device.config_write(0x73, &[0xc0]);

        {
            let intx = device.intx.as_ref().unwrap().lock().unwrap();
            assert!(!intx.armed());
            assert_eq!(intx.trigger_fd(), -1);
        }
        assert!(vfio.has_disable(VFIO_PCI_INTX_IRQ_INDEX));
    }

    // The bus layer applies capability writes to the synthesized header
    // before invoking the dispatcher; these helpers do both.
    fn guest_cfg_write(device: &VfioPciDevice, offset: u64, data: &[u8]) {
        device.write_header(offset, data);
        device.config_write(offset, data);
    }

    fn enable_two_vector_msi(device: &VfioPciDevice) {
        guest_cfg_write(device, 0x54, &0xfee0_0000u32.to_le_bytes());
        guest_cfg_write(device, 0x58, &0u32.to_le_bytes());
        guest_cfg_write(device, 0x5c, &0x0040u16.to_le_bytes());
        // Enable + MME=1, preserving the read-only control bits.
        guest_cfg_write(device, 0x52, &[0x93, 0x01]);
    }

    #[test]
    fn msi_enable_programs_vectors() {
        let vfio = msi_device(0);
        let (device, routing, _vm) = make(vfio.clone(), None);

        enable_two_vector_msi(&device);

        assert_eq!(routing.routes.lock().unwrap().len(), 2);
        assert_eq!(routing.irqfds.lock().unwrap().len(), 2);

        let triggers = vfio.trigger_ops(VFIO_PCI_MSI_IRQ_INDEX);
        assert_eq!(triggers.len(), 1);
        match &triggers[0] {
            IrqOp::Trigger { start, fds, .. } => {
                assert_eq!(*start, 0);
                assert_eq!(fds.len(), 2);
                assert!(fds.iter().all(|fd| *fd >= 0));
            }
            _ => unreachable!(),
        }

        // The second vector's message data carries the vector number.
        let common = device.msi.as_ref().unwrap().common.lock().unwrap();
        assert_eq!(common.vectors[0].config.msg_data, 0x40);
        assert_eq!(common.vectors[1].config.msg_data, 0x41);
        assert_eq!(common.vectors[0].config.msg_addr_lo, 0xfee0_0000);
    }

    #[test]
    fn msi_mask_toggle() {
        let vfio = msi_device(0);
        let (device, routing, _vm) = make(vfio.clone(), None);
        enable_two_vector_msi(&device);

        // Flipping mask bit 0 detaches one route and issues no SET_IRQS.
        guest_cfg_write(&device, 0x60, &[0x01, 0, 0, 0]);
        assert_eq!(routing.removed.lock().unwrap().len(), 1);
        assert_eq!(vfio.trigger_ops(VFIO_PCI_MSI_IRQ_INDEX).len(), 1);

        // Unmasking installs it again.
        guest_cfg_write(&device, 0x60, &[0x00, 0, 0, 0]);
        assert_eq!(routing.irqfds.lock().unwrap().len(), 3);
        assert_eq!(vfio.trigger_ops(VFIO_PCI_MSI_IRQ_INDEX).len(), 1);
    }

    #[test]
    fn msi_disable_falls_back_to_intx() {
        let vfio = msi_device(1);
        let (device, routing, _vm) = make(vfio.clone(), Some(4));

        enable_two_vector_msi(&device);
        assert!(!intx_armed(&device));
        let irqfds_after_enable = routing.irqfds.lock().unwrap().len();

        // Guest clears the enable bit.
        guest_cfg_write(&device, 0x52, &[0x92, 0x01]);

        assert!(vfio.has_disable(VFIO_PCI_MSI_IRQ_INDEX));
        assert!(intx_armed(&device));
        // A fresh trigger/unmask pair was routed for the pin interrupt.
        assert_eq!(routing.irqfds.lock().unwrap().len(), irqfds_after_enable + 1);
    }

    #[test]
    fn bar_reprogram_moves_msix_traps() {
        let vfio = msix_device(0);
        let (device, _routing, vm) = make(vfio, None);

        let old_base = bar0_base(&device);
        device.activate_bar(0, old_base).unwrap();

        device.deactivate_bar(0).unwrap();
        {
            let untraps = vm.mmio_untraps.lock().unwrap();
            assert!(untraps.contains(&(old_base, 64)));
            assert!(untraps.contains(&(old_base + 0x800, 8)));
        }

        device.activate_bar(0, 0xd000_0000).unwrap();
        {
            let traps = vm.mmio_traps.lock().unwrap();
            assert!(traps.contains(&(0xd000_0000, 64)));
            assert!(traps.contains(&(0xd000_0800, 8)));
        }

        // The table handler serves the new window: reset vector control
        // reads back as masked.
        let mut data = [0u8; 4];
        device.mmio_read(0xd000_0000 + 12, &mut data);
        assert_eq!(u32::from_le_bytes(data), MSIX_ENTRY_CTRL_MASKBIT);
    }

    #[test]
    fn bar_reprogram_moves_data_bar() {
        let config = config_image(0, &[]);
        let vfio = Arc::new(FakeDevice::new(config, &[(0, 0x1000, RW)], &[]));
        let (device, _routing, vm) = make(vfio, None);

        // Not mmap-capable: served by trap-and-forward.
        device.activate_bar(0, 0xc000_0000).unwrap();
        assert!(vm.mmio_traps.lock().unwrap().contains(&(0xc000_0000, 0x1000)));

        device.deactivate_bar(0).unwrap();
        assert!(vm
            .mmio_untraps
            .lock()
            .unwrap()
            .contains(&(0xc000_0000, 0x1000)));

        device.activate_bar(0, 0xd000_0000).unwrap();
        assert!(vm.mmio_traps.lock().unwrap().contains(&(0xd000_0000, 0x1000)));
    }

    #[test]
    fn malformed_table_access_rejected() {
        let vfio = msix_device(0);
        let (device, routing, _vm) = make(vfio, None);
        let table_base = bar0_base(&device);
        device.activate_bar(0, table_base).unwrap();

        // Undersized read: the buffer is left alone.
        let mut data = [0xaa_u8; 2];
        device.mmio_read(table_base + 8, &mut data);
        assert_eq!(data, [0xaa, 0xaa]);

        // Undersized write to vector control: rejected without touching
        // vector state.
        device.mmio_write(table_base + 12, &[0x00, 0x00]);
        // Misaligned dword write: same.
        device.mmio_write(table_base + 2, &[0u8; 4]);

        let common = device.msix.as_ref().unwrap().common.lock().unwrap();
        assert!(common.vectors[0].config.masked());
        assert_eq!(routing.routes.lock().unwrap().len(), 0);
    }

    #[test]
    fn pba_is_read_only() {
        let vfio = msix_device(0);
        let (device, _routing, _vm) = make(vfio, None);
        let table_base = bar0_base(&device);
        device.activate_bar(0, table_base).unwrap();

        let mut data = [0xaa_u8; 4];
        device.mmio_read(table_base + 0x800, &mut data);
        assert_eq!(data, [0; 4]);

        // Writes are dropped.
        device.mmio_write(table_base + 0x800, &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_bridge_header() {
        let mut config = config_image(0, &[]);
        config[0x0e] = 0x01;
        let vfio = Arc::new(FakeDevice::new(config, &[], &[]));

        assert!(matches!(
            try_make(vfio, None),
            Err(VfioPciError::UnsupportedHeaderType(1))
        ));
    }

    #[test]
    fn strips_multifunction_bit() {
        let mut config = config_image(0, &[]);
        config[0x0e] = 0x80;
        let vfio = Arc::new(FakeDevice::new(config, &[], &[]));

        let (device, _routing, _vm) = make(vfio, None);
        assert_eq!(device.header.lock().unwrap().header_type(), 0);
    }

    #[test]
    fn rejects_non_power_of_two_bar() {
        let config = config_image(0, &[]);
        let vfio = Arc::new(FakeDevice::new(config, &[(0, 0x1800, RW)], &[]));

        assert!(matches!(
            try_make(vfio, None),
            Err(VfioPciError::RegionSizeNotPowerOfTwo(0, 0x1800))
        ));
    }

    #[test]
    fn rejects_missing_config_region() {
        let config = config_image(0, &[]);
        let mut fake = FakeDevice::new(config, &[], &[]);
        fake.regions[VFIO_PCI_CONFIG_REGION_INDEX as usize] = VfioRegionInfo::default();

        assert!(matches!(
            try_make(Arc::new(fake), None),
            Err(VfioPciError::MissingConfigSpace)
        ));
    }

    #[test]
    fn rejects_vector_count_mismatch() {
        let cap = msix_cap_bytes(0, 4, 0x0, 0x800);
        let config = config_image(0, &[(0x70, cap)]);
        let vfio = Arc::new(FakeDevice::new(
            config,
            &[(0, 0x1000, RW)],
            &[(VFIO_PCI_MSIX_IRQ_INDEX, VFIO_IRQ_INFO_EVENTFD, 2)],
        ));

        assert!(matches!(
            try_make(vfio, None),
            Err(VfioPciError::InvalidVectorCount { .. })
        ));
    }

    #[test]
    fn io_bar_is_trapped_and_forwarded() {
        let mut config = config_image(0, &[]);
        // BAR 0 advertises IO space.
        config[0x10] = 0x01;
        let vfio = Arc::new(FakeDevice::new(config, &[(0, 0x100, RW)], &[]));
        let (device, _routing, vm) = make(vfio, None);

        let port = {
            let header = device.header.lock().unwrap();
            assert!(header.bar_is_io(0));
            u64::from(header.bar_address(0))
        };

        device.activate_bar(0, port).unwrap();
        assert!(vm.pio_traps.lock().unwrap().contains(&(port, 0x100)));

        let mut data = [0xffu8; 2];
        device.pio_read(port + 4, &mut data);
        assert_eq!(data, [0, 0]);
    }

    #[test]
    fn drop_disables_everything() {
        let vfio = msi_device(1);
        let (device, _routing, _vm) = make(vfio.clone(), Some(4));
        enable_two_vector_msi(&device);

        drop(device);

        assert!(vfio.has_disable(VFIO_PCI_MSI_IRQ_INDEX));
        assert!(vfio.has_disable(VFIO_PCI_INTX_IRQ_INDEX));
    }
}
