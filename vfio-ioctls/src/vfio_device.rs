// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};

use log::warn;
use thiserror::Error;
use vfio_bindings::bindings::vfio::{
    vfio_device_info, vfio_irq_info, vfio_irq_set, vfio_region_info, VFIO_DEVICE_FLAGS_PCI,
    VFIO_DEVICE_FLAGS_RESET, VFIO_IRQ_SET_ACTION_TRIGGER, VFIO_IRQ_SET_ACTION_UNMASK,
    VFIO_IRQ_SET_DATA_EVENTFD, VFIO_IRQ_SET_DATA_NONE, VFIO_PCI_CONFIG_REGION_INDEX,
    VFIO_PCI_MSIX_IRQ_INDEX,
};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref};

use crate::vec_with_array_field;

// Ioctl numbers from <linux/vfio.h>. All VFIO ioctls are plain _IO()
// requests, sequentially numbered from VFIO_BASE.
const VFIO_TYPE: u32 = b';' as u32;
const VFIO_BASE: u32 = 100;

ioctl_io_nr!(VFIO_DEVICE_GET_INFO, VFIO_TYPE, VFIO_BASE + 7);
ioctl_io_nr!(VFIO_DEVICE_GET_REGION_INFO, VFIO_TYPE, VFIO_BASE + 8);
ioctl_io_nr!(VFIO_DEVICE_GET_IRQ_INFO, VFIO_TYPE, VFIO_BASE + 9);
ioctl_io_nr!(VFIO_DEVICE_SET_IRQS, VFIO_TYPE, VFIO_BASE + 10);
ioctl_io_nr!(VFIO_DEVICE_RESET, VFIO_TYPE, VFIO_BASE + 11);

#[derive(Debug, Error)]
pub enum VfioError {
    #[error("failed to get VFIO device info: {0}")]
    DeviceGetInfo(#[source] io::Error),
    #[error("VFIO device is not a PCI device")]
    NotAPciDevice,
    #[error("failed to get VFIO IRQ info: {0}")]
    GetIrqInfo(#[source] io::Error),
    #[error("VFIO_DEVICE_SET_IRQS failed: {0}")]
    SetIrqs(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VfioError>;

/// Interrupt line information reported by `VFIO_DEVICE_GET_IRQ_INFO`.
#[derive(Debug, Copy, Clone, Default)]
pub struct VfioIrq {
    pub index: u32,
    pub flags: u32,
    pub count: u32,
}

/// Region geometry reported by `VFIO_DEVICE_GET_REGION_INFO`.
///
/// `offset` locates the region within the device fd for `pread`/`pwrite`
/// and `mmap`. A zero `size` means the device does not implement the
/// region.
#[derive(Debug, Copy, Clone, Default)]
pub struct VfioRegionInfo {
    pub flags: u32,
    pub size: u64,
    pub offset: u64,
}

/// An opened VFIO device fd and its region table.
pub struct VfioDevice {
    device: File,
    flags: u32,
    regions: Vec<VfioRegionInfo>,
}

impl VfioDevice {
    /// Wraps a device fd obtained from `VFIO_GROUP_GET_DEVICE_FD`,
    /// verifying that it is a PCI device and caching its region table.
    pub fn new(device: File) -> Result<Self> {
        let mut dev_info = vfio_device_info {
            argsz: size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };

        // SAFETY: we own the fd and dev_info is a valid vfio_device_info.
        let ret = unsafe { ioctl_with_mut_ref(&device, VFIO_DEVICE_GET_INFO(), &mut dev_info) };
        if ret < 0 {
            return Err(VfioError::DeviceGetInfo(io::Error::last_os_error()));
        }

        if dev_info.flags & VFIO_DEVICE_FLAGS_PCI == 0
            || dev_info.num_regions < VFIO_PCI_CONFIG_REGION_INDEX + 1
            || dev_info.num_irqs < VFIO_PCI_MSIX_IRQ_INDEX + 1
        {
            return Err(VfioError::NotAPciDevice);
        }

        let mut regions = Vec::with_capacity(dev_info.num_regions as usize);
        for index in 0..dev_info.num_regions {
            let mut reg_info = vfio_region_info {
                argsz: size_of::<vfio_region_info>() as u32,
                index,
                ..Default::default()
            };

            // SAFETY: reg_info is a valid vfio_region_info for this device.
            let ret =
                unsafe { ioctl_with_mut_ref(&device, VFIO_DEVICE_GET_REGION_INFO(), &mut reg_info) };
            if ret < 0 {
                // Unimplemented regions show up as zero-sized.
                regions.push(VfioRegionInfo::default());
                continue;
            }

            regions.push(VfioRegionInfo {
                flags: reg_info.flags,
                size: reg_info.size,
                offset: reg_info.offset,
            });
        }

        Ok(VfioDevice {
            device,
            flags: dev_info.flags,
            regions,
        })
    }

    /// Resets the device if it advertises reset support.
    pub fn reset(&self) {
        if self.flags & VFIO_DEVICE_FLAGS_RESET != 0 {
            // SAFETY: no argument, we own the fd.
            unsafe { ioctl(&self.device, VFIO_DEVICE_RESET()) };
        }
    }

    pub fn num_regions(&self) -> u32 {
        self.regions.len() as u32
    }

    pub fn get_region_info(&self, index: u32) -> Option<VfioRegionInfo> {
        self.regions.get(index as usize).copied()
    }

    pub fn get_irq_info(&self, index: u32) -> Result<VfioIrq> {
        let mut irq_info = vfio_irq_info {
            argsz: size_of::<vfio_irq_info>() as u32,
            index,
            ..Default::default()
        };

        // SAFETY: irq_info is a valid vfio_irq_info for this device.
        let ret = unsafe { ioctl_with_mut_ref(&self.device, VFIO_DEVICE_GET_IRQ_INFO(), &mut irq_info) };
        if ret < 0 {
            return Err(VfioError::GetIrqInfo(io::Error::last_os_error()));
        }

        Ok(VfioIrq {
            index,
            flags: irq_info.flags,
            count: irq_info.count,
        })
    }

    /// Assigns trigger event fds to `fds.len()` vectors of the given IRQ
    /// index, starting at `start`. A `None` entry is passed to the kernel as
    /// -1, which de-assigns the vector or leaves it unassigned.
    pub fn enable_irq(&self, index: u32, start: u32, fds: &[Option<&EventFd>]) -> Result<()> {
        let count = fds.len();
        let fd_size = size_of::<RawFd>();
        let mut irq_set = vec_with_array_field::<vfio_irq_set, RawFd>(count);
        irq_set[0].argsz = (size_of::<vfio_irq_set>() + count * fd_size) as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER;
        irq_set[0].index = index;
        irq_set[0].start = start;
        irq_set[0].count = count as u32;

        // SAFETY: vec_with_array_field reserved count RawFds behind the header.
        let data = unsafe { irq_set[0].data.as_mut_slice(count * fd_size) };
        for (buf, fd) in data.chunks_exact_mut(fd_size).zip(fds.iter()) {
            let raw: RawFd = fd.map_or(-1, |fd| fd.as_raw_fd());
            buf.copy_from_slice(&raw.to_ne_bytes());
        }

        // SAFETY: irq_set is a valid vfio_irq_set with a matching argsz.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        if ret < 0 {
            return Err(VfioError::SetIrqs(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Registers an unmask event fd for a level-triggered IRQ: signaling it
    /// clears the latched level after the guest EOI.
    pub fn set_unmask_eventfd(&self, index: u32, fd: &EventFd) -> Result<()> {
        let fd_size = size_of::<RawFd>();
        let mut irq_set = vec_with_array_field::<vfio_irq_set, RawFd>(1);
        irq_set[0].argsz = (size_of::<vfio_irq_set>() + fd_size) as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_UNMASK;
        irq_set[0].index = index;
        irq_set[0].start = 0;
        irq_set[0].count = 1;

        // SAFETY: vec_with_array_field reserved one RawFd behind the header.
        let data = unsafe { irq_set[0].data.as_mut_slice(fd_size) };
        data.copy_from_slice(&fd.as_raw_fd().to_ne_bytes());

        // SAFETY: irq_set is a valid vfio_irq_set with a matching argsz.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        if ret < 0 {
            return Err(VfioError::SetIrqs(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Clears all trigger assignments for the given IRQ index.
    pub fn disable_irq(&self, index: u32) -> Result<()> {
        let mut irq_set = vec_with_array_field::<vfio_irq_set, RawFd>(0);
        irq_set[0].argsz = size_of::<vfio_irq_set>() as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER;
        irq_set[0].index = index;
        irq_set[0].start = 0;
        irq_set[0].count = 0;

        // SAFETY: irq_set is a valid vfio_irq_set with a matching argsz.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        if ret < 0 {
            return Err(VfioError::SetIrqs(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Reads from a device region at `offset` within the region.
    pub fn region_read(&self, index: u32, offset: u64, data: &mut [u8]) {
        let Some(region) = self.get_region_info(index) else {
            warn!("reading from unknown VFIO region {index}");
            return;
        };

        if let Err(e) = self.device.read_exact_at(data, region.offset + offset) {
            warn!(
                "failed to read {} bytes from VFIO region {} at 0x{:x}: {}",
                data.len(),
                index,
                offset,
                e
            );
        }
    }

    /// Writes to a device region at `offset` within the region.
    pub fn region_write(&self, index: u32, offset: u64, data: &[u8]) {
        let Some(region) = self.get_region_info(index) else {
            warn!("writing to unknown VFIO region {index}");
            return;
        };

        if let Err(e) = self.device.write_all_at(data, region.offset + offset) {
            warn!(
                "failed to write {} bytes to VFIO region {} at 0x{:x}: {}",
                data.len(),
                index,
                offset,
                e
            );
        }
    }

    /// Reads at an absolute offset into the device fd.
    pub fn read_at(&self, offset: u64, data: &mut [u8]) -> io::Result<()> {
        self.device.read_exact_at(data, offset)
    }
}

impl AsRawFd for VfioDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}
