// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! PCI device assignment over VFIO.
//!
//! Takes a physical PCI function exported by the VFIO driver and presents
//! it to an unmodified guest: the configuration space is parsed, filtered
//! and synthesized back, BARs are allocated in the guest address space and
//! either mapped directly or trapped, and the three PCI interrupt delivery
//! modes (INTx, MSI, MSI-X) are routed onto event fds and interrupt
//! controller routes.
//!
//! The VMM supplies the collaborators: the interrupt-controller backend
//! ([`IrqRouting`]), the guest address-space services ([`Vm`]), the guest
//! block allocators ([`AddressAllocator`]) and the config-space bus that
//! invokes the [`VfioPciDevice`] callbacks.

#[macro_use]
extern crate log;

mod configuration;
mod interrupt;
mod msi;
mod msix;
mod vfio;
mod vm;

pub use self::configuration::{
    PciCapabilityId, PciHeader, RetainedCapabilities, BAR_NUMS, PCI_CFG_SPACE_SIZE,
    PCI_ROM_ADDRESS,
};
pub use self::interrupt::{
    reserve_irq_fds, IntxRouting, IrqRouting, MsiCommon, MsiMessage, MsiState, MsiVector,
};
pub use self::msi::MsiCap;
pub use self::msix::{MsixCap, MsixPba, MsixTable, MsixTableEntry, MSIX_TABLE_ENTRY_SIZE};
pub use self::vfio::{DeviceMapping, Vfio, VfioDeviceWrapper, VfioPciDevice, VfioPciError};
pub use self::vm::{AddressAllocator, Vm};
