// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io;

use vm_memory::GuestAddress;

/// Guest address-space services provided by the VMM.
///
/// Trap registration routes guest accesses of the given window back to the
/// device object that registered it; user-memory mapping makes a
/// host-mmap'ed device region directly visible to the guest, with no exit
/// on access.
pub trait Vm: Send + Sync {
    fn register_mmio_trap(&self, base: GuestAddress, len: u64) -> io::Result<()>;
    fn unregister_mmio_trap(&self, base: GuestAddress, len: u64) -> io::Result<()>;
    fn register_pio_trap(&self, base: u64, len: u64) -> io::Result<()>;
    fn unregister_pio_trap(&self, base: u64, len: u64) -> io::Result<()>;
    fn map_user_memory(&self, guest_addr: GuestAddress, host_addr: u64, len: u64)
        -> io::Result<()>;
    fn unmap_user_memory(
        &self,
        guest_addr: GuestAddress,
        host_addr: u64,
        len: u64,
    ) -> io::Result<()>;
}

/// Guest IO-port and MMIO block allocators, owned by the platform.
pub trait AddressAllocator {
    /// Allocates a naturally sized block of IO-port space.
    fn allocate_io_block(&mut self, size: u64) -> Option<u64>;
    /// Allocates a page-aligned block of guest physical address space.
    fn allocate_mmio_block(&mut self, size: u64) -> Option<u64>;
}
