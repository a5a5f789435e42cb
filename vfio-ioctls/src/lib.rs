// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Safe wrapper around the VFIO device file descriptor.
//!
//! The VFIO framework exposes a physical device to userspace through a
//! character-device fd: configuration space and BARs are read and written
//! through regions of that fd, and interrupts are wired up by handing event
//! fds to the `VFIO_DEVICE_SET_IRQS` ioctl. This crate wraps the device-level
//! ioctls ([`VfioDevice`]); opening the container and the IOMMU group that
//! yield the device fd is the caller's business.

#[macro_use]
extern crate vmm_sys_util;

mod vfio_device;

pub use vfio_device::{VfioDevice, VfioError, VfioIrq, VfioRegionInfo};

use std::mem::size_of;

/// Returns a `Vec<T>` large enough to back a kernel struct of
/// `size_in_bytes` bytes while staying aligned for `T`.
fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = (size_in_bytes + size_of::<T>() - 1) / size_of::<T>();
    let mut v = Vec::with_capacity(rounded_size);
    for _ in 0..rounded_size {
        v.push(T::default())
    }
    v
}

/// Allocates a `Vec<T>` with room for `count` trailing elements of type `F`.
///
/// Several VFIO structs end with a flexible array member (`vfio_irq_set`
/// carries its event-fd payload that way). `size_of::<T>()` alone would not
/// reserve space for the payload, so the struct is allocated as the first
/// element of a `Vec<T>` sized to cover both the header and the array.
pub(crate) fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_field_allocation() {
        #[derive(Default)]
        struct Header {
            _a: u64,
            _b: u32,
        }

        let v = vec_with_array_field::<Header, u32>(5);
        assert!(v.len() * size_of::<Header>() >= size_of::<Header>() + 5 * size_of::<u32>());

        let v = vec_with_array_field::<Header, u32>(0);
        assert_eq!(v.len(), 1);
    }
}
