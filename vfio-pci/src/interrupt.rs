// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use vfio_bindings::bindings::vfio::VFIO_PCI_INTX_IRQ_INDEX;
use vmm_sys_util::eventfd::EventFd;

use crate::msix::MsixTableEntry;
use crate::vfio::{Vfio, VfioPciError};

/// An MSI message as routed through the interrupt controller.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MsiMessage {
    pub addr_lo: u32,
    pub addr_hi: u32,
    pub data: u32,
}

/// Interrupt-controller backend: GSI routes and irqfd plumbing.
///
/// `add_irqfd` wires an event fd so that signaling it raises the guest
/// interrupt behind `gsi`; for level-triggered sources the optional second
/// fd is signaled back when the guest clears the latched level.
pub trait IrqRouting: Send + Sync {
    fn add_msix_route(&self, msg: MsiMessage, dev_id: u32) -> io::Result<u32>;
    fn update_msix_route(&self, gsi: u32, msg: MsiMessage) -> io::Result<()>;
    fn add_irqfd(&self, gsi: u32, trigger: &EventFd, unmask: Option<&EventFd>) -> io::Result<()>;
    fn del_irqfd(&self, gsi: u32, trigger: &EventFd) -> io::Result<()>;
}

const MSI_STATE_ENABLED: u8 = 1 << 0;
const MSI_STATE_MASKED: u8 = 1 << 1;
const MSI_STATE_EMPTY: u8 = 1 << 2;

/// One side (host or guest) of a capability's or vector's interrupt state.
///
/// Guest and host sides are tracked as two independent values; every
/// transition names which side it moves.
#[derive(Debug, Copy, Clone, Default)]
pub struct MsiState(u8);

impl MsiState {
    pub fn enabled(&self) -> bool {
        self.0 & MSI_STATE_ENABLED != 0
    }

    /// MSI-X: the control register allows to mask all vectors, and the
    /// table allows to mask each vector individually.
    ///
    /// MSI: if the capability supports per-vector masking then the Mask
    /// Bits register allows to mask each vector individually. Otherwise
    /// there is no masking for MSI.
    pub fn masked(&self) -> bool {
        self.0 & MSI_STATE_MASKED != 0
    }

    /// A capability is empty when no vector has been registered with the
    /// passthrough driver yet, so that a guest filling the table under a
    /// masked capability does not cost one ioctl per vector.
    pub fn empty(&self) -> bool {
        self.0 & MSI_STATE_EMPTY != 0
    }

    fn update(&mut self, value: bool, bit: u8) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn set_enabled(&mut self, value: bool) {
        self.update(value, MSI_STATE_ENABLED);
    }

    pub fn set_masked(&mut self, value: bool) {
        self.update(value, MSI_STATE_MASKED);
    }

    pub fn set_empty(&mut self, value: bool) {
        self.update(value, MSI_STATE_EMPTY);
    }
}

/// Per-vector interrupt state, shared between MSI and MSI-X.
pub struct MsiVector {
    /// The guest's view of the vector: a 16-byte MSI-X table entry, also
    /// used to hold the message derived from the MSI capability registers.
    pub config: MsixTableEntry,
    pub gsi: Option<u32>,
    pub eventfd: Option<EventFd>,
    pub guest_state: MsiState,
    pub host_state: MsiState,
}

impl MsiVector {
    fn new() -> Self {
        let mut host_state = MsiState::default();
        // No route is installed yet, which is what host-masked means.
        host_state.set_masked(true);

        MsiVector {
            config: MsixTableEntry::default(),
            gsi: None,
            eventfd: None,
            guest_state: MsiState::default(),
            host_state,
        }
    }

    /// The fd the passthrough driver should trigger for this vector, -1
    /// when the vector has no route yet.
    pub fn raw_fd(&self) -> RawFd {
        match (&self.gsi, &self.eventfd) {
            (Some(_), Some(fd)) => fd.as_raw_fd(),
            _ => -1,
        }
    }

    /// Single choke point for per-vector transitions: materializes the
    /// event fd and the GSI route, then reconciles host masking with the
    /// guest's.
    ///
    /// The passthrough driver offers no per-vector mask operation, so
    /// masking is emulated by removing and reinstalling the irqfd route.
    /// Toggling a route is also much cheaper than reprogramming vectors
    /// through the driver, and a removed route leaves the event fd free to
    /// be polled locally. A vector is host-masked exactly when no irqfd
    /// route is installed.
    pub fn update(&mut self, routing: &dyn IrqRouting, dev_id: u32) -> io::Result<()> {
        if self.eventfd.is_none() {
            self.eventfd = Some(EventFd::new(0)?);
        }

        let msg = self.config.message();
        let gsi = match self.gsi {
            Some(gsi) => {
                routing.update_msix_route(gsi, msg)?;
                gsi
            }
            None => {
                let gsi = routing.add_msix_route(msg, dev_id)?;
                self.gsi = Some(gsi);
                gsi
            }
        };

        if self.guest_state.masked() == self.host_state.masked() {
            return Ok(());
        }

        let Some(eventfd) = self.eventfd.as_ref() else {
            return Ok(());
        };

        if self.host_state.masked() {
            routing.add_irqfd(gsi, eventfd, None)?;
        } else {
            routing.del_irqfd(gsi, eventfd)?;
        }

        self.host_state.set_masked(self.guest_state.masked());

        Ok(())
    }
}

/// State common to a whole MSI or MSI-X capability.
pub struct MsiCommon {
    /// Passthrough-driver IRQ index this capability programs.
    pub irq_index: u32,
    pub guest_state: MsiState,
    pub host_state: MsiState,
    pub vectors: Vec<MsiVector>,
    /// The fd last handed to the passthrough driver for each vector, -1
    /// for none. Lets the per-vector update path skip vectors already
    /// programmed correctly.
    pub programmed: Vec<RawFd>,
}

impl MsiCommon {
    pub fn new(irq_index: u32, nr_vectors: usize) -> Self {
        MsiCommon {
            irq_index,
            guest_state: MsiState::default(),
            host_state: MsiState::default(),
            vectors: (0..nr_vectors).map(|_| MsiVector::new()).collect(),
            programmed: vec![-1; nr_vectors],
        }
    }
}

/// Legacy pin interrupt plumbing.
///
/// INTx is level-triggered, so two event fds are needed: `trigger` asserts
/// the line towards the guest, `unmask` reports the guest-side deassertion
/// back so the passthrough driver can re-arm the (auto-masked) host line.
pub struct IntxRouting {
    gsi: u32,
    fds: Option<(EventFd, EventFd)>,
}

impl IntxRouting {
    pub fn new(gsi: u32) -> Self {
        IntxRouting { gsi, fds: None }
    }

    pub fn armed(&self) -> bool {
        self.fds.is_some()
    }

    pub fn trigger_fd(&self) -> RawFd {
        self.fds.as_ref().map_or(-1, |(trigger, _)| trigger.as_raw_fd())
    }

    pub fn enable(&mut self, vfio: &dyn Vfio, routing: &dyn IrqRouting) -> Result<(), VfioPciError> {
        if self.fds.is_some() {
            return Ok(());
        }

        let trigger = EventFd::new(0).map_err(VfioPciError::EventFd)?;
        let unmask = EventFd::new(0).map_err(VfioPciError::EventFd)?;

        routing
            .add_irqfd(self.gsi, &trigger, Some(&unmask))
            .map_err(VfioPciError::Routing)?;

        if let Err(e) = vfio.enable_irq_fds(VFIO_PCI_INTX_IRQ_INDEX, 0, &[Some(&trigger)]) {
            let _ = routing.del_irqfd(self.gsi, &trigger);
            return Err(VfioPciError::EnableIntx(e));
        }

        if let Err(e) = vfio.set_unmask_fd(VFIO_PCI_INTX_IRQ_INDEX, &unmask) {
            let _ = vfio.disable_irq(VFIO_PCI_INTX_IRQ_INDEX);
            let _ = routing.del_irqfd(self.gsi, &trigger);
            return Err(VfioPciError::EnableIntx(e));
        }

        self.fds = Some((trigger, unmask));

        Ok(())
    }

    pub fn disable(&mut self, vfio: &dyn Vfio, routing: &dyn IrqRouting) {
        let Some((trigger, _unmask)) = self.fds.take() else {
            return;
        };

        if let Err(e) = vfio.disable_irq(VFIO_PCI_INTX_IRQ_INDEX) {
            error!("could not disable INTx: {}", e);
        }

        if let Err(e) = routing.del_irqfd(self.gsi, &trigger) {
            error!("could not remove INTx irqfd route: {}", e);
        }

        // Both event fds are closed on drop.
    }
}

// Running estimate of how many fds the process needs: around 27 under
// normal load, plus 100 for good measure, plus one per interrupt vector
// seen so far.
static ESTIMATED_FDS: AtomicU64 = AtomicU64::new(128);

/// Raises the open-file soft limit (and, when permitted, the hard limit)
/// if registering `num` more event fds would exceed it. A device exposing
/// 2048 MSI-X vectors blows through the default 1024-fd limit otherwise.
///
/// Failure to raise the limit is a warning, not an error.
pub fn reserve_irq_fds(num: u64) {
    let needed = ESTIMATED_FDS.fetch_add(num, Ordering::SeqCst) + num;

    let mut fd_limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: fd_limit is a valid out-pointer for getrlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut fd_limit) } != 0 {
        warn!(
            "getrlimit(RLIMIT_NOFILE) failed: {}",
            io::Error::last_os_error()
        );
        return;
    }

    if fd_limit.rlim_cur >= needed {
        return;
    }

    let new_limit = libc::rlimit {
        rlim_cur: needed,
        // Bumping the hard limit only works for root, but try anyway.
        rlim_max: fd_limit.rlim_max.max(needed),
    };

    // SAFETY: new_limit is a valid rlimit.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &new_limit) } != 0 {
        warn!(
            "not enough file descriptors for full MSI-X support (estimated need: {})",
            needed - fd_limit.rlim_cur
        );
    }
}
