// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use vm_device::DeviceRegistry;

use crate::abi::{HvcCall, HvcReturn};
use crate::handler::HvcOutcome;
use crate::vm::HypVcpu;

/// REQUEST_MMIO: the guest asks which physical page backs the device page
/// it has at `ipa`. Only pages of devices the guest owns are revealed.
pub(crate) fn request_mmio(devices: &DeviceRegistry, vcpu: &mut HypVcpu, call: &HvcCall) -> HvcOutcome {
    let ipa = call.arg(1);

    let Some(phys) = vcpu.guest_pa(ipa) else {
        return if vcpu.has_requests() {
            HvcOutcome::Retry
        } else {
            HvcOutcome::Done(HvcReturn::invalid())
        };
    };

    if devices.guest_owns_mmio(vcpu.vm().handle(), phys) {
        HvcOutcome::Done(HvcReturn::success(phys))
    } else {
        HvcOutcome::Done(HvcReturn::invalid())
    }
}
