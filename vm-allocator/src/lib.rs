// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
// SPDX-License-Identifier: Apache-2.0 OR MIT
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Manages the IOMMU domain-ID space shared between the host and guests.

mod id;

pub use crate::id::{
    DomainIdAllocator, Error, Result, KVM_IOMMU_GUEST_DOMAIN_BASE, KVM_IOMMU_MAX_DOMAINS,
};
