// Copyright © 2026 The pKVM IOMMU Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::Path;
use std::sync::Arc;

use iommu_shadow::{Error as ClientError, Hypercall, Mapped, PvIommuDomain, PvIommuInstance};
use pkvm_iommu::platform::PlatformReport;
use pviommu::abi::{
    HvcCall, PvIommuProt, SmcccStatus, DEV_REQUEST_MMIO_FUNC_ID, PVIOMMU_ALLOC_DOMAIN_FUNC_ID,
    PVIOMMU_FREE_DOMAIN_FUNC_ID, PVIOMMU_MAP_FUNC_ID,
};
use pviommu::{GuestVm, HypRequest, HypVcpu, IommuProt, PvIommu, RouteError, VcpuExit};
use serde_json::json;
use test_infra::*;
use vm_allocator::{KVM_IOMMU_GUEST_DOMAIN_BASE, KVM_IOMMU_MAX_DOMAINS};
use vm_device::{
    DeviceConfig, DeviceRegistry, IommuEndpoint, MemProtect, MmioResource, Owner, PageOwnership,
    VmHandle, PAGE_SIZE,
};
use vm_memory::GuestAddress;

const VM1: VmHandle = VmHandle(1);
const VM2: VmHandle = VmHandle(2);
const VM3: VmHandle = VmHandle(3);

const SMMU: u64 = 0x3000_0000;
const INVAL: u64 = SmcccStatus::InvalidParameter as i64 as u64;

fn device(base: u64, group: u32, sids: &[u32]) -> DeviceConfig {
    DeviceConfig {
        resources: vec![MmioResource::new(base, 0x1000)],
        iommus: sids
            .iter()
            .map(|sid| IommuEndpoint {
                iommu: SMMU,
                endpoint: *sid,
            })
            .collect(),
        group,
    }
}

struct Host {
    mem: Arc<PageOwnership>,
    devices: Arc<DeviceRegistry>,
    backend: Arc<FakeBackend>,
    hyp: Arc<PvIommu>,
}

impl Host {
    fn new(table: Vec<DeviceConfig>) -> Self {
        let mem = Arc::new(PageOwnership::new());
        let devices = Arc::new(DeviceRegistry::new(table, mem.clone()).unwrap());
        let backend = Arc::new(FakeBackend::new());
        let hyp = Arc::new(PvIommu::new(devices.clone(), backend.clone()));
        Host {
            mem,
            devices,
            backend,
            hyp,
        }
    }

    fn assign(&self, phys: &[u64], vm: VmHandle) {
        for p in phys {
            self.devices.donate(*p).unwrap();
        }
        self.devices.claim(phys[0], vm).unwrap();
    }

    // Boot a guest with pvIOMMU 0 routing `(vsid, sid)` pairs on SMMU.
    fn guest(&self, vm: VmHandle, routes: &[(u32, u32)]) -> HypercallLoop {
        let stage2 = Arc::new(FakeStage2::new());
        let guest = Arc::new(GuestVm::new(vm, stage2.clone()));

        self.hyp.router().attach(vm, 0).unwrap();
        for (vsid, sid) in routes {
            self.hyp.router().add_vsid(vm, 0, SMMU, *sid, *vsid).unwrap();
        }
        self.hyp.finalize_vm(&guest).unwrap();

        HypercallLoop::new(self.hyp.clone(), guest, stage2)
    }
}

mod device_assignment {
    use super::*;

    #[test]
    fn test_group_lifecycle() {
        let host = Host::new(vec![
            device(0x1000_0000, 1, &[1]),
            device(0x1001_0000, 1, &[2]),
            device(0x2000_0000, 2, &[3]),
        ]);
        let reset = FakeReset::new();
        host.devices
            .register_reset(0x1000_0000, reset.clone())
            .unwrap();

        host.devices.donate(0x1000_0000).unwrap();
        assert_eq!(host.devices.owner(0), Some(Owner::Hyp));
        assert!(host.mem.is_owned_by(Owner::Hyp, 0x1000_0000, 0x1000));

        // The sibling is still with the host, so the group can't move.
        assert!(host.devices.claim(0x1000_0000, VM1).is_err());
        assert_eq!(host.devices.owner(0), Some(Owner::Hyp));

        host.devices.donate(0x1001_0000).unwrap();
        host.devices.claim(0x1000_0000, VM1).unwrap();
        assert_eq!(reset.calls(), 2);
        assert_eq!(
            host.devices.owners(),
            vec![Owner::Guest(VM1), Owner::Guest(VM1), Owner::Host]
        );

        // Another guest can't take any device of the group.
        assert!(matches!(
            host.devices.claim(0x1001_0000, VM2),
            Err(vm_device::Error::PermissionDenied(1))
        ));
        assert_eq!(host.devices.owner(1), Some(Owner::Guest(VM1)));

        host.devices.teardown(VM1);
        assert_eq!(reset.calls(), 3);
        assert_eq!(host.devices.owners(), vec![Owner::Host; 3]);
        assert!(host.mem.is_owned_by(Owner::Host, 0x1000_0000, 0x1000));
        assert!(host.mem.is_owned_by(Owner::Host, 0x1001_0000, 0x1000));
    }

    #[test]
    fn test_failed_reset_leaves_group_in_transit() {
        let host = Host::new(vec![
            device(0x1000_0000, 1, &[1]),
            device(0x1001_0000, 1, &[2]),
        ]);
        host.devices
            .register_reset(0x1001_0000, FakeReset::failing())
            .unwrap();
        host.devices.donate(0x1000_0000).unwrap();
        host.devices.donate(0x1001_0000).unwrap();

        assert!(matches!(
            host.devices.claim(0x1000_0000, VM1),
            Err(vm_device::Error::Reset(1, _))
        ));
        assert_eq!(host.devices.owners(), vec![Owner::Hyp, Owner::Hyp]);

        host.devices.reclaim(0x1000_0000).unwrap();
        assert_eq!(host.devices.owner(0), Some(Owner::Host));
    }

    #[test]
    fn test_request_mmio() {
        let host = Host::new(vec![device(0x1000_0000, 1, &[1])]);

        host.devices.donate(0x1000_0000).unwrap();
        host.devices
            .map_guest_mmio(VM1, 0x1000_0000, GuestAddress(0x4000_0000))
            .unwrap();
        assert_eq!(host.devices.owner(0), Some(Owner::Guest(VM1)));
        assert_eq!(
            host.mem.guest_mapping(VM1, GuestAddress(0x4000_0000)),
            Some(0x1000_0000)
        );

        // The guest stage-2 has the device page where the host mapped it.
        let stage2 = Arc::new(FakeStage2::new());
        stage2.map(0x4000_0000, 0x1000_0000, PAGE_SIZE);
        let guest = Arc::new(GuestVm::new(VM1, stage2.clone()));
        let mut lp = HypercallLoop::new(host.hyp.clone(), guest, stage2);

        assert_eq!(
            lp.hvc(&HvcCall::new(DEV_REQUEST_MMIO_FUNC_ID, &[0x4000_0008])),
            [0, 0x1000_0000]
        );

        // Guest RAM is not device memory.
        assert_eq!(
            lp.hvc(&HvcCall::new(DEV_REQUEST_MMIO_FUNC_ID, &[0x8000])),
            [INVAL, 0]
        );
        assert_eq!(
            lp.serviced(),
            &[HypRequest::Map {
                ipa: 0x8000,
                size: PAGE_SIZE
            }]
        );
    }
}

mod hypercalls {
    use super::*;

    #[test]
    fn test_map_of_unmapped_guest_page_exits_first() {
        let host = Host::new(vec![]);
        let mut lp = host.guest(VM1, &[]);
        let domain = PvIommuDomain::alloc(&mut lp).unwrap();

        let mut vcpu = HypVcpu::new(lp.vcpu().vm().clone());
        let prot = PvIommuProt::READ | PvIommuProt::WRITE;
        let call = HvcCall::new(
            PVIOMMU_MAP_FUNC_ID,
            &[domain.id() as u64, 0x1000, 0x2000, PAGE_SIZE, 4, prot.bits()],
        );

        assert_eq!(
            vcpu.handle_hvc(&host.hyp, &call),
            VcpuExit::HypRequest {
                ret: None,
                requests: vec![HypRequest::Map {
                    ipa: 0x2000,
                    size: PAGE_SIZE
                }],
            }
        );
        assert_eq!(vcpu.pc(), 0);
        assert_eq!(host.backend.map_calls(), 0);
        assert_eq!(host.backend.mapped_pages(domain.id()), 0);
    }

    #[test]
    fn test_restartable_map_and_unmap() {
        let host = Host::new(vec![]);
        let mut lp = host.guest(VM1, &[]);

        let inst = PvIommuInstance::probe(&mut lp, 0).unwrap();
        assert_eq!(inst.pgsize_bitmap, PAGE_SIZE);

        let mut domain = PvIommuDomain::alloc(&mut lp).unwrap();
        let iova = 0x10_0000;
        let mapped = domain.map_pages(
            &mut lp,
            iova,
            0x4000,
            PAGE_SIZE,
            16,
            PvIommuProt::READ | PvIommuProt::WRITE,
        );

        assert_eq!(
            mapped,
            Mapped {
                size: 16 * PAGE_SIZE,
                error: None
            }
        );
        assert!(lp.retries() > 0);
        assert!(lp
            .serviced()
            .iter()
            .any(|r| matches!(r, HypRequest::Memory { .. })));
        assert_eq!(host.backend.mapped_pages(domain.id()), 16);
        assert_eq!(
            host.backend.translate(domain.id(), iova + 0x3010),
            Some((GUEST_RAM_BASE + 0x7010, IommuProt::READ | IommuProt::WRITE))
        );
        assert_eq!(domain.iova_to_phys(iova + 0x3010), Some(0x7010));

        let unmapped = domain.unmap_pages(&mut lp, iova + 0x4000, PAGE_SIZE, 4);
        assert_eq!(unmapped, 4 * PAGE_SIZE);
        assert_eq!(host.backend.mapped_pages(domain.id()), 12);
        assert_eq!(domain.iova_to_phys(iova + 0x5000), None);
        assert_eq!(domain.iova_to_phys(iova + 0x8000), Some(0xc000));
        assert_eq!(
            host.backend.translate(domain.id(), iova + 0x8000),
            Some((GUEST_RAM_BASE + 0xc000, IommuProt::READ | IommuProt::WRITE))
        );
        assert_eq!(domain.mappings().len(), 2);

        // Unmapping a hole makes no progress.
        assert_eq!(domain.unmap_pages(&mut lp, iova + 0x4000, PAGE_SIZE, 1), 0);
    }

    #[test]
    fn test_map_rejects_bad_arguments() {
        let host = Host::new(vec![]);
        let mut lp = host.guest(VM1, &[]);
        let mut domain = PvIommuDomain::alloc(&mut lp).unwrap();

        let bad_pgsize = domain.map_pages(&mut lp, 0, 0x4000, 0x20_0000, 1, PvIommuProt::READ);
        assert_eq!(bad_pgsize.error, Some(ClientError::InvalidParameter));

        let call = HvcCall::new(
            PVIOMMU_MAP_FUNC_ID,
            &[domain.id() as u64, 0, 0x4000, PAGE_SIZE, 1, 1 << 7],
        );
        assert_eq!(lp.hvc(&call), [INVAL, 0]);

        let overflow = HvcCall::new(
            PVIOMMU_MAP_FUNC_ID,
            &[domain.id() as u64, u64::MAX - 0xfff, 0x4000, PAGE_SIZE, 2, 1],
        );
        assert_eq!(lp.hvc(&overflow), [INVAL, 0]);
        assert_eq!(host.backend.map_calls(), 0);
    }

    #[test]
    fn test_attach_detach_with_rollback() {
        let host = Host::new(vec![device(0x1000_0000, 1, &[5, 6]), device(0x2000_0000, 2, &[9])]);
        host.assign(&[0x1000_0000], VM1);
        let mut lp = host.guest(VM1, &[(0, 5), (1, 6), (2, 9)]);

        let inst = PvIommuInstance::probe(&mut lp, 0).unwrap();
        let domain = PvIommuDomain::alloc(&mut lp).unwrap();

        // vsid 7 is not routed, the first two streams are rolled back.
        assert_eq!(
            domain.attach(&mut lp, &inst, &[0, 1, 7], 0, 0),
            Err(ClientError::InvalidParameter)
        );
        assert_eq!(host.backend.stream_domain(SMMU, 5, 0), None);
        assert_eq!(host.backend.stream_domain(SMMU, 6, 0), None);
        assert!(lp.vcpu().vm().attachments().is_empty());

        // vsid 2 routes to a device the guest doesn't own.
        assert_eq!(
            domain.attach(&mut lp, &inst, &[2], 0, 0),
            Err(ClientError::InvalidParameter)
        );

        domain.attach(&mut lp, &inst, &[0, 1], 0, 0).unwrap();
        assert_eq!(host.backend.stream_domain(SMMU, 5, 0), Some(domain.id()));
        assert_eq!(host.backend.stream_domain(SMMU, 6, 0), Some(domain.id()));
        assert_eq!(lp.vcpu().vm().attachments().len(), 2);

        // Busy in the backend.
        assert_eq!(
            lp.hvc(&HvcCall::new(
                PVIOMMU_FREE_DOMAIN_FUNC_ID,
                &[domain.id() as u64]
            )),
            [INVAL, 0]
        );

        domain.detach(&mut lp, &inst, &[0, 1], 0).unwrap();
        assert!(lp.vcpu().vm().attachments().is_empty());
        domain.free(&mut lp).unwrap();
        assert_eq!(host.hyp.domains_in_use(), 0);
        assert!(host.backend.domains().is_empty());
    }

    #[test]
    fn test_domain_ids_stay_in_guest_range() {
        let host = Host::new(vec![]);
        let mut lp1 = host.guest(VM1, &[]);
        let mut lp2 = host.guest(VM2, &[]);

        let d1 = PvIommuDomain::alloc(&mut lp1).unwrap();
        let d2 = PvIommuDomain::alloc(&mut lp2).unwrap();
        let d3 = PvIommuDomain::alloc(&mut lp1).unwrap();

        for id in [d1.id(), d2.id(), d3.id()] {
            assert!(id >= KVM_IOMMU_GUEST_DOMAIN_BASE);
            assert!(id < KVM_IOMMU_MAX_DOMAINS);
        }
        assert_ne!(d1.id(), d2.id());
        assert_ne!(d1.id(), d3.id());
        assert_eq!(host.hyp.domains_in_use(), 3);

        // Guests can only touch their own domains.
        assert_eq!(
            lp2.hvc(&HvcCall::new(PVIOMMU_FREE_DOMAIN_FUNC_ID, &[d1.id() as u64])),
            [INVAL, 0]
        );
        assert_eq!(
            lp2.hvc(&HvcCall::new(
                PVIOMMU_MAP_FUNC_ID,
                &[d1.id() as u64, 0, 0x4000, PAGE_SIZE, 1, 1]
            )),
            [INVAL, 0]
        );
        assert_eq!(
            lp1.hvc(&HvcCall::new(PVIOMMU_FREE_DOMAIN_FUNC_ID, &[5])),
            [INVAL, 0]
        );

        let freed = d1.id();
        d1.free(&mut lp1).unwrap();
        let [status, reused] = lp2.hvc(&HvcCall::new(PVIOMMU_ALLOC_DOMAIN_FUNC_ID, &[]));
        assert_eq!(status, 0);
        assert_eq!(reused as u32, freed);
    }

    #[test]
    fn test_vsid_routes_are_per_guest() {
        let host = Host::new(vec![]);
        let lp1 = host.guest(VM1, &[(0, 10), (1, 11)]);
        let lp2 = host.guest(VM2, &[(0, 20)]);

        assert_eq!(lp1.vcpu().vm().route(0, 0).unwrap().sid, 10);
        assert_eq!(lp1.vcpu().vm().route(0, 1).unwrap().sid, 11);
        assert_eq!(lp2.vcpu().vm().route(0, 0).unwrap().sid, 20);
        assert!(lp2.vcpu().vm().route(0, 1).is_none());
        assert!(lp1.vcpu().vm().route(1, 0).is_none());
        assert_eq!(host.hyp.router().owner_of(SMMU, 11), Some(VM1));

        // A physical stream belongs to one guest at a time.
        let stage2 = Arc::new(FakeStage2::new());
        let guest3 = GuestVm::new(VM3, stage2);
        host.hyp.router().attach(VM3, 0).unwrap();
        host.hyp.router().add_vsid(VM3, 0, SMMU, 10, 0).unwrap();
        assert!(matches!(
            host.hyp.finalize_vm(&guest3),
            Err(pviommu::Error::Route(VM3, RouteError::RouteClaimed(SMMU, 10, VM1)))
        ));

        host.hyp.teardown_vm(lp1.vcpu().vm());
        assert_eq!(host.hyp.router().owner_of(SMMU, 10), None);
        host.hyp.finalize_vm(&guest3).unwrap();
        assert_eq!(guest3.route(0, 0).unwrap().sid, 10);

        assert!(matches!(
            host.hyp.finalize_vm(&guest3),
            Err(pviommu::Error::AlreadyFinalized(VM3))
        ));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let host = Host::new(vec![device(0x1000_0000, 1, &[5])]);
        host.assign(&[0x1000_0000], VM1);
        let mut lp = host.guest(VM1, &[(0, 5)]);

        let inst = PvIommuInstance::probe(&mut lp, 0).unwrap();
        let mut domain = PvIommuDomain::alloc(&mut lp).unwrap();
        domain.attach(&mut lp, &inst, &[0], 0, 0).unwrap();
        let mapped = domain.map_pages(&mut lp, 0, 0x4000, PAGE_SIZE, 2, PvIommuProt::READ);
        assert_eq!(mapped.size, 2 * PAGE_SIZE);

        host.hyp.teardown_vm(lp.vcpu().vm());

        assert!(host.backend.domains().is_empty());
        assert_eq!(host.backend.stream_domain(SMMU, 5, 0), None);
        assert_eq!(host.hyp.domains_in_use(), 0);
        assert_eq!(host.devices.owner(0), Some(Owner::Host));
        assert!(host.mem.is_owned_by(Owner::Host, 0x1000_0000, 0x1000));
        assert_eq!(host.hyp.router().owner_of(SMMU, 5), None);
    }

    #[test]
    fn test_unknown_function_is_not_handled() {
        let host = Host::new(vec![]);
        let mut lp = host.guest(VM1, &[]);
        assert_eq!(
            lp.hvc(&HvcCall::new(0xc600_00ff, &[])),
            [SmcccStatus::NotSupported.to_reg(), 0]
        );
    }
}

mod cli {
    use super::*;

    fn binary() -> &'static Path {
        Path::new(env!("CARGO_BIN_EXE_pkvm-iommu"))
    }

    #[test]
    fn test_platform_report() {
        let platform = json!({
            "devices": [
                {
                    "resources": [{ "base": 0x1000_0000u64, "size": 0x1000 }],
                    "iommus": [{ "iommu": SMMU, "endpoint": 5 }],
                    "group": 1
                },
                {
                    "resources": [{ "base": 0x2000_0000u64, "size": 0x1000 }],
                    "iommus": [{ "iommu": SMMU, "endpoint": 9 }],
                    "group": 2
                }
            ],
            "guests": [
                {
                    "vm": 1,
                    "devices": [0x1000_0000u64],
                    "pviommus": [
                        {
                            "id": 0,
                            "routes": [
                                { "iommu": SMMU, "sid": 5, "vsid": 0 },
                                { "iommu": SMMU, "sid": 9, "vsid": 1 }
                            ]
                        }
                    ]
                }
            ]
        });

        let (output, report) = run_platform(binary(), &platform).unwrap();
        assert!(output.status.success());
        let report: PlatformReport = serde_json::from_value(report.unwrap()).unwrap();

        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.devices[0].owner, Owner::Guest(VM1));
        assert_eq!(report.devices[1].owner, Owner::Host);

        let routes = &report.guests[0].pviommus[0].routes;
        assert_eq!(routes.len(), 2);
        assert!(routes[0].reachable);
        assert!(!routes[1].reachable);
    }

    #[test]
    fn test_invalid_platform_fails() {
        let platform = json!({
            "devices": [
                { "resources": [{ "base": 0x1000_0010u64, "size": 0x1000 }], "group": 1 }
            ]
        });

        let (output, report) = run_platform(binary(), &platform).unwrap();
        assert!(!output.status.success());
        assert!(report.is_none());

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("pkvm-iommu exited"));
        assert!(stderr.contains("Failed to boot the platform"));
    }
}
