use std::path::Path;

use corepin::{
    Container, CoreInventory, CpuManagerConfig, CpuManagerError, CpuSet, MachineInventory, Manager,
    NumaNodeInventory, Pod, PolicyKind, QosClass, SocketInventory, RESOURCE_CPU,
};
use pretty_assertions::assert_eq;

/// NUMA0 = {0,1,2,6,7,8}, NUMA1 = {3,4,5,9,10,11}, one socket per node.
fn inventory() -> MachineInventory {
    let socket = |id: usize, first: usize| SocketInventory {
        id,
        cores: (0..3)
            .map(|i| CoreInventory {
                id: i,
                threads: vec![first + i, first + i + 6],
            })
            .collect(),
    };
    MachineInventory {
        numa_nodes: vec![
            NumaNodeInventory { id: 0, sockets: vec![0] },
            NumaNodeInventory { id: 1, sockets: vec![1] },
        ],
        sockets: vec![socket(0, 0), socket(1, 3)],
    }
}

fn config(policy: PolicyKind, dir: &Path) -> CpuManagerConfig {
    CpuManagerConfig {
        policy,
        state_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

fn guaranteed(uid: &str, containers: &[(&str, u64)]) -> Pod {
    Pod {
        uid: uid.into(),
        qos_class: QosClass::Guaranteed,
        init_containers: vec![],
        containers: containers
            .iter()
            .map(|(name, cpus)| Container::with_cpus(name, *cpus))
            .collect(),
    }
}

fn all_cpus() -> CpuSet {
    (0..12).collect()
}

#[test]
fn test_assignments_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(PolicyKind::Static, dir.path());
    let pod = guaranteed("pod-a", &[("app", 4), ("sidecar", 1)]);

    let manager = Manager::new(&config, &inventory()).unwrap();
    let app = manager.allocate(&pod, &pod.containers[0]).unwrap().unwrap();
    let sidecar = manager.allocate(&pod, &pod.containers[1]).unwrap().unwrap();
    assert_eq!(app, CpuSet::from([0, 1, 6, 7]));
    assert_eq!(sidecar.len(), 1);
    let before = manager.snapshot();
    drop(manager);

    let blob = std::fs::read(config.checkpoint_path()).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    assert_eq!(json["policyName"], "static");
    assert_eq!(json["entries"]["pod-a"]["app"], app.to_string());
    assert!(json["checksum"].is_u64());

    let manager = Manager::new(&config, &inventory()).unwrap();
    assert_eq!(manager.snapshot(), before);
    assert_eq!(manager.get_cpu_set("pod-a", "app"), Some(app.clone()));
    assert_eq!(manager.get_cpu_set_or_default("pod-b", "app"), before.default_cpu_set);

    manager.remove_container("pod-a", "app").unwrap();
    manager.remove_container("pod-a", "sidecar").unwrap();
    assert_eq!(manager.default_cpu_set(), all_cpus());
    assert!(manager.assignments().is_empty());
}

#[test]
fn test_policy_switch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    Manager::new(&config(PolicyKind::None, dir.path()), &inventory()).unwrap();

    let err = Manager::new(&config(PolicyKind::Static, dir.path()), &inventory()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CpuManagerError>(),
        Some(CpuManagerError::PolicyMismatch { .. })
    ));
}

#[test]
fn test_tampered_checkpoint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(PolicyKind::Static, dir.path());
    let pod = guaranteed("pod-a", &[("app", 2)]);
    let manager = Manager::new(&config, &inventory()).unwrap();
    manager.allocate(&pod, &pod.containers[0]).unwrap();
    drop(manager);

    let path = config.checkpoint_path();
    let original = std::fs::read_to_string(&path).unwrap();
    let tampered = original.replacen("\"app\":\"0,6\"", "\"app\":\"1,7\"", 1);
    assert_ne!(original, tampered);
    std::fs::write(&path, tampered).unwrap();

    let err = Manager::new(&config, &inventory()).unwrap_err();
    let err = err.downcast_ref::<CpuManagerError>().unwrap();
    assert!(matches!(err, CpuManagerError::ChecksumMismatch { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_legacy_checkpoint_is_migrated() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(PolicyKind::Static, dir.path());

    let content = r#""policyName":"static","defaultCpuSet":"2-5,7-11","entries":{"pod-a/app":"0,6","pod-a/sidecar":"1"}"#;
    let checksum = u64::from(crc32c::crc32c(format!("{{{content}}}").as_bytes()));
    std::fs::write(
        config.checkpoint_path(),
        format!("{{{content},\"checksum\":{checksum}}}"),
    )
    .unwrap();

    let manager = Manager::new(&config, &inventory()).unwrap();
    assert_eq!(manager.get_cpu_set("pod-a", "app"), Some(CpuSet::from([0, 6])));
    assert_eq!(manager.get_cpu_set("pod-a", "sidecar"), Some(CpuSet::from([1])));

    // The next write uses the nested layout.
    manager.remove_container("pod-a", "sidecar").unwrap();
    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(config.checkpoint_path()).unwrap()).unwrap();
    assert_eq!(json["entries"]["pod-a"]["app"], "0,6");
    assert!(json["entries"].get("pod-a/app").is_none());
}

#[test]
fn test_reserved_cpus_stay_out_of_pool() {
    let dir = tempfile::tempdir().unwrap();
    let config = CpuManagerConfig {
        num_reserved_cpus: 2,
        ..config(PolicyKind::Static, dir.path())
    };
    let manager = Manager::new(&config, &inventory()).unwrap();
    assert_eq!(manager.default_cpu_set(), all_cpus().difference(&CpuSet::from([0, 6])));

    let pod = guaranteed("pod-a", &[("app", 11)]);
    assert_eq!(manager.get_pod_topology_hints(&pod)[RESOURCE_CPU], None);
    assert!(matches!(
        manager.allocate(&pod, &pod.containers[0]),
        Err(CpuManagerError::Allocation {
            requested: 11,
            available: 10
        })
    ));
}

#[test]
fn test_main_container_takes_over_init_cpus() {
    let dir = tempfile::tempdir().unwrap();
    let config = CpuManagerConfig {
        num_reserved_cpus: 2,
        ..config(PolicyKind::Static, dir.path())
    };
    let pod = Pod {
        init_containers: vec![Container::with_cpus("init", 6)],
        ..guaranteed("pod-a", &[("app", 6)])
    };
    assert_eq!(pod.guaranteed_cpus_total(), 6);

    let manager = Manager::new(&config, &inventory()).unwrap();
    let hints = manager.get_pod_topology_hints(&pod);
    assert!(hints[RESOURCE_CPU].as_ref().is_some_and(|h| !h.is_empty()));

    let init = manager.allocate(&pod, &pod.init_containers[0]).unwrap().unwrap();
    drop(manager);

    // The hand-over survives a restart in between.
    let manager = Manager::new(&config, &inventory()).unwrap();
    let app = manager.allocate(&pod, &pod.containers[0]).unwrap().unwrap();
    assert_eq!(app, init);
    assert_eq!(manager.get_cpu_set("pod-a", "init"), None);
    manager
        .snapshot()
        .validate(&all_cpus().difference(&CpuSet::from([0, 6])))
        .unwrap();
}

#[test]
fn test_bad_inventory_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut inventory = inventory();
    inventory.sockets[1].cores[0].threads.clear();

    let err = Manager::new(&config(PolicyKind::Static, dir.path()), &inventory).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CpuManagerError>(),
        Some(CpuManagerError::TopologyDiscovery(_))
    ));
}

#[test]
fn test_concurrent_callers_keep_partition() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(&config(PolicyKind::Static, dir.path()), &inventory()).unwrap();
    let pinnable = all_cpus();

    std::thread::scope(|s| {
        for worker in 0..4 {
            let manager = &manager;
            let pinnable = &pinnable;
            s.spawn(move || {
                let mut held: Option<Pod> = None;
                for i in 0..40u64 {
                    let pod = guaranteed(&format!("pod-{worker}-{i}"), &[("app", 1 + i % 3)]);
                    manager.get_pod_topology_hints(&pod);
                    match manager.allocate(&pod, &pod.containers[0]) {
                        Ok(Some(cpus)) => assert_eq!(cpus.len() as u64, 1 + i % 3),
                        Ok(None) => panic!("guaranteed pod was not pinned"),
                        Err(e) => assert!(!e.is_fatal(), "unexpected error: {e}"),
                    }
                    manager.snapshot().validate(pinnable).unwrap();

                    if let Some(prev) = held.replace(pod) {
                        manager.remove_container(&prev.uid, "app").unwrap();
                    }
                    manager.snapshot().validate(pinnable).unwrap();
                }
            });
        }
    });

    let state = manager.snapshot();
    state.validate(&pinnable).unwrap();
    assert!(state.assignments.len() <= 4);
}
