//! Fan-out provisioning against the in-memory runtime.
//!
//! These cover the all-or-nothing guarantees: ordered results, cleanup after
//! a failed member, cleanup after cancellation, and idempotent release.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stevedore::docker::{CancelToken, MemoryRuntime};
use stevedore::{Error, ProvisionRequest, Provisioner};

fn runtime(images: &[&str]) -> Arc<MemoryRuntime> {
    let rt = Arc::new(MemoryRuntime::new());
    for image in images {
        rt.with_image(image);
    }
    rt
}

/// Poll `cond` until it holds or a few seconds pass.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn results_follow_request_order() {
    let rt = runtime(&["redis:7", "mongo:4.4", "mysql:8"]);
    let p = Provisioner::new(rt.clone());
    let requests = [
        ProvisionRequest::new("redis:7", "6379").binding_port("36379"),
        ProvisionRequest::new("mongo:4.4", "27017").binding_port("37017"),
        ProvisionRequest::new("mysql:8", "3306").binding_port("33306"),
    ];

    let set = p.provision_all(&requests, &CancelToken::new()).unwrap();

    assert_eq!(set.len(), 3);
    let uris: Vec<_> = set.iter().map(|r| r.uri.as_str()).collect();
    assert_eq!(
        uris,
        ["127.0.0.1:36379", "127.0.0.1:37017", "127.0.0.1:33306"]
    );
    assert_eq!(rt.running_count(), 3);

    set.release().unwrap();
    assert!(rt.container_ids().is_empty());
}

#[test]
fn many_members_all_come_up() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());
    let requests: Vec<_> = (0..12)
        .map(|i| ProvisionRequest::new("redis:7", "6379").name(format!("redis-{i}")))
        .collect();

    let set = p.provision_all(&requests, &CancelToken::new()).unwrap();

    assert_eq!(set.len(), 12);
    for (i, resource) in set.iter().enumerate() {
        assert_eq!(resource.name.as_deref(), Some(format!("redis-{i}").as_str()));
    }
    drop(set);
    assert!(rt.container_ids().is_empty());
}

#[test]
fn failing_member_releases_every_other_member() {
    for k in 0..3 {
        let rt = runtime(&["redis:7", "broken:1"]);
        rt.fail_create("broken:1");
        let p = Provisioner::new(rt.clone());
        let mut requests = vec![ProvisionRequest::new("redis:7", "6379"); 3];
        requests[k] = ProvisionRequest::new("broken:1", "80");

        let err = p.provision_all(&requests, &CancelToken::new()).unwrap_err();

        match err {
            Error::Aggregate {
                index,
                source,
                leaked,
            } => {
                assert_eq!(index, k);
                assert!(matches!(*source, Error::CreationFailed { .. }));
                assert!(leaked.is_empty());
            }
            other => panic!("expected Aggregate, got: {other:?}"),
        }
        assert!(rt.container_ids().is_empty(), "index {k} left containers behind");
    }
}

#[test]
fn port_failure_in_one_member_is_reported() {
    let rt = runtime(&["redis:7", "nobind:1"]);
    rt.drop_bindings("nobind:1");
    let p = Provisioner::new(rt.clone());

    let err = p
        .provision_all(
            &[
                ProvisionRequest::new("redis:7", "6379"),
                ProvisionRequest::new("nobind:1", "8080"),
            ],
            &CancelToken::new(),
        )
        .unwrap_err();

    assert!(matches!(err, Error::Aggregate { index: 1, ref source, .. }
        if matches!(**source, Error::PortUnavailable { .. })));
    assert!(rt.container_ids().is_empty());
}

#[test]
fn invalid_member_fails_the_whole_call() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());

    let err = p
        .provision_all(
            &[ProvisionRequest::new("redis:7", "6379"), ProvisionRequest::default()],
            &CancelToken::new(),
        )
        .unwrap_err();

    assert!(matches!(err, Error::Aggregate { index: 1, ref source, .. }
        if matches!(**source, Error::InvalidRequest(_))));
    assert!(rt.container_ids().is_empty());
}

#[test]
fn cancelling_mid_flight_leaves_nothing_running() {
    let rt = runtime(&["slow-inspect:1", "slow-create:1"]);
    rt.stall_inspect("slow-inspect:1").stall_create("slow-create:1");
    let p = Provisioner::new(rt.clone());
    let cancel = CancelToken::new();
    let requests = [
        ProvisionRequest::new("slow-inspect:1", "6379"),
        ProvisionRequest::new("slow-inspect:1", "6379"),
        ProvisionRequest::new("slow-create:1", "6379"),
    ];

    thread::scope(|s| {
        let worker = s.spawn(|| p.provision_all(&requests, &cancel));

        // Two containers exist but have not been inspected yet; the third is
        // still being created.
        assert!(eventually(|| rt.container_ids().len() == 2));
        cancel.cancel();

        let err = worker.join().unwrap().unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");
        assert!(err.leaked().is_empty());
    });

    assert!(rt.container_ids().is_empty());
    assert_eq!(rt.removals().len(), 2);
}

#[test]
fn cancelled_before_start_makes_no_containers() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = p
        .provision_all(&[ProvisionRequest::new("redis:7", "6379")], &cancel)
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(rt.container_ids().is_empty());
}

#[test]
fn cancelling_after_success_releases_the_result() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());
    let cancel = CancelToken::new();

    let set = p
        .provision_all(
            &[
                ProvisionRequest::new("redis:7", "6379"),
                ProvisionRequest::new("redis:7", "6379"),
            ],
            &cancel,
        )
        .unwrap();
    assert_eq!(rt.running_count(), 2);

    cancel.cancel();
    assert!(eventually(|| set.is_released()));
    assert!(rt.container_ids().is_empty());

    // Explicit release afterwards is a no-op.
    set.release().unwrap();
    assert_eq!(rt.removals().len(), 2);
}

#[test]
fn release_twice_equals_release_once() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());
    let set = p
        .provision_all(&[ProvisionRequest::new("redis:7", "6379")], &CancelToken::new())
        .unwrap();

    set.release().unwrap();
    set.release().unwrap();

    assert_eq!(rt.removals().len(), 1);
    assert!(set.is_released());
}

#[test]
fn concurrent_release_is_safe() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());
    let requests = vec![ProvisionRequest::new("redis:7", "6379"); 4];
    let set = p.provision_all(&requests, &CancelToken::new()).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| set.release().unwrap());
        }
    });

    assert_eq!(rt.removals().len(), 4);
    assert!(rt.container_ids().is_empty());
}

#[test]
fn override_replaces_a_same_named_container() {
    let rt = runtime(&["redis:7"]);
    let old = rt.seed_container("svc-1", "redis:7");
    let p = Provisioner::new(rt.clone());

    let set = p
        .provision_all(
            &[ProvisionRequest::new("redis:7", "6379")
                .name("svc-1")
                .override_existing(true)],
            &CancelToken::new(),
        )
        .unwrap();

    assert_ne!(set[0].id, old);
    assert_eq!(rt.container_names(), vec!["svc-1"]);
    assert_eq!(rt.removals(), vec![old]);
}

#[test]
fn runtime_chosen_port_is_reported() {
    let rt = runtime(&["redis:7"]);
    let p = Provisioner::new(rt.clone());

    let set = p
        .provision_all(
            &[ProvisionRequest::new("redis:7", "6379").binding_port("")],
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(set[0].port, "32768");
    assert_eq!(set[0].uri, "127.0.0.1:32768");
}

#[test]
fn unavailable_runtime_is_reported() {
    let rt = runtime(&["redis:7"]);
    rt.set_unavailable(true);
    let p = Provisioner::new(rt.clone());

    let err = p
        .provision_all(&[ProvisionRequest::new("redis:7", "6379")], &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, Error::Aggregate { ref source, .. }
        if matches!(**source, Error::RuntimeUnavailable(_))));
}

#[test]
fn stuck_member_is_listed_as_leaked() {
    let rt = runtime(&["stuck:1", "broken:1"]);
    rt.fail_remove("stuck:1").stall_inspect("stuck:1").fail_create("broken:1");
    let p = Provisioner::new(rt.clone());

    let err = p
        .provision_all(
            &[
                ProvisionRequest::new("stuck:1", "80"),
                ProvisionRequest::new("broken:1", "80"),
            ],
            &CancelToken::new(),
        )
        .unwrap_err();

    // The stuck container may or may not have been created before the
    // failure cancelled it; whatever is left must be reported.
    assert_eq!(err.leaked(), rt.container_ids());
}
