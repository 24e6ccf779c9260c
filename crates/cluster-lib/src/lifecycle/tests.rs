use super::*;
use crate::kubernetes::MockKubernetesApi;
use crate::models::InstanceState;
use crate::testing::{instance, security_group, CallLog, FakeBootstrap, FakeCloud, FakeDns};
use tokio::net::TcpListener;

struct Harness {
    lifecycle: NodeLifecycle,
    cloud: Arc<FakeCloud>,
    dns: Arc<FakeDns>,
    bootstrap: Arc<FakeBootstrap>,
    log: CallLog,
}

fn config(management_port: u16) -> ClusterConfig {
    let mut config = ClusterConfig::new("alpha").with_domain("example.com");
    config.management_port = management_port;
    config.dial.max_retries = 0;
    config.dial.delay_secs = 1;
    config
}

fn harness(port: u16, kubernetes: MockKubernetesApi, build: impl FnOnce(FakeCloud) -> FakeCloud) -> Harness {
    let log = CallLog::default();
    let cloud = Arc::new(build(
        FakeCloud::new(log.clone())
            .with_security_group(security_group("sg-nodes", "alpha", &[port]))
            .with_load_balancer("apiserver-alpha", &[("Cluster", "alpha")])
            .with_target_group("apiserver-alpha", "apiserver-alpha", 6443, &[])
            .with_load_balancer("ingress-alpha", &[("Cluster", "alpha")])
            .with_target_group("ingress-alpha", "ingress-alpha-tls", 30443, &[]),
    ));
    let dns = Arc::new(FakeDns::new(log.clone()));
    let bootstrap = Arc::new(FakeBootstrap::new(log.clone()));

    let lifecycle = NodeLifecycle::builder()
        .config(config(port))
        .compute(cloud.clone())
        .load_balancers(cloud.clone())
        .dns(dns.clone())
        .bootstrap(bootstrap.clone())
        .kubernetes(Arc::new(kubernetes))
        .build()
        .unwrap();

    Harness {
        lifecycle,
        cloud,
        dns,
        bootstrap,
        log,
    }
}

fn request(name: &str, role: NodeRole) -> CreateNodeRequest {
    CreateNodeRequest {
        name: name.to_string(),
        role,
        node_config: NodeConfig {
            image_id: "ami-123".to_string(),
            subnet_id: "subnet-1".to_string(),
            instance_type: "t3.large".to_string(),
            block_device_gb: 40,
            block_device_name: "/dev/xvda".to_string(),
            block_device_type: "gp3".to_string(),
            placement_group_name: None,
            domain: None,
        },
        machine_config: b"version: v1alpha1\n".to_vec(),
        patches: vec![b"machine:\n  install: {}\n".to_vec()],
    }
}

fn deleting_kubernetes(name: &'static str) -> MockKubernetesApi {
    let mut kubernetes = MockKubernetesApi::new();
    kubernetes
        .expect_delete_node()
        .withf(move |n| n == name)
        .times(1)
        .returning(|_| Ok(NodeDeletion::Deleted));
    kubernetes
}

#[tokio::test]
async fn test_create_runs_stages_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let h = harness(port, MockKubernetesApi::new(), |c| c);

    let node = h
        .lifecycle
        .create(&request("alpha-worker-1", NodeRole::Worker))
        .await
        .unwrap();

    assert_eq!(node.identity, "i-new1");
    assert_eq!(node.ip, "127.0.0.1");
    assert_eq!(node.fqdn(), "alpha-worker-1.example.com");
    assert_eq!(
        h.log.calls(),
        vec![
            "run_instance alpha-worker-1".to_string(),
            "apply_config 127.0.0.1".to_string(),
            "register arn:tg/ingress-alpha-tls i-new1".to_string(),
            "dns register alpha-worker-1.example.com".to_string(),
        ]
    );

    let applied = h.bootstrap.applied.lock().unwrap().clone();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].insecure);
    assert_eq!(applied[0].patches.len(), 2);
    assert_eq!(
        applied[0].patches[1],
        hostname_patch("alpha-worker-1.example.com")
    );

    let launched = h.cloud.instance("i-new1").unwrap();
    assert_eq!(launched.name(), Some("alpha-worker-1"));
    assert_eq!(launched.security_group_ids, vec!["sg-nodes".to_string()]);
}

#[tokio::test]
async fn test_dns_failure_leaves_earlier_side_effects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let h = harness(port, MockKubernetesApi::new(), |c| c);
    h.dns.set_failing(true);

    let err = h
        .lifecycle
        .create(&request("alpha-cp-1", NodeRole::ControlPlane))
        .await
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::RegisteringDns));
    let message = err.to_string();
    assert!(message.contains("instance launched"));
    assert!(message.contains("load balancer targets registered"));
    assert!(message.contains("manual cleanup required"));

    // No compensation: the instance and its registration stay
    let launched = h.cloud.instance("i-new1").unwrap();
    assert_eq!(launched.state, InstanceState::Pending);
    assert_eq!(h.cloud.targets("arn:tg/apiserver-alpha").len(), 1);
    assert_eq!(h.log.count("terminate"), 0);
}

#[tokio::test]
async fn test_unreachable_node_fails_awaiting_reachability() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let h = harness(port, MockKubernetesApi::new(), |c| c);

    let err = h
        .lifecycle
        .create(&request("alpha-worker-1", NodeRole::Worker))
        .await
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::AwaitingReachability));
    match &err {
        ManagerError::StageFailed { completed, source, .. } => {
            assert_eq!(completed, &vec![Stage::Launching]);
            assert!(matches!(**source, ManagerError::DialExhausted { attempts: 1, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.log.count("apply_config"), 0);
}

#[tokio::test]
async fn test_launch_requires_node_security_group() {
    let log = CallLog::default();
    let cloud = Arc::new(FakeCloud::new(log.clone()));
    let lifecycle = NodeLifecycle::builder()
        .config(config(50000))
        .compute(cloud.clone())
        .load_balancers(cloud)
        .dns(Arc::new(FakeDns::new(log.clone())))
        .bootstrap(Arc::new(FakeBootstrap::new(log.clone())))
        .kubernetes(Arc::new(MockKubernetesApi::new()))
        .build()
        .unwrap();

    let err = lifecycle
        .create(&request("alpha-worker-1", NodeRole::Worker))
        .await
        .unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::Launching));
    assert!(!err.to_string().contains("manual cleanup"));
    assert!(log.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_launch() {
    let h = harness(50000, MockKubernetesApi::new(), |c| c);
    let mut bad = request("alpha-worker-1", NodeRole::Worker);
    bad.machine_config.clear();

    let err = h.lifecycle.create(&bad).await.unwrap_err();
    assert!(matches!(err, ManagerError::ConfigurationInvalid(_)));
    assert!(h.log.calls().is_empty());
}

#[tokio::test]
async fn test_delete_unpublishes_before_terminating() {
    let h = harness(50000, deleting_kubernetes("alpha-worker-1"), |c| {
        c.with_instance(instance("i-1", "alpha-worker-1", InstanceState::Running, &[("Cluster", "alpha")]))
            .with_target_group("ingress-alpha", "ingress-alpha-clear", 30080, &[("i-1", 30080, "healthy")])
    });
    h.dns
        .records
        .lock()
        .unwrap()
        .insert("alpha-worker-1.example.com".to_string(), "10.0.0.10".to_string());

    let deleted = h.lifecycle.delete("alpha-worker-1.example.com").await.unwrap();

    assert_eq!(deleted.name, "alpha-worker-1");
    assert_eq!(deleted.identity, "i-1");
    assert_eq!(deleted.dns_records_removed, 1);
    assert_eq!(deleted.target_groups_deregistered, 3);
    assert_eq!(deleted.kubernetes, NodeDeletion::Deleted);

    let dns = h.log.position("dns deregister").unwrap();
    let deregister = h.log.position("deregister").unwrap();
    let terminate = h.log.position("terminate i-1").unwrap();
    assert!(dns < deregister);
    assert!(deregister < terminate);
    assert!(h.cloud.targets("arn:tg/ingress-alpha-clear").is_empty());
    assert_eq!(h.cloud.instance("i-1").unwrap().state, InstanceState::ShuttingDown);
}

#[tokio::test]
async fn test_delete_with_only_stopped_duplicates_is_not_found() {
    let h = harness(50000, MockKubernetesApi::new(), |c| {
        c.with_instance(instance("i-a", "alpha-worker-1", InstanceState::Stopped, &[]))
            .with_instance(instance("i-b", "alpha-worker-1", InstanceState::Stopped, &[]))
    });

    let err = h.lifecycle.delete("alpha-worker-1").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.failed_stage(), Some(Stage::ResolvingIdentity));
    assert!(h.log.calls().is_empty());
    assert_eq!(h.cloud.instance("i-a").unwrap().state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_delete_falls_back_to_fqdn_node_object() {
    let mut kubernetes = MockKubernetesApi::new();
    kubernetes
        .expect_delete_node()
        .withf(|n| n == "alpha-worker-1")
        .times(1)
        .returning(|_| Ok(NodeDeletion::AlreadyAbsent));
    kubernetes
        .expect_delete_node()
        .withf(|n| n == "alpha-worker-1.example.com")
        .times(1)
        .returning(|_| Ok(NodeDeletion::Deleted));
    let h = harness(50000, kubernetes, |c| {
        c.with_instance(instance("i-1", "alpha-worker-1", InstanceState::Running, &[]))
    });

    let deleted = h.lifecycle.delete("alpha-worker-1").await.unwrap();
    assert_eq!(deleted.kubernetes, NodeDeletion::Deleted);
    assert_eq!(deleted.dns_records_removed, 0);
}

#[tokio::test]
async fn test_kubernetes_failure_names_terminated_instance() {
    let mut kubernetes = MockKubernetesApi::new();
    kubernetes
        .expect_delete_node()
        .returning(|_| Err(anyhow::anyhow!("connection refused")));
    let h = harness(50000, kubernetes, |c| {
        c.with_instance(instance("i-1", "alpha-worker-1", InstanceState::Running, &[]))
    });

    let err = h.lifecycle.delete("alpha-worker-1").await.unwrap_err();

    assert_eq!(err.failed_stage(), Some(Stage::DeletingKubernetesNode));
    assert!(err.to_string().contains("instance terminated"));
}

#[tokio::test]
async fn test_glass_deletes_then_creates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let h = harness(port, deleting_kubernetes("alpha-worker-1"), |c| {
        c.with_instance(instance("i-1", "alpha-worker-1", InstanceState::Running, &[("Cluster", "alpha")]))
    });

    let node = h
        .lifecycle
        .glass(&request("alpha-worker-1", NodeRole::Worker))
        .await
        .unwrap();

    assert_eq!(node.identity, "i-new1");
    let terminate = h.log.position("terminate i-1").unwrap();
    let launch = h.log.position("run_instance alpha-worker-1").unwrap();
    assert!(terminate < launch);
    assert_eq!(h.dns.records.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_glass_aborts_when_delete_fails() {
    let h = harness(50000, MockKubernetesApi::new(), |c| c);

    let err = h
        .lifecycle
        .glass(&request("alpha-worker-1", NodeRole::Worker))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(h.log.count("run_instance"), 0);
}

#[test]
fn test_builder_requires_capabilities() {
    let err = NodeLifecycle::builder()
        .config(ClusterConfig::new("alpha"))
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("Compute capability is required"));

    let err = NodeLifecycle::builder().build().err().unwrap();
    assert!(err.to_string().contains("Cluster config is required"));
}
