//! End-to-end lifecycle scenarios against the in-process backends.
//!
//! Each test builds a full conductor with an in-memory store, stack
//! engine, identity/network/LB/secret services, then drives clusters
//! through create/resize/delete and asserts on the converged state the
//! way an API user polling the entities would see it.

use std::sync::Arc;
use std::time::Duration;

use corral_cloud::memory::{
    MemoryIdentity, MemoryLoadBalancers, MemoryNetwork, MemorySecretStore,
};
use corral_cloud::ProvisioningStatus;
use corral_common::config::{CertManagerType, CorralConfig};
use corral_common::status::{ClusterStatus, Coe, NodeGroupRole};
use corral_common::{cluster_resource_marker, RequestContext};
use corral_conductor::notify::{events, RecordingNotifier};
use corral_conductor::{
    ClusterCreateRequest, ClusterUpdate, Conductor, Ctx, NodeGroupCreateRequest, Outcome,
    ResizeRequest,
};
use corral_driver::stack::engine::InMemoryStackEngine;
use corral_driver::stack::StackDriver;
use corral_driver::DriverRegistry;
use corral_store::{Cluster, NodeGroupFilters, Quota, SqliteStore, X509Filters};
use corral_trust::TrustCertManager;

struct Harness {
    ctx: Arc<Ctx>,
    conductor: Conductor,
    engine: Arc<InMemoryStackEngine>,
    identity: Arc<MemoryIdentity>,
    loadbalancers: Arc<MemoryLoadBalancers>,
    network: Arc<MemoryNetwork>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with(ticks_to_converge: u32, mutate: impl FnOnce(&mut CorralConfig)) -> Harness {
    let mut config = CorralConfig::default();
    // Zero-interval polling keeps the suite fast; pollers still stop on
    // terminal outcomes or the attempt budget.
    config.cluster_heat.wait_interval_secs = 0;
    config.cluster_heat.pre_delete_lb_timeout_secs = 1;
    // Keypair rows in the store so tests can observe cert lifecycle
    config.certificates.cert_manager_type = CertManagerType::Database;
    mutate(&mut config);

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let identity = Arc::new(MemoryIdentity::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let network = Arc::new(MemoryNetwork::new());
    let loadbalancers = Arc::new(MemoryLoadBalancers::new());
    let engine = Arc::new(InMemoryStackEngine::new(ticks_to_converge));
    let notifier = Arc::new(RecordingNotifier::new());

    let trust = Arc::new(TrustCertManager::new(
        identity.clone(),
        secrets,
        store.clone(),
        config.certificates.clone(),
        config.trust.clone(),
    ));
    let registry = Arc::new(
        DriverRegistry::builder()
            .register(Arc::new(StackDriver::kubernetes(engine.clone(), "corral-")))
            .register(Arc::new(StackDriver::swarm(engine.clone(), "corral-")))
            .build()
            .unwrap(),
    );

    let ctx = Arc::new(
        Ctx::builder()
            .store(store)
            .registry(registry)
            .trust(trust)
            .network(network.clone())
            .loadbalancer(loadbalancers.clone())
            .notifier(notifier.clone())
            .config(config)
            .conductor_id("test-host:0001")
            .build(),
    );

    Harness {
        conductor: Conductor::new(ctx.clone()),
        ctx,
        engine,
        identity,
        loadbalancers,
        network,
        notifier,
    }
}

fn harness() -> Harness {
    harness_with(1, |_| {})
}

fn tenant() -> RequestContext {
    RequestContext::new("p1", "u1")
}

fn create_request(name: &str, template_uuid: &str) -> ClusterCreateRequest {
    ClusterCreateRequest {
        name: name.to_string(),
        cluster_template_id: template_uuid.to_string(),
        node_count: 1,
        master_count: 1,
        create_timeout_minutes: None,
        labels: Default::default(),
        keypair: Some("kp1".to_string()),
        flavor_id: None,
        master_flavor_id: None,
        docker_volume_size: None,
        fixed_network: None,
        fixed_subnet: None,
        floating_ip_enabled: None,
        master_lb_enabled: None,
    }
}

fn seed_template(harness: &Harness, name: &str) -> String {
    let mut template = corral_store::ClusterTemplate::new(
        name,
        "p1",
        "u1",
        "fcos-1",
        "fedora-coreos",
        Coe::Kubernetes,
    );
    template.flavor = Some("m1.small".to_string());
    template.external_network = Some("public".to_string());
    template.keypair = Some("kp1".to_string());
    harness.ctx.store.create_cluster_template(&template).unwrap();
    template.uuid
}

async fn wait_for_status(harness: &Harness, uuid: &str, wanted: ClusterStatus) -> Cluster {
    let admin = RequestContext::admin();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let cluster = harness.ctx.store.get_cluster_by_uuid(&admin, uuid).unwrap();
        if cluster.status == wanted {
            return cluster;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster {} stuck in {} waiting for {}",
            uuid,
            cluster.status,
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_gone(harness: &Harness, uuid: &str) {
    let admin = RequestContext::admin();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match harness.ctx.store.get_cluster_by_uuid(&admin, uuid) {
            Err(e) if e.kind() == "NotFound" => return,
            Err(e) => panic!("unexpected error: {}", e),
            Ok(cluster) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "cluster {} still present in {}",
                    uuid,
                    cluster.status
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn create_complete_cluster(harness: &Harness, name: &str) -> Cluster {
    let template = seed_template(harness, &format!("{}-template", name));
    let cluster = harness
        .conductor
        .cluster_create(&tenant(), create_request(name, &template))
        .await
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::CreateInProgress);
    wait_for_status(harness, &cluster.uuid, ClusterStatus::CreateComplete).await
}

#[tokio::test]
async fn create_kubernetes_cluster_converges() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    assert!(cluster.api_address.is_some());
    assert!(cluster.coe_version.is_some());
    assert!(cluster.stack_id.is_some());
    assert!(cluster.trustee_user_id.is_some());
    assert!(cluster.trust_id.is_some());
    assert!(cluster.ca_cert_ref.is_some());
    assert!(cluster.etcd_ca_cert_ref.is_some());

    // Exactly the two default node groups, both converged
    let (master, worker) = harness.ctx.store.default_nodegroups(&cluster.uuid).unwrap();
    assert_eq!(master.role, NodeGroupRole::Master);
    assert_eq!(worker.role, NodeGroupRole::Worker);
    assert_eq!(master.status, ClusterStatus::CreateComplete);
    assert_eq!(worker.status, ClusterStatus::CreateComplete);
    assert_eq!(worker.node_addresses.len(), 1);

    // One trustee user and trust were minted
    assert_eq!(harness.identity.user_count(), 1);
    assert_eq!(harness.identity.trust_count(), 1);

    // Audit trail: pending then success
    let sequence = harness.notifier.sequence();
    assert!(sequence.contains(&(events::CLUSTER_CREATE.to_string(), Outcome::Pending)));
    assert!(sequence.contains(&(events::CLUSTER_CREATE.to_string(), Outcome::Success)));
}

#[tokio::test]
async fn duplicate_cluster_name_rejected() {
    let harness = harness();
    let template = seed_template(&harness, "kT");
    harness
        .conductor
        .cluster_create(&tenant(), create_request("same-name", &template))
        .await
        .unwrap();
    let err = harness
        .conductor
        .cluster_create(&tenant(), create_request("same-name", &template))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");
    // The duplicate never minted credentials
    assert_eq!(harness.identity.user_count(), 1);
}

#[tokio::test]
async fn resize_scales_default_worker_group() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    let resized = harness
        .conductor
        .cluster_resize(
            &tenant(),
            &cluster.uuid,
            ResizeRequest {
                node_count: 3,
                nodes_to_remove: vec![],
                nodegroup: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(resized.status, ClusterStatus::UpdateInProgress);

    let done = wait_for_status(&harness, &cluster.uuid, ClusterStatus::UpdateComplete).await;
    assert_eq!(done.status, ClusterStatus::UpdateComplete);

    let (_, worker) = harness.ctx.store.default_nodegroups(&cluster.uuid).unwrap();
    assert_eq!(worker.node_count, 3);
    assert_eq!(worker.node_addresses.len(), 3);
    assert_eq!(worker.status, ClusterStatus::UpdateComplete);
}

#[tokio::test]
async fn resize_respects_nodegroup_bounds() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    // Default worker group has no max; set one through the store to
    // exercise the bound.
    let (_, mut worker) = harness.ctx.store.default_nodegroups(&cluster.uuid).unwrap();
    worker.max_node_count = Some(2);
    harness
        .ctx
        .store
        .update_nodegroup(&worker.uuid.clone(), &worker)
        .unwrap();

    let err = harness
        .conductor
        .cluster_resize(
            &tenant(),
            &cluster.uuid,
            ResizeRequest {
                node_count: 5,
                nodes_to_remove: vec![],
                nodegroup: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidParameter");

    // Cluster state untouched
    let admin = RequestContext::admin();
    let unchanged = harness
        .ctx
        .store
        .get_cluster_by_uuid(&admin, &cluster.uuid)
        .unwrap();
    assert_eq!(unchanged.status, ClusterStatus::CreateComplete);
}

#[tokio::test]
async fn resize_rejected_while_in_progress() {
    // Engine needs many polls to converge, leaving the cluster
    // in CREATE_IN_PROGRESS while we try to resize it.
    let harness = harness_with(50_000, |config| {
        config.cluster_heat.wait_interval_secs = 1;
    });
    let template = seed_template(&harness, "kT");
    let cluster = harness
        .conductor
        .cluster_create(&tenant(), create_request("k1", &template))
        .await
        .unwrap();

    let err = harness
        .conductor
        .cluster_resize(
            &tenant(),
            &cluster.uuid,
            ResizeRequest {
                node_count: 3,
                nodes_to_remove: vec![],
                nodegroup: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotSupported");
}

#[tokio::test]
async fn update_rejects_immutable_fields() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    let err = harness
        .conductor
        .cluster_update(
            &tenant(),
            &cluster.uuid,
            ClusterUpdate {
                api_address: Some("https://hijack:6443".to_string()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidParameter");
}

#[tokio::test]
async fn update_node_count_flows_through_resize() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    harness
        .conductor
        .cluster_update(
            &tenant(),
            &cluster.uuid,
            ClusterUpdate {
                node_count: Some(2),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
    wait_for_status(&harness, &cluster.uuid, ClusterStatus::UpdateComplete).await;
    let (_, worker) = harness.ctx.store.default_nodegroups(&cluster.uuid).unwrap();
    assert_eq!(worker.node_count, 2);
}

#[tokio::test]
async fn delete_reclaims_load_balancers_and_floating_ips() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;
    let marker = cluster_resource_marker(&cluster.uuid);

    harness.loadbalancers.seed(
        format!("api lb {}", marker),
        ProvisioningStatus::Active,
        Some("port-1".to_string()),
    );
    harness.loadbalancers.seed(
        format!("ingress lb {}", marker),
        ProvisioningStatus::Active,
        Some("port-2".to_string()),
    );
    harness
        .network
        .seed_floatingip("198.51.100.7", Some("port-1".to_string()), format!("vip {}", marker));

    let admin = RequestContext::admin();
    let keypairs_before = harness
        .ctx
        .store
        .list_x509keypairs(
            &admin,
            &X509Filters {
                cluster_uuid: Some(cluster.uuid.clone()),
                ..Default::default()
            },
            &Default::default(),
        )
        .unwrap();
    assert_eq!(keypairs_before.len(), 4);

    harness
        .conductor
        .cluster_delete(&tenant(), &cluster.uuid)
        .await
        .unwrap();
    wait_until_gone(&harness, &cluster.uuid).await;

    // Both balancers cascade-deleted, the marked floating IP released
    assert_eq!(harness.loadbalancers.deleted_ids().len(), 2);
    assert_eq!(harness.network.remaining_floatingips(), 0);

    // Credentials and certs are gone with the cluster
    assert_eq!(harness.identity.user_count(), 0);
    assert_eq!(harness.identity.trust_count(), 0);
    let keypairs_after = harness
        .ctx
        .store
        .list_x509keypairs(
            &admin,
            &X509Filters {
                cluster_uuid: Some(cluster.uuid.clone()),
                ..Default::default()
            },
            &Default::default(),
        )
        .unwrap();
    assert!(keypairs_after.is_empty());

    // Engine stack destroyed too
    assert_eq!(harness.engine.stack_count(), 0);

    // The delayed delete success landed on the audit trail
    let sequence = harness.notifier.sequence();
    assert!(sequence.contains(&(events::CLUSTER_DELETE.to_string(), Outcome::Pending)));
    assert!(sequence.contains(&(events::CLUSTER_DELETE.to_string(), Outcome::Success)));
}

#[tokio::test]
async fn delete_blocked_by_transitional_load_balancer() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;
    let marker = cluster_resource_marker(&cluster.uuid);
    harness.loadbalancers.seed(
        format!("api lb {}", marker),
        ProvisioningStatus::PendingUpdate,
        None,
    );
    let stacks_before = harness.engine.stack_count();

    let err = harness
        .conductor
        .cluster_delete(&tenant(), &cluster.uuid)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PreDeletionFailed");

    // No driver call was made and the cluster kept its prior status
    assert_eq!(harness.engine.stack_count(), stacks_before);
    let admin = RequestContext::admin();
    let unchanged = harness
        .ctx
        .store
        .get_cluster_by_uuid(&admin, &cluster.uuid)
        .unwrap();
    assert_eq!(unchanged.status, ClusterStatus::CreateComplete);

    // The user can retry once the balancer settles
    let sequence = harness.notifier.sequence();
    assert!(sequence.contains(&(events::CLUSTER_DELETE.to_string(), Outcome::Failure)));
}

#[tokio::test]
async fn quota_rejects_third_cluster_before_trustee_work() {
    let harness = harness();
    harness
        .ctx
        .store
        .create_quota(&Quota {
            project_id: "p1".to_string(),
            resource: "Cluster".to_string(),
            hard_limit: 2,
            created_at: chrono::Utc::now(),
        })
        .unwrap();

    create_complete_cluster(&harness, "k1").await;
    create_complete_cluster(&harness, "k2").await;
    assert_eq!(harness.identity.user_count(), 2);

    let template = seed_template(&harness, "kT3");
    let err = harness
        .conductor
        .cluster_create(&tenant(), create_request("k3", &template))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "QuotaExceeded");
    // No trustee was created for the rejected cluster
    assert_eq!(harness.identity.user_count(), 2);
}

#[tokio::test]
async fn concurrent_deletes_are_idempotent() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    let conductor_a = Conductor::new(harness.ctx.clone());
    let conductor_b = Conductor::new(harness.ctx.clone());
    let uuid_a = cluster.uuid.clone();
    let uuid_b = cluster.uuid.clone();

    let (result_a, result_b) = tokio::join!(
        async move { conductor_a.cluster_delete(&tenant(), &uuid_a).await },
        async move { conductor_b.cluster_delete(&tenant(), &uuid_b).await },
    );

    // Each call either succeeds or reports the in-flight operation
    for result in [result_a, result_b] {
        match result {
            Ok(()) => {}
            Err(e) => assert_eq!(e.kind(), "OperationInProgress"),
        }
    }

    wait_until_gone(&harness, &cluster.uuid).await;
    assert_eq!(harness.identity.user_count(), 0);
}

#[tokio::test]
async fn engine_failure_surfaces_in_status_reason() {
    let harness = harness();
    let template = seed_template(&harness, "kT");
    *harness.engine.fail_next_operation.lock().unwrap() =
        Some("no valid host was found".to_string());

    let cluster = harness
        .conductor
        .cluster_create(&tenant(), create_request("k1", &template))
        .await
        .unwrap();

    let failed = wait_for_status(&harness, &cluster.uuid, ClusterStatus::CreateFailed).await;
    assert_eq!(
        failed.status_reason.as_deref(),
        Some("no valid host was found")
    );
    // Failed clusters can still be deleted
    harness
        .conductor
        .cluster_delete(&tenant(), &cluster.uuid)
        .await
        .unwrap();
    wait_until_gone(&harness, &cluster.uuid).await;
}

#[tokio::test]
async fn poll_budget_exhaustion_fails_with_timeout() {
    let harness = harness_with(50_000, |config| {
        config.cluster_heat.max_attempts = 3;
    });
    let template = seed_template(&harness, "kT");
    let cluster = harness
        .conductor
        .cluster_create(&tenant(), create_request("k1", &template))
        .await
        .unwrap();

    let failed = wait_for_status(&harness, &cluster.uuid, ClusterStatus::CreateFailed).await;
    assert_eq!(failed.status_reason.as_deref(), Some("timeout"));

    let (_, worker) = harness.ctx.store.default_nodegroups(&cluster.uuid).unwrap();
    assert_eq!(worker.status, ClusterStatus::CreateFailed);
}

#[tokio::test]
async fn nodegroup_lifecycle_with_own_stack() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    let nodegroup = harness
        .conductor
        .nodegroup_create(
            &tenant(),
            &cluster.uuid,
            NodeGroupCreateRequest {
                name: "gpu-pool".to_string(),
                node_count: 2,
                min_node_count: Some(1),
                max_node_count: Some(4),
                flavor_id: Some("g1.large".to_string()),
                image_id: None,
                labels: Default::default(),
                role: None,
            },
        )
        .await
        .unwrap();

    wait_for_status(&harness, &cluster.uuid, ClusterStatus::UpdateComplete).await;
    let converged = harness
        .ctx
        .store
        .get_nodegroup(&cluster.uuid, &nodegroup.uuid)
        .unwrap();
    assert_eq!(converged.status, ClusterStatus::CreateComplete);
    assert_ne!(converged.stack_id, cluster.stack_id);

    // Default groups cannot be deleted directly
    let (_, worker) = harness.ctx.store.default_nodegroups(&cluster.uuid).unwrap();
    let err = harness
        .conductor
        .nodegroup_delete(&tenant(), &cluster.uuid, &worker.uuid)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotSupported");

    // The extra group can
    harness
        .conductor
        .nodegroup_delete(&tenant(), &cluster.uuid, &nodegroup.uuid)
        .await
        .unwrap();
    wait_for_status(&harness, &cluster.uuid, ClusterStatus::UpdateComplete).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match harness.ctx.store.get_nodegroup(&cluster.uuid, &nodegroup.uuid) {
            Err(e) if e.kind() == "NotFound" => break,
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => {
                assert!(tokio::time::Instant::now() < deadline, "node group not deleted");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let nodegroups = harness
        .ctx
        .store
        .list_nodegroups(&cluster.uuid, &NodeGroupFilters::default(), &Default::default())
        .unwrap();
    assert_eq!(nodegroups.len(), 2);
}

#[tokio::test]
async fn certificate_signing_round_trip() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    let key = rcgen::KeyPair::generate().unwrap();
    let csr = rcgen::CertificateParams::default()
        .serialize_request(&key)
        .unwrap()
        .pem()
        .unwrap();

    let signed = harness
        .conductor
        .sign_certificate(&tenant(), &cluster.uuid, &csr, Some(30))
        .await
        .unwrap();
    assert_eq!(signed.cluster_uuid, cluster.uuid);

    let ca_pem = harness
        .conductor
        .get_ca_certificate(&tenant(), &cluster.uuid, None)
        .await
        .unwrap();
    assert!(corral_trust::pki::verify_signed_by(&signed.pem, &ca_pem).unwrap());

    // The other tenant cannot use this cluster's CA
    let stranger = RequestContext::new("p2", "u2");
    let err = harness
        .conductor
        .sign_certificate(&stranger, &cluster.uuid, &csr, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");
}

#[tokio::test]
async fn tenants_cannot_see_each_other() {
    let harness = harness();
    let cluster = create_complete_cluster(&harness, "k1").await;

    let stranger = RequestContext::new("p2", "u2");
    let err = harness
        .conductor
        .cluster_delete(&stranger, &cluster.uuid)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    // Still there for the owner
    let admin = RequestContext::admin();
    assert!(harness
        .ctx
        .store
        .get_cluster_by_uuid(&admin, &cluster.uuid)
        .is_ok());
}
