//! Integration tests for FLApp CRD operations
//!
//! These tests tell the story of how users submit and manage FLApp resources
//! through the Kubernetes API, before any operator acts on them.

use kube::api::{Api, DeleteParams, ListParams, PostParams};

use flapp_operator::crd::{FLApp, ReplicaType};

use super::helpers::{cleanup_flapp, ensure_test_cluster, sample_flapp, TEST_NAMESPACE};

/// Story: a user submits a training job and reads it back unchanged
///
/// The API server stores the replica groups as submitted.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_submits_flapp_and_reads_it_back() {
    let client = ensure_test_cluster().await.unwrap();
    let api: Api<FLApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-submit";
    cleanup_flapp(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_flapp(name, 2))
        .await
        .unwrap();
    assert_eq!(created.metadata.name.as_deref(), Some(name));

    let fetched = api.get(name).await.unwrap();
    let groups = fetched.spec.replica_groups();
    assert_eq!(groups[&ReplicaType::worker()].replicas, 2);
    assert_eq!(groups[&ReplicaType::ps()].replicas, 1);

    cleanup_flapp(&client, name).await;
}

/// Story: custom replica types travel through the API under flReplicaSpecs
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_custom_replica_groups_are_preserved() {
    let client = ensure_test_cluster().await.unwrap();
    let api: Api<FLApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-custom-groups";
    cleanup_flapp(&client, name).await;

    let mut app = sample_flapp(name, 1);
    app.spec.fl_replica_specs.insert(
        ReplicaType::new("evaluator"),
        super::helpers::replica_spec(3),
    );
    api.create(&PostParams::default(), &app).await.unwrap();

    let fetched = api.get(name).await.unwrap();
    assert!(fetched.spec.validate().is_ok());
    assert_eq!(
        fetched.spec.replica_groups()[&ReplicaType::new("evaluator")].replicas,
        3
    );

    cleanup_flapp(&client, name).await;
}

/// Story: FLApps are listed and deleted like any other namespaced resource
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_flapps_are_listed_and_deleted() {
    let client = ensure_test_cluster().await.unwrap();
    let api: Api<FLApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let names = ["crd-list-a", "crd-list-b"];
    for name in names {
        cleanup_flapp(&client, name).await;
        api.create(&PostParams::default(), &sample_flapp(name, 1))
            .await
            .unwrap();
    }

    let listed: Vec<String> = api
        .list(&ListParams::default())
        .await
        .unwrap()
        .items
        .into_iter()
        .filter_map(|app| app.metadata.name)
        .collect();
    for name in names {
        assert!(listed.iter().any(|n| n == name), "{name} not listed");
    }

    for name in names {
        api.delete(name, &DeleteParams::default()).await.unwrap();
    }
}
