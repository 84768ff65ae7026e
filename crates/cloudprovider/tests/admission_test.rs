//! Admission flows through the dispatcher against an in-memory cluster

mod common;

use cloudprovider::plugins::alibabacloud::{SLB_IDS_PARAM, SLB_PLUGIN};
use cloudprovider::plugins::kubernetes::{CONTAINER_PORTS_PARAM, HOST_PORT_PLUGIN};
use cloudprovider::plugins::PORT_PROTOCOLS_PARAM;
use cloudprovider::{AdmissionOperation, DispatchOutcome, ErrorKind};
use cluster_client::MockClusterClient;
use common::{config, dispatcher, game_pod, pool};
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use network_api::{AllocationAnnotation, NetworkState, NetworkStatus};
use std::collections::HashSet;
use std::time::Duration;

fn host_port_pod(name: &str) -> Pod {
    let mut pod = game_pod(name, HOST_PORT_PLUGIN, &[(CONTAINER_PORTS_PARAM, "game:7777/UDP")]);
    pod.spec.as_mut().unwrap().node_name = Some("node-A".to_string());
    pod
}

fn slb_pod(name: &str) -> Pod {
    game_pod(
        name,
        SLB_PLUGIN,
        &[(SLB_IDS_PARAM, "lb-1"), (PORT_PROTOCOLS_PARAM, "7777/UDP")],
    )
}

fn state(pod: &Pod) -> NetworkState {
    NetworkStatus::from_pod(pod).unwrap().current_network_state
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_never_share_a_port() {
    let client = MockClusterClient::new();
    // eight pods, seven host ports
    let dispatcher = dispatcher(&client, &config(pool(30000, 30006), pool(500, 550))).await;

    let adds = (0..8).map(|i| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let pod = host_port_pod(&format!("gs-{}", i));
            dispatcher.dispatch(AdmissionOperation::Create, &pod).await
        })
    });
    let outcomes: Vec<DispatchOutcome> = join_all(adds)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let mut ports = HashSet::new();
    let mut exhausted = 0;
    for outcome in outcomes {
        match outcome {
            DispatchOutcome::Mutated(pod) => {
                let allocation = AllocationAnnotation::from_pod(&pod).unwrap();
                assert_eq!(allocation.ports.len(), 1);
                assert!(ports.insert(allocation.ports[0]), "port handed out twice");
            }
            DispatchOutcome::Failed(e) => {
                assert_eq!(e.kind(), ErrorKind::PortExhausted);
                exhausted += 1;
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(ports.len(), 7);
    assert_eq!(exhausted, 1);
    assert_eq!(client.events().len(), 1);
}

#[tokio::test]
async fn test_retried_add_gets_the_same_ports() {
    let client = MockClusterClient::new();
    let dispatcher = dispatcher(&client, &config(pool(30000, 30010), pool(500, 550))).await;
    let pod = host_port_pod("gs-0");

    let first = dispatcher
        .dispatch(AdmissionOperation::Create, &pod)
        .await
        .into_pod(pod.clone());
    let second = dispatcher
        .dispatch(AdmissionOperation::Create, &pod)
        .await
        .into_pod(pod);

    assert_eq!(
        AllocationAnnotation::from_pod(&first),
        AllocationAnnotation::from_pod(&second)
    );
}

#[tokio::test]
async fn test_slb_pod_converges_to_ready() {
    let client = MockClusterClient::new();
    let dispatcher = dispatcher(&client, &config(pool(30000, 30010), pool(500, 550))).await;

    let mut pod = dispatcher
        .dispatch(AdmissionOperation::Create, &slb_pod("gs-0"))
        .await
        .into_pod(slb_pod("gs-0"));
    assert_eq!(state(&pod), NetworkState::Waiting);

    pod.metadata.uid = Some("uid-1".to_string());
    pod.status = Some(PodStatus {
        pod_ip: Some("10.0.0.9".to_string()),
        ..Default::default()
    });
    client.add_pod(pod.clone());

    let mut seen = Vec::new();
    for pass in 0..3 {
        if pass == 2 {
            client.set_load_balancer_ingress("default", "gs-0", "47.100.1.1");
        }
        pod = dispatcher
            .dispatch(AdmissionOperation::Update, &pod)
            .await
            .into_pod(pod);
        seen.push(state(&pod));
    }
    assert_eq!(
        seen,
        vec![NetworkState::Waiting, NetworkState::Waiting, NetworkState::Ready]
    );

    // deletion while the pod still exists releases the listener
    let outcome = dispatcher.dispatch(AdmissionOperation::Delete, &pod).await;
    assert!(matches!(outcome, DispatchOutcome::Unchanged));
    assert!(client.service("default", "gs-0").is_none());
}

#[tokio::test]
async fn test_api_failure_leaves_pod_untouched() {
    let client = MockClusterClient::new();
    let dispatcher = dispatcher(&client, &config(pool(30000, 30010), pool(500, 550))).await;
    client.fail_operation("create_service");

    let pod = slb_pod("gs-0");
    let outcome = dispatcher.dispatch(AdmissionOperation::Create, &pod).await;
    assert!(matches!(&outcome, DispatchOutcome::Failed(e) if e.kind() == ErrorKind::ApiCallError));
    assert_eq!(outcome.into_pod(pod.clone()), pod);
    assert_eq!(client.events()[0].reason, "ApiCallError");

    // next attempt succeeds with the listener reserved by the failed one
    client.clear_failures();
    let admitted = dispatcher
        .dispatch(AdmissionOperation::Create, &pod)
        .await
        .into_pod(pod);
    assert_eq!(state(&admitted), NetworkState::Waiting);
    let svc = client.service("default", "gs-0").unwrap();
    assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 500);
}

#[tokio::test]
async fn test_dispatch_timeout_is_configurable() {
    let client = MockClusterClient::new();
    let dispatcher = dispatcher(&client, &config(pool(30000, 30010), pool(500, 550)))
        .await
        .with_timeout(Duration::from_secs(2));
    assert_eq!(dispatcher.timeout(), Duration::from_secs(2));

    let pod = host_port_pod("gs-0");
    let outcome = dispatcher.dispatch(AdmissionOperation::Create, &pod).await;
    assert!(matches!(outcome, DispatchOutcome::Mutated(_)));
}
