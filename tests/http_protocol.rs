//! Keeper protocol and operator API over HTTP

use autofailover::common::config::MonitorConfig;
use autofailover::common::fsm::NodeState;
use autofailover::common::protocol::{NodeSettings, RegisterRequest, ReportRequest};
use autofailover::keeper::{HttpMonitorClient, MonitorApi};
use autofailover::{Error, Monitor};
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    _dir: TempDir,
    url: String,
    client: HttpMonitorClient,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<autofailover::Result<()>>,
}

async fn start_monitor() -> Running {
    let dir = tempdir().unwrap();
    let config = MonitorConfig {
        db_path: dir.path().join("monitor"),
        ..Default::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(Monitor::new(config).serve_on(listener, async move {
        let _ = stopped.await;
    }));

    let client = HttpMonitorClient::new(url.clone(), Duration::from_secs(5)).unwrap();
    Running {
        _dir: dir,
        url,
        client,
        stop,
        handle,
    }
}

fn register_request(name: &str, priority: u8) -> RegisterRequest {
    RegisterRequest {
        formation: "default".into(),
        name: name.into(),
        host: format!("{}.db.local", name),
        port: 5432,
        group_id: None,
        candidate_priority: priority,
        replication_quorum: true,
    }
}

fn report(node_id: u64, version: u64, state: NodeState) -> ReportRequest {
    ReportRequest {
        node_id,
        report_version: version,
        current_state: state,
        progress: 0,
        timestamp: 0,
        connected_standbys: 0,
        last_error: None,
        applied_membership: 0,
        applied_quorum_version: 0,
    }
}

#[tokio::test]
async fn test_register_and_report_round_trip() {
    let monitor = start_monitor().await;
    let client = &monitor.client;

    let first = client.register(register_request("node_a", 50)).await.unwrap();
    assert_eq!(first.goal_state, NodeState::Single);
    assert_eq!(first.group_id, 0);

    // registering again under the same name is idempotent
    let again = client.register(register_request("node_a", 50)).await.unwrap();
    assert_eq!(again.node_id, first.node_id);

    let response = client
        .report(report(first.node_id, 1, NodeState::Single))
        .await
        .unwrap();
    assert_eq!(response.goal_state, NodeState::Single);
    assert!(response.upstream.is_none());

    let second = client.register(register_request("node_b", 50)).await.unwrap();
    assert_eq!(second.goal_state, NodeState::WaitStandby);

    let response = client
        .report(report(first.node_id, 2, NodeState::Single))
        .await
        .unwrap();
    assert_eq!(response.goal_state, NodeState::WaitPrimary);
    assert_eq!(response.standbys.len(), 1);
    assert_eq!(response.standbys[0].name, "node_b");

    let response = client
        .report(report(second.node_id, 1, NodeState::WaitStandby))
        .await
        .unwrap();
    assert_eq!(response.upstream.map(|u| u.name), Some("node_a".to_string()));

    let _ = monitor.stop.send(());
    monitor.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stale_report_is_not_applied() {
    let monitor = start_monitor().await;
    let client = &monitor.client;
    let node = client.register(register_request("node_a", 50)).await.unwrap();

    client
        .report(report(node.node_id, 5, NodeState::Single))
        .await
        .unwrap();
    // delayed duplicate of an older report
    let response = client
        .report(report(node.node_id, 4, NodeState::Init))
        .await
        .unwrap();
    assert_eq!(response.goal_state, NodeState::Single);

    let state = client.formation_state("default").await.unwrap();
    let recorded = &state.groups[0].nodes[0];
    assert_eq!(recorded.current_state, NodeState::Single);

    let _ = monitor.stop.send(());
}

#[tokio::test]
async fn test_errors_keep_their_kind() {
    let monitor = start_monitor().await;
    let client = &monitor.client;

    let err = client.report(report(999, 1, NodeState::Init)).await.unwrap_err();
    assert!(matches!(err, Error::NodeNotFound(999)));

    let err = client.register(register_request("bad name!", 50)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSetting(_)));

    let err = client.register(register_request("node_a", 101)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSetting(_)));

    let mut elsewhere = register_request("node_a", 50);
    elsewhere.formation = "missing".into();
    let err = client.register(elsewhere).await.unwrap_err();
    assert!(matches!(err, Error::FormationNotFound(_)));

    // no node in group 0 yet
    let err = client.switchover("default", 0).await.unwrap_err();
    assert!(matches!(err, Error::Other(_)));
    assert!(!err.is_retryable());

    let _ = monitor.stop.send(());
}

#[tokio::test]
async fn test_operator_calls() {
    let monitor = start_monitor().await;
    let client = &monitor.client;

    client.create_formation("analytics").await.unwrap();
    let err = client.create_formation("analytics").await.unwrap_err();
    assert!(matches!(err, Error::FormationExists(_)));
    let mut formations = client.list_formations().await.unwrap();
    formations.sort();
    assert_eq!(formations, vec!["analytics".to_string(), "default".to_string()]);

    let mut req = register_request("node_x", 50);
    req.formation = "analytics".into();
    let node = client.register(req).await.unwrap();

    let err = client.drop_formation("analytics").await.unwrap_err();
    assert!(matches!(err, Error::FormationNotEmpty(_)));

    let status = client
        .set_node_settings(
            node.node_id,
            &NodeSettings {
                candidate_priority: Some(0),
                replication_quorum: Some(false),
            },
        )
        .await
        .unwrap();
    assert_eq!(status.candidate_priority, 0);
    assert!(!status.replication_quorum);

    let events = client.events("analytics", 10).await.unwrap();
    assert!(events.iter().any(|e| e.description.contains("candidate priority set to 0")));

    let names = client.standby_names("analytics", 0).await.unwrap();
    assert!(names.quorum.standbys.is_empty());

    client.drop_node(node.node_id).await.unwrap();
    let err = client.drop_node(node.node_id).await.unwrap_err();
    assert!(matches!(err, Error::NodeNotFound(_)));
    client.drop_formation("analytics").await.unwrap();

    let _ = monitor.stop.send(());
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let monitor = start_monitor().await;
    let http = reqwest::Client::new();

    let live = http
        .get(format!("{}/health/live", monitor.url))
        .send()
        .await
        .unwrap();
    assert!(live.status().is_success());

    let ready: serde_json::Value = http
        .get(format!("{}/health/ready", monitor.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["ready"], true);

    monitor
        .client
        .register(register_request("node_a", 50))
        .await
        .unwrap();
    let metrics = http
        .get(format!("{}/metrics", monitor.url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("autofailover_"));

    let _ = monitor.stop.send(());
}
