//! Integration tests for the step protocol.
//!
//! These tests start a real hub on a local port, connect real endpoints
//! sharing one writer store, and follow the store file from the hub side.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use stepwise_store::{ColumnKind, ColumnSpec, Record, Store, StoreConfig, Value};
use stepwise_sync::{
    ApplyOutcome, EndpointConfig, HubConfig, HubReport, RenderStatus, SharedStore, StepFrame, StopPolicy,
    SyncEndpoint, SyncError, SyncHub,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Bind a hub for `n_clients` on a free port, return it with its address.
async fn start_hub(n_clients: usize, stop_policy: StopPolicy) -> (SyncHub, String) {
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let config = HubConfig {
        bind_addr: addr.clone(),
        n_clients,
        queue_capacity: 8,
        stop_policy,
    };
    (SyncHub::bind(config).await.unwrap(), addr)
}

fn shared_store(dir: &std::path::Path) -> (SharedStore, StoreConfig) {
    let store = Store::new(dir, "sync", false).unwrap();
    let config = store.config().clone();
    (Arc::new(Mutex::new(store)), config)
}

fn columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("alpha", ColumnKind::Float),
        ColumnSpec::new("positions", ColumnKind::Array),
    ]
}

/// What the viewer saw, flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
struct Seen {
    client: i32,
    step: i64,
    objects: Vec<(String, bool, Option<Value>)>,
}

fn record(frames: &mut Vec<Seen>, frame: &StepFrame) {
    frames.push(Seen {
        client: frame.client.unwrap_or(-1),
        step: frame.step,
        objects: frame
            .objects
            .iter()
            .map(|o| (o.name.table_name(), o.created, o.row.get("alpha").cloned()))
            .collect(),
    });
}

async fn serve<F>(hub: &mut SyncHub, follower: &mut Store, mut applier: F) -> HubReport
where
    F: FnMut(&StepFrame) -> ApplyOutcome,
{
    timeout(Duration::from_secs(5), hub.accept())
        .await
        .expect("clients should register")
        .unwrap();
    timeout(Duration::from_secs(10), hub.run(follower, &mut applier))
        .await
        .expect("hub should stop")
        .unwrap()
}

#[tokio::test]
async fn test_two_producers_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let (store, config) = shared_store(dir.path());
    let (mut hub, addr) = start_hub(2, StopPolicy::AllClientsDone).await;

    let mut producers = Vec::new();
    for client in [1, 0] {
        let mut endpoint = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, client));
        producers.push(tokio::spawn(async move {
            endpoint.connect().await.unwrap();
            let base = client as f64 * 10.0;
            endpoint
                .add_object("Mesh", &columns(), Record::new().with("alpha", base + 1.0))
                .await
                .unwrap();
            assert_eq!(endpoint.render().await.unwrap(), RenderStatus::Acknowledged);
            for step in 2..=3 {
                endpoint
                    .update_object("Mesh", 0, Record::new().with("alpha", base + step as f64))
                    .await
                    .unwrap();
                assert_eq!(endpoint.render().await.unwrap(), RenderStatus::Acknowledged);
            }
            endpoint.close().await.unwrap();
            endpoint.step()
        }));
    }

    let mut follower = Store::open_read_only(config).unwrap();
    let mut frames = Vec::new();
    let report = serve(&mut hub, &mut follower, |frame| {
        record(&mut frames, frame);
        ApplyOutcome::Continue
    })
    .await;

    for producer in producers {
        assert_eq!(producer.await.unwrap(), 3);
    }
    let mut exited = report.exited.clone();
    exited.sort();
    assert_eq!(exited, vec![0, 1]);
    assert!(report.lost.is_empty());
    assert_eq!(report.steps_applied, 6);

    // Each client's steps arrive in order and show exactly what was written
    // before the step was sent.
    for client in [0, 1] {
        let mine: Vec<&Seen> = frames.iter().filter(|f| f.client == client).collect();
        let steps: Vec<i64> = mine.iter().map(|f| f.step).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        for seen in mine {
            let table = format!("Mesh_{client}_0");
            let expected = client as f64 * 10.0 + seen.step as f64;
            assert_eq!(
                seen.objects,
                vec![(table, seen.step == 1, Some(Value::Float(expected)))]
            );
        }
    }
}

#[tokio::test]
async fn test_untouched_objects_get_empty_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (store, config) = shared_store(dir.path());
    let (mut hub, addr) = start_hub(1, StopPolicy::AllClientsDone).await;
    const RENDERS: usize = 6;

    let mut endpoint = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, 0));
    let producer = tokio::spawn(async move {
        endpoint.connect().await.unwrap();
        endpoint
            .add_object("Mesh", &columns(), Record::new().with("alpha", 0.0))
            .await
            .unwrap();
        endpoint.add_object("Points", &columns(), Record::new()).await.unwrap();
        for step in 1..=RENDERS {
            endpoint.render().await.unwrap();
            if step == RENDERS {
                break;
            }
            endpoint
                .update_object("Mesh", 0, Record::new().with("alpha", step as f64))
                .await
                .unwrap();
            // Open row is step + 1: touch Points on steps 2 and 3 only.
            if step == 1 || step == 2 {
                endpoint
                    .update_object("Points", 1, Record::new().with("alpha", 0.5))
                    .await
                    .unwrap();
            }
        }
        endpoint.close().await.unwrap();
    });

    let mut follower = Store::open_read_only(config).unwrap();
    let mut frames = Vec::new();
    serve(&mut hub, &mut follower, |frame| {
        record(&mut frames, frame);
        ApplyOutcome::Continue
    })
    .await;
    producer.await.unwrap();

    let points_steps: Vec<i64> = frames
        .iter()
        .filter(|f| f.objects.iter().any(|(t, _, _)| t == "Points_0_1"))
        .map(|f| f.step)
        .collect();
    assert_eq!(points_steps, vec![2, 3]);

    let writer = store.lock().await;
    assert_eq!(writer.count("Points_0_1").unwrap(), RENDERS);
    assert_eq!(writer.count("Mesh_0_0").unwrap(), RENDERS);
    for step in 1..=RENDERS as i64 {
        let row = writer.row_at("Points_0_1", step).unwrap().unwrap();
        let empty = row.without_nulls().is_empty();
        assert_eq!(empty, !(step == 2 || step == 3), "row {step}");
    }
}

#[tokio::test]
async fn test_viewer_quit_sends_exit() {
    let dir = tempfile::tempdir().unwrap();
    let (store, config) = shared_store(dir.path());
    let (mut hub, addr) = start_hub(1, StopPolicy::AllClientsDone).await;

    let mut endpoint = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, 0));
    let producer = tokio::spawn(async move {
        endpoint.connect().await.unwrap();
        endpoint
            .add_object("Mesh", &columns(), Record::new().with("alpha", 1.0))
            .await
            .unwrap();
        assert_eq!(endpoint.render().await.unwrap(), RenderStatus::Acknowledged);
        assert_eq!(endpoint.render().await.unwrap(), RenderStatus::ConsumerExited);
        let rows = endpoint.store().lock().await.count("Mesh_0_0").unwrap();
        assert_eq!((endpoint.step(), rows), (2, 2));

        // After exit, rendering neither pads rows nor advances the step.
        let err = endpoint.render().await.unwrap_err();
        assert!(matches!(err, SyncError::Closed));
        let rows = endpoint.store().lock().await.count("Mesh_0_0").unwrap();
        assert_eq!((endpoint.step(), rows), (2, 2));
    });

    let mut follower = Store::open_read_only(config).unwrap();
    let report = serve(&mut hub, &mut follower, |frame| {
        if frame.step == 2 {
            ApplyOutcome::Quit
        } else {
            ApplyOutcome::Continue
        }
    })
    .await;
    producer.await.unwrap();

    assert!(report.viewer_quit);
    assert_eq!(report.steps_applied, 2);
}

#[tokio::test]
async fn test_lost_client_does_not_stop_others() {
    let dir = tempfile::tempdir().unwrap();
    let (store, config) = shared_store(dir.path());
    let (mut hub, addr) = start_hub(2, StopPolicy::AllClientsDone).await;

    let mut steady = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, 0));
    let steady_task = tokio::spawn(async move {
        steady.connect().await.unwrap();
        steady
            .add_object("Mesh", &columns(), Record::new().with("alpha", 1.0))
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(steady.render().await.unwrap(), RenderStatus::Acknowledged);
        }
        steady.close().await.unwrap();
    });

    let mut flaky = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, 1));
    let flaky_task = tokio::spawn(async move {
        flaky.connect().await.unwrap();
        flaky
            .add_object("Points", &columns(), Record::new().with("alpha", 1.0))
            .await
            .unwrap();
        flaky.render().await.unwrap();
        // Dropped without close: the hub sees the connection vanish.
    });

    let mut follower = Store::open_read_only(config).unwrap();
    let report = serve(&mut hub, &mut follower, |_| ApplyOutcome::Continue).await;
    steady_task.await.unwrap();
    flaky_task.await.unwrap();

    assert_eq!(report.exited, vec![0]);
    assert_eq!(report.lost, vec![1]);
    assert_eq!(report.steps_applied, 4);
}

#[tokio::test]
async fn test_first_client_done_stops_everyone() {
    let dir = tempfile::tempdir().unwrap();
    let (store, config) = shared_store(dir.path());
    let (mut hub, addr) = start_hub(2, StopPolicy::FirstClientDone).await;

    let mut quitter = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, 0));
    let quitter_task = tokio::spawn(async move {
        quitter.connect().await.unwrap();
        quitter.render().await.unwrap();
        quitter.close().await.unwrap();
    });

    let mut runner = SyncEndpoint::new(store.clone(), EndpointConfig::for_testing(&addr, 1));
    let runner_task = tokio::spawn(async move {
        runner.connect().await.unwrap();
        for _ in 0..1000 {
            match runner.render().await {
                Ok(RenderStatus::Acknowledged) => continue,
                other => return other,
            }
        }
        Ok(RenderStatus::Acknowledged)
    });

    let mut follower = Store::open_read_only(config).unwrap();
    let report = serve(&mut hub, &mut follower, |_| ApplyOutcome::Continue).await;
    quitter_task.await.unwrap();

    // A step written after the hub hung up may be answered by a reset
    // instead of the queued exit.
    match runner_task.await.unwrap() {
        Ok(status) => assert_eq!(status, RenderStatus::ConsumerExited),
        Err(e) => assert!(matches!(e, SyncError::ConnectionLost(_)), "{e}"),
    }
    assert_eq!(report.exited, vec![0]);
}
