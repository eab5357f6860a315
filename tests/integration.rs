//! End-to-end tests for the mkv master over in-memory volumes

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use mkv::common::{key_to_path, route, MasterConfig};
use mkv::coordinator::http::create_router;
use mkv::coordinator::{
    dispatch, KeyState, ListPage, MemoryVolumes, MetadataStore, Op, Reply,
};
use mkv::{CoordState, Coordinator, Error};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

fn config() -> MasterConfig {
    MasterConfig {
        volumes: vec!["v1".into(), "v2".into(), "v3".into()],
        replicas: 2,
        subvolumes: 1,
        ..Default::default()
    }
}

fn cluster(config: MasterConfig) -> (CoordState, Arc<MemoryVolumes>) {
    let volumes = Arc::new(MemoryVolumes::new());
    let state = CoordState::new(config, MetadataStore::in_memory(), volumes.clone());
    (state, volumes)
}

async fn send(router: &Router, method: &str, uri: &str, body: &'static str) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .unwrap();
    router.clone().oneshot(request).await.unwrap()
}

#[tokio::test]
async fn test_scenario_put_then_get() {
    let (state, volumes) = cluster(config());
    let router = create_router(state.clone());

    let resp = send(&router, "PUT", "/hello", "world").await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let placed = route(b"/hello", &state.config.volumes, 2, 1);
    let record = state.metadata.get_record(b"/hello").unwrap();
    assert_eq!(record.state, KeyState::Active);
    assert_eq!(record.replicas, placed);

    let resp = send(&router, "GET", "/hello", "").await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    let location = resp.headers()[header::LOCATION].to_str().unwrap();
    assert!(placed
        .iter()
        .any(|v| location == format!("http://{}{}", v, key_to_path(b"/hello"))));

    for volume in &placed {
        assert!(volumes.contains(volume, &key_to_path(b"/hello")));
    }
}

#[tokio::test]
async fn test_scenario_delete_then_reput() {
    let (state, volumes) = cluster(config());
    let router = create_router(state.clone());

    assert_eq!(send(&router, "PUT", "/k", "one").await.status(), StatusCode::CREATED);
    assert_eq!(send(&router, "DELETE", "/k", "").await.status(), StatusCode::NO_CONTENT);
    assert_eq!(send(&router, "GET", "/k", "").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(volumes.object_count(), 0);
    assert_eq!(
        state.metadata.get_record(b"/k").unwrap().state,
        KeyState::HardDeleted
    );

    assert_eq!(send(&router, "PUT", "/k", "two").await.status(), StatusCode::CREATED);
    assert_eq!(send(&router, "HEAD", "/k", "").await.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn test_scenario_unlink_keeps_replicas() {
    let (state, volumes) = cluster(config());
    let router = create_router(state.clone());

    send(&router, "PUT", "/k", "v").await;
    assert_eq!(send(&router, "UNLINK", "/k", "").await.status(), StatusCode::NO_CONTENT);
    assert_eq!(send(&router, "GET", "/k", "").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(volumes.object_count(), 2);
    assert_eq!(
        send(&router, "REBALANCE", "/k", "").await.status(),
        StatusCode::NOT_FOUND
    );

    // an unlinked key can be written again
    assert_eq!(send(&router, "PUT", "/k", "v2").await.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_scenario_concurrent_put_and_delete() {
    let (state, volumes) = cluster(config());
    volumes.set_latency(Duration::from_millis(100));

    let (put, delete) = tokio::join!(
        dispatch(&state, b"/race", Op::Put(Bytes::from_static(b"v"))),
        dispatch(&state, b"/race", Op::Delete),
    );
    assert!(matches!(put, Ok(Reply::Created)));
    assert!(matches!(delete, Err(Error::Conflict(_))));

    let (delete, put) = tokio::join!(
        dispatch(&state, b"/race", Op::Delete),
        dispatch(&state, b"/race", Op::Put(Bytes::from_static(b"v"))),
    );
    assert!(matches!(delete, Ok(Reply::Done)));
    assert!(matches!(put, Err(Error::Conflict(_))));

    assert!(!state.locks.is_locked(b"/race"));
}

#[tokio::test]
async fn test_concurrent_reads_do_not_lock() {
    let (state, volumes) = cluster(config());
    dispatch(&state, b"/k", Op::Put(Bytes::from_static(b"v")))
        .await
        .unwrap();
    volumes.set_latency(Duration::from_millis(50));

    let (a, b) = tokio::join!(
        dispatch(&state, b"/k", Op::Get),
        dispatch(&state, b"/k", Op::Head),
    );
    assert!(matches!(a, Ok(Reply::Found(_))));
    assert!(matches!(b, Ok(Reply::Found(_))));
}

#[tokio::test]
async fn test_subvolume_layout() {
    let (state, volumes) = cluster(MasterConfig {
        subvolumes: 8,
        ..config()
    });
    let router = create_router(state.clone());

    send(&router, "PUT", "/hello", "world").await;
    let record = state.metadata.get_record(b"/hello").unwrap();
    for volume in &record.replicas {
        let (host, shard) = volume.split_once('/').unwrap();
        assert!(state.config.volumes.iter().any(|v| v == host));
        assert!(shard.starts_with("sv") && shard.len() == 4);
        assert!(volumes.contains(volume, &key_to_path(b"/hello")));
    }

    let resp = send(&router, "GET", "/hello", "").await;
    let location = resp.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.contains("/sv"));
}

#[tokio::test]
async fn test_listing_over_http() {
    let (state, _) = cluster(config());
    let router = create_router(state);

    for i in 0..7 {
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/photos/{}", i))
                    .body(Body::from("jpeg"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
    send(&router, "PUT", "/videos/0", "mp4").await;

    let mut seen = Vec::new();
    let mut next = String::new();
    loop {
        let uri = if next.is_empty() {
            "/photos/?list&limit=3".to_string()
        } else {
            format!("/photos/?list&limit=3&start={}", next)
        };
        let resp = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page: ListPage = serde_json::from_slice(&body).unwrap();
        seen.extend(page.keys);
        if page.next.is_empty() {
            break;
        }
        next = page.next;
    }

    let expected: Vec<String> = (0..7).map(|i| format!("/photos/{}", i)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_rocksdb_backed_state() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("indexdb");
    let volumes = Arc::new(MemoryVolumes::new());

    {
        let state = CoordState::new(config(), MetadataStore::open(&db).unwrap(), volumes.clone());
        dispatch(&state, b"/durable", Op::Put(Bytes::from_static(b"v")))
            .await
            .unwrap();
    }

    let state = CoordState::new(config(), MetadataStore::open(&db).unwrap(), volumes);
    let record = state.metadata.get_record(b"/durable").unwrap();
    assert!(record.is_active());
    assert_eq!(record.replicas.len(), 2);
    assert!(matches!(
        dispatch(&state, b"/durable", Op::Get).await,
        Ok(Reply::Found(_))
    ));
}

#[test]
fn test_coordinator_rejects_bad_topology() {
    let too_few = MasterConfig {
        volumes: vec!["v1".into()],
        replicas: 3,
        ..Default::default()
    };
    assert!(matches!(
        Coordinator::new(too_few),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        Coordinator::new(MasterConfig::default()),
        Err(Error::InvalidConfig(_))
    ));
    assert!(Coordinator::new(config()).is_ok());
}
