//! HTTP binding for the master
//!
//! Every method on every path lands in one fallback handler: the path is the
//! key, so there is no route table. `UNLINK` and `REBALANCE` are extension
//! methods. GET/HEAD with a query string is a listing.

use crate::common::{decode_key, request_tracing_middleware, Error};
use crate::coordinator::dispatch::{dispatch, list, ListFilter, ListParams, Op, Reply};
use crate::coordinator::replication::Located;
use crate::coordinator::server::CoordState;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};

pub const KEY_VOLUMES_HEADER: &str = "Key-Volumes";
pub const KEY_BALANCE_HEADER: &str = "Key-Balance";
pub const CONTENT_MD5_HEADER: &str = "Content-Md5";

/// Create the HTTP router
pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::disable())
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        match self {
            Error::NotFound(_) => status.into_response(),
            Error::Volume { .. } | Error::RocksDb(_) | Error::MetadataCorrupted(_) => {
                tracing::error!("{}", self);
                (status, self.to_string()).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}

async fn handle(
    State(state): State<CoordState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let key = decode_key(uri.path());

    if matches!(method, Method::GET | Method::HEAD) {
        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            return list_keys(&state, &key, query, &uri).into_response();
        }
    }

    let op = match method.as_str() {
        "GET" => Op::Get,
        "HEAD" => Op::Head,
        "PUT" => Op::Put(body),
        "DELETE" => Op::Delete,
        "UNLINK" => Op::Unlink,
        "REBALANCE" => Op::Rebalance,
        other => return Error::MethodNotAllowed(other.to_string()).into_response(),
    };

    tracing::debug!("{} {}", op.name(), uri.path());
    match dispatch(&state, &key, op).await {
        Ok(Reply::Found(located)) => redirect(located),
        Ok(Reply::Created) => StatusCode::CREATED.into_response(),
        Ok(Reply::Done) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

fn list_keys(state: &CoordState, prefix: &[u8], query: &str, uri: &Uri) -> Response {
    let filter = match ListFilter::from_query(query) {
        Ok(filter) => filter,
        Err(e) => return e.into_response(),
    };
    let params = match Query::<ListParams>::try_from_uri(uri) {
        Ok(Query(params)) => params,
        Err(e) => return Error::BadRequest(e.body_text()).into_response(),
    };
    match list(state, prefix, filter, &params) {
        Ok(page) => Json(page).into_response(),
        Err(e) => e.into_response(),
    }
}

fn redirect(located: Located) -> Response {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&located.location) {
        Ok(location) => {
            headers.insert(header::LOCATION, location);
        }
        Err(_) => {
            return Error::Internal(format!("unusable location {:?}", located.location))
                .into_response()
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));

    if let Some(replica) = &located.replica {
        if let Ok(volumes) = HeaderValue::from_str(&replica.volumes.join(",")) {
            headers.insert(KEY_VOLUMES_HEADER, volumes);
        }
        let balance = if replica.balanced { "balanced" } else { "unbalanced" };
        headers.insert(KEY_BALANCE_HEADER, HeaderValue::from_static(balance));
    }
    if !located.hash.is_empty() {
        if let Ok(hash) = HeaderValue::from_str(&located.hash) {
            headers.insert(CONTENT_MD5_HEADER, hash);
        }
    }

    (StatusCode::FOUND, headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{key_to_path, MasterConfig, REQUEST_ID_HEADER};
    use crate::coordinator::dispatch::ListPage;
    use crate::coordinator::metadata::MetadataStore;
    use crate::coordinator::record::Record;
    use crate::coordinator::volume_client::MemoryVolumes;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(config: MasterConfig) -> Router {
        let state = CoordState::new(config, MetadataStore::in_memory(), Arc::new(MemoryVolumes::new()));
        create_router(state)
    }

    fn config() -> MasterConfig {
        MasterConfig {
            volumes: vec!["localhost:3001".into(), "localhost:3002".into()],
            replicas: 2,
            subvolumes: 1,
            ..Default::default()
        }
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
    async fn test_put_get_redirect() {
        let router = router(config());
        let resp = send(&router, "PUT", "/hello", "world").await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));

        let resp = send(&router, "GET", "/hello", "").await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("http://localhost:300"));
        assert!(location.ends_with(&key_to_path(b"/hello")));
        assert_eq!(resp.headers()[KEY_BALANCE_HEADER], "balanced");
        assert_eq!(
            resp.headers()[CONTENT_MD5_HEADER],
            "7d793037a0760186574b0282f2f435e7"
        );
        let volumes = resp.headers()[KEY_VOLUMES_HEADER].to_str().unwrap();
        assert_eq!(volumes.split(',').count(), 2);
    }

    #[tokio::test]
    async fn test_stale_record_redirects_unbalanced() {
        let volumes = Arc::new(MemoryVolumes::new());
        let state = CoordState::new(config(), MetadataStore::in_memory(), volumes.clone());
        let router = create_router(state.clone());

        let path = key_to_path(b"/moved");
        volumes.insert("localhost:3009", &path, "x");
        state
            .metadata
            .put_record(b"/moved", &Record::active(vec!["localhost:3009".into()], ""))
            .unwrap();

        let resp = send(&router, "GET", "/moved", "").await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers()[header::LOCATION],
            format!("http://localhost:3009{}", path).as_str()
        );
        assert_eq!(resp.headers()[KEY_BALANCE_HEADER], "unbalanced");
        assert_eq!(resp.headers()[KEY_VOLUMES_HEADER], "localhost:3009");
        assert!(!resp.headers().contains_key(CONTENT_MD5_HEADER));
    }

    #[tokio::test]
    async fn test_status_codes() {
        let router = router(config());
        assert_eq!(send(&router, "GET", "/nope", "").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(send(&router, "PUT", "/k", "").await.status(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(send(&router, "PUT", "/k", "v").await.status(), StatusCode::CREATED);
        assert_eq!(send(&router, "PUT", "/k", "v").await.status(), StatusCode::CONFLICT);
        assert_eq!(send(&router, "REBALANCE", "/k", "").await.status(), StatusCode::NO_CONTENT);
        assert_eq!(send(&router, "UNLINK", "/k", "").await.status(), StatusCode::NO_CONTENT);
        assert_eq!(send(&router, "UNLINK", "/k", "").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(send(&router, "REBALANCE", "/k", "").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(send(&router, "DELETE", "/k", "").await.status(), StatusCode::NO_CONTENT);
        assert_eq!(send(&router, "DELETE", "/k", "").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            send(&router, "PATCH", "/k", "").await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_protect_mode() {
        let router = router(MasterConfig {
            protect: true,
            ..config()
        });
        send(&router, "PUT", "/k", "v").await;
        assert_eq!(send(&router, "DELETE", "/k", "").await.status(), StatusCode::FORBIDDEN);
        assert_eq!(send(&router, "UNLINK", "/k", "").await.status(), StatusCode::NO_CONTENT);
        assert_eq!(send(&router, "DELETE", "/k", "").await.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_list_over_ceiling() {
        let router = router(MasterConfig {
            max_list_keys: 2,
            ..config()
        });
        for key in ["/d/a", "/d/b", "/d/c"] {
            send(&router, "PUT", key, "v").await;
        }
        assert_eq!(
            send(&router, "GET", "/d/?list", "").await.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        let resp = send(&router, "GET", "/d/?list&limit=2", "").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page: ListPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.keys, vec!["/d/a", "/d/b"]);
        assert_eq!(page.next, "/d/c");
    }

    #[tokio::test]
    async fn test_fallback_redirect() {
        let router = router(MasterConfig {
            fallback: Some("archive:3000".into()),
            ..config()
        });
        let resp = send(&router, "GET", "/old%20key", "").await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[header::LOCATION], "http://archive:3000/old%20key");
        assert!(!resp.headers().contains_key(KEY_VOLUMES_HEADER));
    }

    #[tokio::test]
    async fn test_list_queries() {
        let router = router(config());
        for key in ["/dir/a", "/dir/b", "/dir/c"] {
            send(&router, "PUT", key, "v").await;
        }
        send(&router, "UNLINK", "/dir/b", "").await;

        let resp = send(&router, "GET", "/dir/?list", "").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page: ListPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.keys, vec!["/dir/a", "/dir/c"]);
        assert_eq!(page.next, "");

        let resp = send(&router, "GET", "/dir/?list&limit=1", "").await;
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page: ListPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.keys, vec!["/dir/a"]);
        assert_eq!(page.next, "/dir/c");

        let resp = send(&router, "GET", "/dir/?unlinked", "").await;
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page: ListPage = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.keys, vec!["/dir/b"]);

        assert_eq!(
            send(&router, "GET", "/dir/?limit=1&list", "").await.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            send(&router, "GET", "/dir/?list&limit=x", "").await.status(),
            StatusCode::BAD_REQUEST
        );
    }
}
