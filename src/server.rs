//! Collector HTTP surface.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use poem::{
    error::ResponseError,
    get, handler,
    http::StatusCode,
    listener::TcpListener,
    middleware::{AddData, Compression},
    post,
    web::{Data, Html, Json, Path},
    Endpoint, EndpointExt, IntoResponse, Request, Response, Route, Server,
};
use tracing::info;

use crate::{
    buf::Ingestor,
    codec::{verify, SIGNATURE_HEADER},
    error::StorageError,
    metric::{Metric, MetricKey, MetricKind, RawMetric},
    view::dashboard_html,
};

pub const PING_TIMEOUT: Duration = Duration::from_secs(1);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const LIST_TIMEOUT: Duration = Duration::from_secs(6);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct AppState {
    pub ingestor: Ingestor,
}

impl ResponseError for StorageError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StorageError::Timeout)?
}

#[handler]
async fn update(
    Json(raw): Json<RawMetric>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<Metric>> {
    let stored = state.ingestor.update(raw).await?;
    Ok(Json(stored))
}

#[handler]
async fn updates(
    Json(raw): Json<Vec<RawMetric>>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<Vec<Metric>>> {
    let stored = state.ingestor.update_batch(raw).await?;
    Ok(Json(stored))
}

#[handler]
async fn update_path(
    Path((kind, id, value)): Path<(String, String, String)>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<String> {
    let metric = Metric::parse(&kind, &id, &value).map_err(StorageError::from)?;
    let stored = state.ingestor.update_metric(metric).await?;
    Ok(stored.value.to_string())
}

#[handler]
async fn value_json(
    Json(raw): Json<RawMetric>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<Json<Metric>> {
    let key = MetricKey::try_from(&raw).map_err(StorageError::from)?;
    let metric = bounded(READ_TIMEOUT, state.ingestor.storage().get(&key)).await?;
    Ok(Json(metric))
}

#[handler]
async fn value_path(
    Path((kind, id)): Path<(String, String)>,
    state: Data<&Arc<AppState>>,
) -> poem::Result<String> {
    let kind: MetricKind = kind.parse().map_err(StorageError::from)?;
    let key = MetricKey::new(id, kind);
    let metric = bounded(READ_TIMEOUT, state.ingestor.storage().get(&key)).await?;
    Ok(metric.value.to_string())
}

#[handler]
async fn dashboard(state: Data<&Arc<AppState>>) -> poem::Result<Html<String>> {
    let storage = state.ingestor.storage();
    let (gauges, counters) = bounded(LIST_TIMEOUT, async {
        Ok((storage.list_gauges().await?, storage.list_counters().await?))
    })
    .await?;
    Ok(Html(dashboard_html(&gauges, &counters)))
}

#[handler]
async fn ping(state: Data<&Arc<AppState>>) -> poem::Result<()> {
    bounded(PING_TIMEOUT, state.ingestor.storage().ping()).await?;
    Ok(())
}

/// Rejects bodies whose `HashSHA256` header does not match; requests without the header pass.
async fn check_signature<E: Endpoint>(
    ep: Arc<E>,
    mut req: Request,
    key: Arc<str>,
) -> poem::Result<Response> {
    if let Some(signature) = req.header(SIGNATURE_HEADER).map(str::to_string) {
        let body = req.take_body().into_bytes().await?;
        if !verify(&body, &key, &signature) {
            return Err(poem::Error::from_string(
                "invalid hash provided",
                StatusCode::BAD_REQUEST,
            ));
        }
        req.set_body(body);
    }
    ep.call(req).await.map(IntoResponse::into_response)
}

async fn log_request<E: Endpoint>(ep: Arc<E>, req: Request) -> poem::Result<Response> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let resp = ep.get_response(req).await;
    info!(
        %method,
        %uri,
        status = resp.status().as_u16(),
        elapsed = ?start.elapsed(),
        "incoming request"
    );
    Ok(resp)
}

/// Routes, shared state, optional signature check, access log and gzip, outermost last.
pub fn app(state: Arc<AppState>, key: Option<String>) -> impl Endpoint {
    let routes = Route::new()
        .at("/", get(dashboard))
        .at("/ping", get(ping))
        .at("/update/", post(update))
        .at("/update/:kind/:id/:value", post(update_path))
        .at("/updates/", post(updates))
        .at("/value/", post(value_json))
        .at("/value/:kind/:id", get(value_path))
        .with(AddData::new(state));
    let signed = match key {
        Some(key) => {
            let key: Arc<str> = key.into();
            routes
                .around(move |ep, req| check_signature(ep, req, key.clone()))
                .boxed()
        }
        None => routes.map_to_response().boxed(),
    };
    signed.around(log_request).with(Compression::new())
}

/// Serves until `shutdown` resolves, then gives in-flight requests a grace period.
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    key: Option<String>,
    shutdown: impl Future<Output = ()> + Send,
) -> std::io::Result<()> {
    info!(%addr, "collector listening");
    Server::new(TcpListener::bind(addr.to_string()))
        .run_with_graceful_shutdown(app(state, key), shutdown, Some(SHUTDOWN_GRACE))
        .await
}

#[cfg(test)]
mod tests {
    use poem::test::TestClient;

    use super::*;
    use crate::{
        buf::{fan_in, MetricReceiver},
        codec::{gzip, sign},
        in_mem::MemStorage,
    };

    fn setup(key: Option<&str>) -> (TestClient<impl Endpoint>, MetricReceiver) {
        let (publisher, receiver) = fan_in();
        let ingestor = Ingestor::new(Arc::new(MemStorage::new()), publisher, WRITE_TIMEOUT);
        let state = Arc::new(AppState { ingestor });
        (
            TestClient::new(app(state, key.map(str::to_string))),
            receiver,
        )
    }

    #[tokio::test]
    async fn update_then_read_back() {
        let (cli, mut receiver) = setup(None);
        let resp = cli
            .post("/update/")
            .body_json(&serde_json::json!({"id": "Alloc", "type": "gauge", "value": 1.5}))
            .send();
        let (resp, published) = tokio::join!(resp, receiver.recv());
        resp.assert_status_is_ok();
        resp.assert_json(serde_json::json!({"id": "Alloc", "type": "gauge", "value": 1.5}))
            .await;
        assert_eq!(published, Some(Metric::gauge("Alloc", 1.5)));

        let resp = cli.get("/value/gauge/Alloc").send().await;
        resp.assert_status_is_ok();
        resp.assert_content_type("text/plain; charset=utf-8");
        resp.assert_text("1.5").await;

        let resp = cli
            .post("/value/")
            .body_json(&serde_json::json!({"id": "Alloc", "type": "gauge"}))
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_json(serde_json::json!({"id": "Alloc", "type": "gauge", "value": 1.5}))
            .await;
    }

    #[tokio::test]
    async fn path_updates_accumulate_counters() {
        let (cli, mut receiver) = setup(None);
        for expected in [2, 4] {
            let resp = cli.post("/update/counter/PollCount/2").send();
            let (resp, published) = tokio::join!(resp, receiver.recv());
            resp.assert_status_is_ok();
            assert_eq!(published, Some(Metric::counter("PollCount", expected)));
            resp.assert_text(expected.to_string()).await;
        }
        let resp = cli.get("/value/counter/PollCount").send().await;
        resp.assert_text("4").await;
    }

    #[tokio::test]
    async fn batch_update_publishes_each_stored_value() {
        let (cli, mut receiver) = setup(None);
        let collect = async {
            let mut seen = vec![];
            for _ in 0..3 {
                seen.push(receiver.recv().await.unwrap());
            }
            seen
        };
        let resp = cli
            .post("/updates/")
            .body_json(&serde_json::json!([
                {"id": "PollCount", "type": "counter", "delta": 1},
                {"id": "Alloc", "type": "gauge", "value": 2.0},
                {"id": "PollCount", "type": "counter", "delta": 4},
            ]))
            .send();
        let (resp, seen) = tokio::join!(resp, collect);
        resp.assert_status_is_ok();
        assert_eq!(
            seen,
            vec![
                Metric::counter("PollCount", 1),
                Metric::gauge("Alloc", 2.0),
                Metric::counter("PollCount", 5),
            ]
        );
    }

    #[tokio::test]
    async fn client_errors() {
        let (cli, _receiver) = setup(None);
        cli.post("/update/histogram/x/1")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.post("/update/gauge/Alloc/abc")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.post("/update/")
            .body_json(&serde_json::json!({"id": "x", "type": "histogram", "value": 1.0}))
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        cli.get("/value/gauge/missing")
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
        cli.get("/value/summary/x")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dashboard_and_ping() {
        let (cli, mut receiver) = setup(None);
        let resp = cli.post("/update/gauge/HeapSys/42").send();
        let (resp, _) = tokio::join!(resp, receiver.recv());
        resp.assert_status_is_ok();
        let resp = cli.get("/").send().await;
        resp.assert_status_is_ok();
        let page = resp.0.into_body().into_string().await.unwrap();
        assert!(page.contains("<li>HeapSys: 42</li>"));
        cli.get("/ping").send().await.assert_status_is_ok();
    }

    #[tokio::test]
    async fn gzip_signed_batch() {
        let (cli, mut receiver) = setup(Some("secret"));
        let body = serde_json::to_vec(&vec![Metric::gauge("Alloc", 3.0)]).unwrap();
        let resp = cli
            .post("/updates/")
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .header(SIGNATURE_HEADER, sign(&body, "secret"))
            .body(gzip(&body).unwrap())
            .send();
        let (resp, published) = tokio::join!(resp, receiver.recv());
        resp.assert_status_is_ok();
        assert_eq!(published, Some(Metric::gauge("Alloc", 3.0)));

        cli.post("/updates/")
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, sign(&body, "wrong"))
            .body(body.clone())
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
