use crate::config::RequestTemplate;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Builds the next request for a worker. Called once per request on the hot path.
pub trait RequestFactory: Send + Sync + 'static {
    fn build(
        &self,
        client: &reqwest::Client,
        target: &Url,
        worker: usize,
        seq: u64,
    ) -> reqwest::RequestBuilder;
}

/// Requests rendered from a scenario's `[scenario.request]` block.
#[derive(Debug, Clone)]
pub struct TemplateRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    headers: HeaderMap,
    timeout: Duration,
}

impl TemplateRequest {
    pub fn from_template(template: &RequestTemplate) -> Result<Self, String> {
        let method = Method::from_bytes(template.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid request method {:?}", template.method))?;
        let mut headers = HeaderMap::new();
        for (name, value) in &template.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }
        Ok(Self {
            method,
            path: template.path.clone(),
            body: template.body.clone(),
            headers,
            timeout: template.timeout(),
        })
    }
}

impl RequestFactory for TemplateRequest {
    fn build(
        &self,
        client: &reqwest::Client,
        target: &Url,
        worker: usize,
        seq: u64,
    ) -> reqwest::RequestBuilder {
        // The path was validated with the config; a bad join falls back to the base URL.
        let url = target.join(&self.path).unwrap_or_else(|_| target.clone());
        let mut builder = client
            .request(self.method.clone(), url)
            .headers(self.headers.clone())
            .timeout(self.timeout);
        if let Some(body) = &self.body {
            builder = builder.json(&render(body, worker, seq));
        }
        builder
    }
}

/// Substitute `{{worker}}`, `{{seq}}` and `{{uuid}}` in every string of `value`.
pub fn render(value: &serde_json::Value, worker: usize, seq: u64) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(raw) if raw.contains("{{") => {
            let mut out = raw
                .replace("{{worker}}", &worker.to_string())
                .replace("{{seq}}", &seq.to_string());
            while out.contains("{{uuid}}") {
                out = out.replacen("{{uuid}}", &uuid::Uuid::new_v4().to_string(), 1);
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, worker, seq)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), render(v, worker, seq)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub workers: usize,
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub workers_stopped_early: usize,
    pub elapsed_ms: u64,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct WorkerStats {
    issued: u64,
    succeeded: u64,
    failed: u64,
    stopped_early: bool,
}

#[derive(Debug, thiserror::Error)]
enum RequestFailure {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(StatusCode),
}

#[derive(Debug, Clone)]
pub struct LoadGenerator {
    client: reqwest::Client,
}

impl LoadGenerator {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Drive `concurrency` independent workers until `duration` elapses or `stop` fires.
    pub async fn run<F: RequestFactory>(
        &self,
        target: &Url,
        concurrency: usize,
        duration: Duration,
        factory: Arc<F>,
        stop: CancellationToken,
        max_consecutive_failures: u32,
    ) -> LoadSummary {
        let started = Instant::now();
        let deadline = started + duration;

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            let client = self.client.clone();
            let target = target.clone();
            let factory = Arc::clone(&factory);
            let stop = stop.clone();
            workers.spawn(async move {
                run_worker(
                    worker,
                    client,
                    target,
                    factory,
                    deadline,
                    stop,
                    max_consecutive_failures,
                )
                .await
            });
        }

        let mut summary = LoadSummary {
            workers: concurrency,
            ..LoadSummary::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(stats) => {
                    summary.issued += stats.issued;
                    summary.succeeded += stats.succeeded;
                    summary.failed += stats.failed;
                    if stats.stopped_early {
                        summary.workers_stopped_early += 1;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "load worker failed"),
            }
        }

        let elapsed = started.elapsed();
        summary.elapsed_ms = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64();
        summary.throughput_per_sec = if secs > 0.0 {
            summary.succeeded as f64 / secs
        } else {
            0.0
        };
        summary.error_rate = if summary.issued > 0 {
            summary.failed as f64 / summary.issued as f64
        } else {
            0.0
        };
        tracing::debug!(
            issued = summary.issued,
            failed = summary.failed,
            elapsed_ms = summary.elapsed_ms,
            "load phase finished"
        );
        summary
    }
}

async fn run_worker<F: RequestFactory>(
    worker: usize,
    client: reqwest::Client,
    target: Url,
    factory: Arc<F>,
    deadline: Instant,
    stop: CancellationToken,
    max_consecutive_failures: u32,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let mut seq = 0u64;
    let mut streak = 0u32;
    loop {
        if stop.is_cancelled() || Instant::now() >= deadline {
            break;
        }
        let request = factory.build(&client, &target, worker, seq);
        seq += 1;

        // A request cut off by the deadline or stop is not counted at all.
        let outcome = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            outcome = exchange(request) => outcome,
        };
        stats.issued += 1;
        match outcome {
            Ok(()) => {
                stats.succeeded += 1;
                streak = 0;
            }
            Err(err) => {
                stats.failed += 1;
                streak += 1;
                tracing::trace!(worker, error = %err, "request failed");
                if streak >= max_consecutive_failures {
                    tracing::debug!(worker, streak, "worker stopping after consecutive failures");
                    stats.stopped_early = true;
                    break;
                }
            }
        }
    }
    stats
}

async fn exchange(request: reqwest::RequestBuilder) -> Result<(), RequestFailure> {
    let resp = request.send().await?;
    let status = resp.status();
    // Drain the body so the connection goes back to the pool.
    let _ = resp.bytes().await?;
    if status.is_success() {
        Ok(())
    } else {
        Err(RequestFailure::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn factory(path: &str) -> Arc<TemplateRequest> {
        let template = RequestTemplate {
            path: path.to_string(),
            ..RequestTemplate::default()
        };
        Arc::new(TemplateRequest::from_template(&template).unwrap())
    }

    #[test]
    fn render_substitutes_placeholders() {
        let body = json!({
            "id": "{{uuid}}",
            "who": "w{{worker}}-{{seq}}",
            "nested": [{"n": "{{seq}}"}, 7],
            "plain": "static"
        });
        let rendered = render(&body, 3, 41);
        assert_eq!(rendered["who"], "w3-41");
        assert_eq!(rendered["nested"][0]["n"], "41");
        assert_eq!(rendered["nested"][1], 7);
        assert_eq!(rendered["plain"], "static");
        let id = rendered["id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn template_rejects_bad_header() {
        let mut template = RequestTemplate::default();
        template
            .headers
            .insert("x-ok".to_string(), "bad\nvalue".to_string());
        assert!(TemplateRequest::from_template(&template).is_err());
    }

    #[tokio::test]
    async fn counts_every_completed_request() {
        let target = serve(Router::new().route("/ok", get(|| async { "ok" }))).await;
        let summary = LoadGenerator::new(reqwest::Client::new())
            .run(
                &target,
                4,
                Duration::from_millis(300),
                factory("/ok"),
                CancellationToken::new(),
                10,
            )
            .await;

        assert_eq!(summary.workers, 4);
        assert!(summary.succeeded > 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.issued, summary.succeeded + summary.failed);
        assert!(summary.throughput_per_sec > 0.0);
        assert_eq!(summary.error_rate, 0.0);
    }

    #[tokio::test]
    async fn consecutive_failures_stop_workers_early() {
        let target = serve(Router::new().route(
            "/fail",
            get(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let summary = LoadGenerator::new(reqwest::Client::new())
            .run(
                &target,
                3,
                Duration::from_secs(10),
                factory("/fail"),
                CancellationToken::new(),
                5,
            )
            .await;

        assert_eq!(summary.workers_stopped_early, 3);
        assert_eq!(summary.failed, 15);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.error_rate, 1.0);
        assert!(summary.elapsed_ms < 10_000);
    }

    #[tokio::test]
    async fn stop_token_ends_the_run() {
        let target = serve(Router::new().route("/ok", get(|| async { "ok" }))).await;
        let stop = CancellationToken::new();
        let stopper = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        let summary = LoadGenerator::new(reqwest::Client::new())
            .run(&target, 2, Duration::from_secs(30), factory("/ok"), stop, 10)
            .await;
        assert!(summary.elapsed_ms < 5_000, "elapsed {}", summary.elapsed_ms);
    }

    #[tokio::test]
    async fn template_body_is_posted_as_json() {
        let target = serve(Router::new().route(
            "/tx",
            post(|Json(body): Json<serde_json::Value>| async move {
                if body["worker"] == "0" {
                    AxumStatus::OK
                } else {
                    AxumStatus::BAD_REQUEST
                }
            }),
        ))
        .await;
        let template = RequestTemplate {
            method: "post".to_string(),
            path: "/tx".to_string(),
            body: Some(json!({"worker": "{{worker}}"})),
            ..RequestTemplate::default()
        };
        let factory = Arc::new(TemplateRequest::from_template(&template).unwrap());
        let summary = LoadGenerator::new(reqwest::Client::new())
            .run(
                &target,
                1,
                Duration::from_millis(200),
                factory,
                CancellationToken::new(),
                10,
            )
            .await;
        assert!(summary.succeeded > 0);
        assert_eq!(summary.failed, 0);
    }
}
