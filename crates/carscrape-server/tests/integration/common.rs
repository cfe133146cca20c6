use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Html;
use axum::routing::{get, post};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use carscrape_client::{PageFetcher, ReqwestFetcher};
use carscrape_core::config::Settings;
use carscrape_core::store::JobStore;
use carscrape_server::routes;
use carscrape_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

/// Webhook POSTs received by the fixture site: `(Idempotency-Key, body)`.
pub type Hooks = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

const LISTING: &str = r#"<html><body>
  <div class="card-veiculo"><a href="/veiculo/1-onix">Onix</a></div>
  <div class="card-veiculo"><a href="/veiculo/2-gol">Gol</a></div>
  <a href="/sobre">Sobre</a>
</body></html>"#;

/// Same stock plus a sold vehicle whose page is gone.
const PARTIAL_LISTING: &str = r#"<html><body>
  <div class="card-veiculo"><a href="/veiculo/1-onix">Onix</a></div>
  <div class="card-veiculo"><a href="/veiculo/2-gol">Gol</a></div>
  <div class="card-veiculo"><a href="/veiculo/3-vendido">Uno</a></div>
</body></html>"#;

fn detail_page(slug: &str) -> String {
    let (title, price) = match slug {
        "1-onix" => ("Chevrolet Onix LT", "R$ 79.900"),
        _ => ("Volkswagen Gol 1.0", "R$ 42.500"),
    };
    format!(
        r#"<html><body>
          <h1 class="titulo-veiculo">{title}</h1>
          <div class="preco-valor">{price}</div>
          <span class="ano-modelo">2021/2022</span>
          <p>Flex, câmbio manual, 4 portas.</p>
        </body></html>"#
    )
}

async fn vehicle(Path(slug): Path<String>) -> Result<Html<String>, StatusCode> {
    if slug == "3-vendido" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Html(detail_page(&slug)))
}

async fn hook(State(hooks): State<Hooks>, headers: HeaderMap, body: axum::Json<serde_json::Value>) {
    let key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    hooks.lock().unwrap().push((key, body.0));
}

/// Serve a small dealer site plus a webhook receiver on a random local port.
async fn spawn_site(hooks: Hooks) -> String {
    let site = Router::new()
        .route("/carros", get(|| async { Html(LISTING) }))
        .route("/parcial", get(|| async { Html(PARTIAL_LISTING) }))
        .route("/vazio", get(|| async { Html("<html><body><p>Sem estoque</p></body></html>") }))
        .route("/bloqueado", get(|| async { StatusCode::FORBIDDEN }))
        .route("/veiculo/{slug}", get(vehicle))
        .route("/hook", post(hook))
        .with_state(hooks);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, site).await.unwrap() });
    format!("http://{addr}")
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    /// Base URL of the fixture dealer site.
    pub site: String,
    pub hooks: Hooks,
    shutdown: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn test_settings() -> Settings {
    Settings {
        default_delay: Duration::ZERO,
        webhook_retry_delay: Duration::from_millis(10),
        ..Settings::default()
    }
}

async fn build(settings: Settings, start_scheduler: bool) -> TestApp {
    let hooks = Hooks::default();
    let site = spawn_site(hooks.clone()).await;

    let fetcher = PageFetcher::Static(ReqwestFetcher::new().unwrap().allow_private_urls());
    let state = Arc::new(AppState::new(&settings, JobStore::new(), fetcher).unwrap());

    let shutdown = CancellationToken::new();
    if start_scheduler {
        let orchestrator = state.orchestrator.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { orchestrator.run(token).await });
    }

    TestApp {
        router: routes::router(state.clone()),
        state,
        site,
        hooks,
        shutdown,
    }
}

/// App with bearer auth enforced and the scheduler running.
pub async fn setup_test_app() -> TestApp {
    let settings = Settings {
        api_key_required: true,
        api_key: Some(TEST_API_KEY.to_string()),
        ..test_settings()
    };
    build(settings, true).await
}

/// App without auth and with the scheduler running.
pub async fn setup_test_app_no_auth() -> TestApp {
    build(test_settings(), true).await
}

/// App whose scheduler is never started, so submitted jobs stay pending.
pub async fn setup_idle_app() -> TestApp {
    build(test_settings(), false).await
}

impl TestApp {
    /// Send a request with the test API key and decode the JSON body.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let mut request = request;
        request.headers_mut().insert(
            "authorization",
            format!("Bearer {TEST_API_KEY}").parse().unwrap(),
        );
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.send(Request::delete(uri).body(Body::empty()).unwrap()).await
    }

    /// Submit a scrape and return the new job id.
    pub async fn submit(&self, body: serde_json::Value) -> String {
        let (status, json) = self.post_json("/scrape", body).await;
        assert_eq!(status, StatusCode::ACCEPTED, "unexpected response: {json}");
        json["job_id"].as_str().unwrap().to_string()
    }

    /// Poll a job until it reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: &str) -> serde_json::Value {
        for _ in 0..100 {
            let (_, job) = self.get(&format!("/jobs/{job_id}")).await;
            if matches!(
                job["status"].as_str(),
                Some("succeeded" | "failed" | "cancelled")
            ) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} did not finish");
    }

    /// Wait until at least `count` webhooks have arrived.
    pub async fn wait_for_hooks(&self, count: usize) -> Vec<(Option<String>, serde_json::Value)> {
        for _ in 0..100 {
            let hooks = self.hooks.lock().unwrap().clone();
            if hooks.len() >= count {
                return hooks;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {count} webhook deliveries");
    }
}
