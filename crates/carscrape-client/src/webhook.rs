use std::time::Duration;

use carscrape_core::error::AppError;
use carscrape_core::traits::{DeliveryResponse, WebhookSender};
use carscrape_core::webhook::WebhookPayload;
use reqwest::Client;

/// Header carrying the job's idempotency key on every delivery attempt.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Posts completion payloads as JSON over HTTP.
///
/// Any response status is returned as-is; only transport failures are errors.
#[derive(Clone)]
pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("carscrape/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::WebhookError(e.to_string()))?;
        Ok(Self { client })
    }
}

impl WebhookSender for HttpWebhookSender {
    async fn send(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> Result<DeliveryResponse, AppError> {
        let response = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, &payload.idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| AppError::WebhookError(e.to_string()))?;

        Ok(DeliveryResponse {
            status: response.status().as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use carscrape_core::job::{CreateJobRequest, Job, JobStatus, ScrapeTarget};

    use super::*;

    type Received = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn receiver(
        State(received): State<Received>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> StatusCode {
        let key = headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        received.lock().unwrap().push((key, body));
        StatusCode::ACCEPTED
    }

    async fn spawn_receiver() -> (String, Received) {
        let received = Received::default();
        let app = Router::new()
            .route("/hook", post(receiver))
            .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), received)
    }

    fn finished_job() -> Job {
        let target = ScrapeTarget::from_url("https://loja.example/carros").unwrap();
        let mut job = Job::new(CreateJobRequest::new(target), 3);
        job.status = JobStatus::Succeeded;
        job.result = Some(vec![serde_json::json!({ "title": "Fiat Uno" })]);
        job.completed_at = Some(chrono::Utc::now());
        job
    }

    #[tokio::test]
    async fn posts_payload_with_idempotency_key() {
        let (base, received) = spawn_receiver().await;
        let job = finished_job();
        let payload = WebhookPayload::from_job(&job);

        let sender = HttpWebhookSender::new(Duration::from_secs(5)).unwrap();
        let response = sender.send(&format!("{base}/hook"), &payload).await.unwrap();

        assert_eq!(response.status, 202);
        assert!(response.is_success());
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.as_deref(), Some(job.idempotency_key.as_str()));
        assert_eq!(received[0].1["job_id"], job.id.to_string());
        assert_eq!(received[0].1["status"], "succeeded");
    }

    #[tokio::test]
    async fn error_status_is_not_a_transport_error() {
        let (base, _) = spawn_receiver().await;
        let payload = WebhookPayload::from_job(&finished_job());

        let sender = HttpWebhookSender::new(Duration::from_secs(5)).unwrap();
        let response = sender.send(&format!("{base}/broken"), &payload).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender = HttpWebhookSender::new(Duration::from_secs(2)).unwrap();
        let err = sender
            .send(&format!("http://{addr}/hook"), &WebhookPayload::from_job(&finished_job()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::WebhookError(_)));
    }
}
