use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use crate::integration::common::{setup_idle_app, setup_test_app, setup_test_app_no_auth};

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn openapi_document_is_public() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["paths"]["/scrape"].is_object());
    assert!(json["paths"]["/jobs/{id}"].is_object());
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/metrics")
                .header("authorization", "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn auth_disabled_accepts_requests_without_key() {
    let app = setup_test_app_no_auth().await;

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn scrape_runs_job_to_success() {
    let app = setup_test_app().await;

    let job_id = app
        .submit(json!({
            "target": format!("{}/carros", app.site),
            "client_name": "loja-teste",
        }))
        .await;
    let job = app.wait_for_terminal(&job_id).await;

    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["attempts"], 1);
    assert_eq!(job["client_name"], "loja-teste");
    assert_eq!(job["total_records"], 2);
    assert!(job.get("error").is_none());
    assert_eq!(job["stats"]["total_found"], 2);
    assert_eq!(job["stats"]["success_rate"], 100.0);

    let result = job["result"].as_array().unwrap();
    assert_eq!(result[0]["title"], "Chevrolet Onix LT");
    assert_eq!(result[0]["price"], "R$ 79.900");
    assert_eq!(result[1]["brand"], "VOLKSWAGEN");
    assert_eq!(result[1]["transmission"], "manual");
}

#[tokio::test]
async fn max_pages_limits_records() {
    let app = setup_test_app().await;

    let job_id = app
        .submit(json!({
            "target": format!("{}/carros", app.site),
            "max_pages": 1,
        }))
        .await;
    let job = app.wait_for_terminal(&job_id).await;

    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["max_pages"], 1);
    assert_eq!(job["result"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn blocked_source_fails_without_retry() {
    let app = setup_test_app().await;

    let job_id = app
        .submit(json!({ "target": format!("{}/bloqueado", app.site) }))
        .await;
    let job = app.wait_for_terminal(&job_id).await;

    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempts"], 1);
    assert_eq!(job["error"]["kind"], "permanent");
    assert!(job.get("result").is_none());
}

#[tokio::test]
async fn listing_without_vehicles_fails_permanently() {
    let app = setup_test_app().await;

    let job_id = app
        .submit(json!({ "target": format!("{}/vazio", app.site) }))
        .await;
    let job = app.wait_for_terminal(&job_id).await;

    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"]["kind"], "permanent");
    assert!(
        job["error"]["message"]
            .as_str()
            .unwrap()
            .contains("No vehicle links")
    );
}

#[tokio::test]
async fn scrape_rejects_invalid_target() {
    let app = setup_test_app().await;

    let (status, json) = app
        .post_json("/scrape", json!({ "target": "not a url" }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_target");
    assert_eq!(app.state.orchestrator.stats().total, 0);
}

#[tokio::test]
async fn scrape_rejects_invalid_webhook_url() {
    let app = setup_test_app().await;

    let (status, json) = app
        .post_json(
            "/scrape",
            json!({
                "target": format!("{}/carros", app.site),
                "webhook_url": "ftp://hooks.example/done",
            }),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["message"].as_str().unwrap().contains("webhook_url"));
}

#[tokio::test]
async fn webhook_is_delivered_with_idempotency_key() {
    let app = setup_test_app().await;

    let (status, created) = app
        .post_json(
            "/scrape",
            json!({
                "target": format!("{}/carros", app.site),
                "webhook_url": format!("{}/hook", app.site),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = created["job_id"].as_str().unwrap();

    let hooks = app.wait_for_hooks(1).await;
    let (key, payload) = &hooks[0];
    assert_eq!(payload["job_id"], job_id);
    assert_eq!(payload["status"], "succeeded");
    assert_eq!(payload["stats"]["total_records"], 2);
    assert_eq!(key.as_deref(), created["idempotency_key"].as_str());
    assert_eq!(payload["idempotency_key"], created["idempotency_key"]);

    // Delivery bookkeeping lands on the job without touching its status.
    let mut delivered = None;
    for _ in 0..50 {
        let (_, job) = app.get(&format!("/jobs/{job_id}")).await;
        if !job["delivery"]["delivered_at"].is_null() {
            delivered = Some(job);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let job = delivered.expect("delivery recorded on job");
    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["delivery"]["last_status"], 200);
}

#[tokio::test]
async fn get_unknown_job_returns_404() {
    let app = setup_test_app().await;

    let (status, json) = app
        .get("/jobs/00000000-0000-4000-8000-000000000000")
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn cancel_pending_job_then_conflict() {
    let app = setup_idle_app().await;
    let job_id = app
        .submit(json!({ "target": format!("{}/carros", app.site) }))
        .await;

    let (status, job) = app.delete(&format!("/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "cancelled");
    assert_eq!(job["error"]["kind"], "cancelled");
    assert_eq!(job["attempts"], 0);

    let (status, json) = app.delete(&format!("/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "already_terminal");
}

#[tokio::test]
async fn cancel_finished_job_returns_409() {
    let app = setup_test_app().await;
    let job_id = app
        .submit(json!({ "target": format!("{}/carros", app.site) }))
        .await;
    app.wait_for_terminal(&job_id).await;

    let (status, _) = app.delete(&format!("/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_unknown_job_returns_404() {
    let app = setup_test_app().await;

    let (status, _) = app
        .delete("/jobs/00000000-0000-4000-8000-000000000000")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_jobs_filters_by_status_and_source() {
    let app = setup_idle_app().await;
    let first = app
        .submit(json!({ "target": format!("{}/carros", app.site) }))
        .await;
    let second = app
        .submit(json!({ "target": "https://www.outra-loja.example/estoque" }))
        .await;
    app.delete(&format!("/jobs/{first}")).await;

    let (status, all) = app.get("/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all["total"], 2);

    let (_, pending) = app.get("/jobs?status=pending").await;
    assert_eq!(pending["total"], 1);
    assert_eq!(pending["jobs"][0]["id"], second.as_str());

    let (_, by_source) = app.get("/jobs?source=www.outra-loja.example").await;
    assert_eq!(by_source["total"], 1);
    assert_eq!(by_source["jobs"][0]["source"], "outra-loja.example");

    let (_, limited) = app.get("/jobs?limit=1").await;
    assert_eq!(limited["total"], 1);
}

#[tokio::test]
async fn list_jobs_rejects_unknown_status() {
    let app = setup_test_app().await;

    let (status, json) = app.get("/jobs?status=exploded").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "bad_request");
}

#[tokio::test]
async fn missing_detail_page_shows_in_job_stats_and_webhook() {
    let app = setup_test_app().await;

    let job_id = app
        .submit(json!({
            "target": format!("{}/parcial", app.site),
            "webhook_url": format!("{}/hook", app.site),
        }))
        .await;
    let job = app.wait_for_terminal(&job_id).await;

    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["total_records"], 2);
    let stats = &job["stats"];
    assert_eq!(stats["total_found"], 3);
    assert_eq!(stats["successfully_scraped"], 2);
    assert_eq!(stats["errors"], 1);
    assert_eq!(stats["success_rate"], 66.67);
    assert!(stats["duration_ms"].is_u64());

    let hooks = app.wait_for_hooks(1).await;
    let payload = &hooks[0].1;
    assert_eq!(payload["stats"]["total_found"], 3);
    assert_eq!(payload["stats"]["errors"], 1);
    assert_eq!(payload["stats"]["total_records"], 2);

    let (_, metrics) = app.get("/metrics").await;
    assert_eq!(metrics["average_success_rate"], 66.67);
}

#[tokio::test]
async fn metrics_count_jobs_and_records() {
    let app = setup_test_app().await;
    let ok = app
        .submit(json!({ "target": format!("{}/carros", app.site) }))
        .await;
    let bad = app
        .submit(json!({ "target": format!("{}/bloqueado", app.site) }))
        .await;
    app.wait_for_terminal(&ok).await;
    app.wait_for_terminal(&bad).await;

    let (status, metrics) = app.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["total_jobs"], 2);
    assert_eq!(metrics["succeeded"], 1);
    assert_eq!(metrics["failed"], 1);
    assert_eq!(metrics["total_records"], 2);
    assert_eq!(metrics["average_success_rate"], 100.0);
    assert_eq!(metrics["max_concurrent_jobs"], 3);
}

#[tokio::test]
async fn test_selectors_extracts_without_creating_job() {
    let app = setup_test_app().await;

    let (status, json) = app
        .post_json(
            "/test-selectors",
            json!({
                "url": format!("{}/veiculo/1-onix", app.site),
                "selectors": { "year": [".ano-modelo"] },
            }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["vehicle"]["title"], "Chevrolet Onix LT");
    assert_eq!(json["vehicle"]["year"], "2021/2022");
    assert_eq!(json["vehicle"]["fuel"], "flex");
    assert_eq!(app.state.orchestrator.stats().total, 0);
}

#[tokio::test]
async fn test_selectors_reports_blocked_page() {
    let app = setup_test_app().await;

    let (status, json) = app
        .post_json(
            "/test-selectors",
            json!({ "url": format!("{}/bloqueado", app.site) }),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"], "upstream_error");
}
