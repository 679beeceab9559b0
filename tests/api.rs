//! HTTP API integration tests.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{build_runtime, pipeline, pipeline_set, task, wait_for_terminal, TestRuntime};
use gantry::api::{build_router, mint_token, ApiState};
use gantry::{JobId, QueueStrategy, ScheduleOpts};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SECRET: &str = "test-secret";
const WAIT: Duration = Duration::from_secs(10);

async fn test_state() -> (axum::Router, TestRuntime, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let defs = pipeline_set(vec![
        (
            "demo",
            pipeline(
                1,
                Some(1),
                QueueStrategy::Append,
                vec![("greet", task(&["echo hello"], &[]))],
            ),
        ),
        (
            "exclusive",
            pipeline(
                1,
                Some(0),
                QueueStrategy::Append,
                vec![("work", task(&["sleep 0.5"], &[]))],
            ),
        ),
    ]);
    let rt = build_runtime(defs, None, dir.path()).await;

    let state = ApiState {
        runner: Arc::clone(&rt.runner),
        task_runner: Arc::clone(&rt.task_runner),
        output_store: Arc::clone(&rt.output_store),
        jwt_secret: SECRET.to_string(),
    };

    (build_router(state), rt, dir)
}

fn bearer(sub: Option<&str>) -> String {
    format!(
        "Bearer {}",
        mint_token(SECRET, sub.map(String::from)).unwrap()
    )
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, bearer(None))
        .body(Body::empty())
        .unwrap()
}

fn post_schedule(pipeline: &str, sub: Option<&str>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/pipelines/schedule")
        .header(header::AUTHORIZATION, bearer(sub))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "pipeline": pipeline }).to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (router, _rt, _dir) = test_state().await;

    let request = Request::builder()
        .uri("/jobs")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_token_is_unauthorized() {
    let (router, _rt, _dir) = test_state().await;

    let request = Request::builder()
        .uri("/jobs")
        .header(header::AUTHORIZATION, "Bearer bogus.token.value")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_schedule_returns_job_id_and_records_user() {
    let (router, rt, _dir) = test_state().await;

    let response = router
        .clone()
        .oneshot(post_schedule("demo", Some("alice")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let job_id = JobId::from_string(body["jobId"].as_str().unwrap()).unwrap();

    let job = wait_for_terminal(&rt.runner, job_id, WAIT).await;
    assert!(job.completed);
    assert_eq!(job.user, "alice");
}

#[tokio::test]
async fn test_schedule_unknown_pipeline_is_not_found() {
    let (router, _rt, _dir) = test_state().await;

    let response = router.oneshot(post_schedule("ghost", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_schedule_queue_disabled_conflict() {
    let (router, _rt, _dir) = test_state().await;

    let first = router
        .clone()
        .oneshot(post_schedule("exclusive", None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = router
        .oneshot(post_schedule("exclusive", None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = json_body(second).await;
    assert_eq!(body["code"], "no_queue");
}

#[tokio::test]
async fn test_schedule_queue_full_is_too_many_requests() {
    let dir = tempfile::tempdir().unwrap();
    let defs = pipeline_set(vec![(
        "p",
        pipeline(
            1,
            Some(1),
            QueueStrategy::Append,
            vec![("work", task(&["sleep 0.5"], &[]))],
        ),
    )]);
    let rt = build_runtime(defs, None, dir.path()).await;
    let router = build_router(ApiState {
        runner: Arc::clone(&rt.runner),
        task_runner: Arc::clone(&rt.task_runner),
        output_store: Arc::clone(&rt.output_store),
        jwt_secret: SECRET.to_string(),
    });

    // One running, one queued, the third submission overflows.
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_schedule("p", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router.oneshot(post_schedule("p", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["code"], "queue_full");
}

#[tokio::test]
async fn test_list_pipelines_reports_status() {
    let (router, _rt, _dir) = test_state().await;

    let response = router.oneshot(get("/pipelines")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 2);
    // Name ascending.
    assert_eq!(list[0]["pipeline"], "demo");
    assert_eq!(list[1]["pipeline"], "exclusive");
    assert_eq!(list[0]["schedulable"], true);
    assert_eq!(list[0]["running"], false);
}

#[tokio::test]
async fn test_get_job_and_listing() {
    let (router, rt, _dir) = test_state().await;

    let job = rt
        .runner
        .schedule("demo", ScheduleOpts::default())
        .unwrap();
    let job = wait_for_terminal(&rt.runner, job.id, WAIT).await;

    let response = router
        .clone()
        .oneshot(get(&format!("/jobs/{}", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], job.id.to_string());
    assert_eq!(body["pipeline"], "demo");
    assert_eq!(body["completed"], true);
    assert_eq!(body["errored"], false);
    assert_eq!(body["tasks"][0]["name"], "greet");
    assert_eq!(body["tasks"][0]["status"], "done");

    let response = router.oneshot(get("/jobs")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_unknown_job_is_not_found() {
    let (router, _rt, _dir) = test_state().await;

    let response = router
        .clone()
        .oneshot(get(&format!("/jobs/{}", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router.oneshot(get("/jobs/not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_logs_are_served_from_the_output_store() {
    let (router, rt, _dir) = test_state().await;

    let job = rt
        .runner
        .schedule("demo", ScheduleOpts::default())
        .unwrap();
    let job = wait_for_terminal(&rt.runner, job.id, WAIT).await;

    let response = router
        .clone()
        .oneshot(get(&format!("/jobs/{}/logs?task=greet&stream=stdout", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello\n");

    // Unknown task name.
    let response = router
        .oneshot(get(&format!("/jobs/{}/logs?task=ghost&stream=stdout", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tail_of_finished_task_is_not_found() {
    let (router, rt, _dir) = test_state().await;

    let job = rt
        .runner
        .schedule("demo", ScheduleOpts::default())
        .unwrap();
    let job = wait_for_terminal(&rt.runner, job.id, WAIT).await;

    let response = router
        .oneshot(get(&format!("/jobs/{}/tail?task=greet", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tail_of_running_task_returns_buffered_lines() {
    let dir = tempfile::tempdir().unwrap();
    let defs = pipeline_set(vec![(
        "slow",
        pipeline(
            1,
            None,
            QueueStrategy::Append,
            vec![("work", task(&["echo live-line; sleep 2"], &[]))],
        ),
    )]);
    let rt = build_runtime(defs, None, dir.path()).await;
    let router = build_router(ApiState {
        runner: Arc::clone(&rt.runner),
        task_runner: Arc::clone(&rt.task_runner),
        output_store: Arc::clone(&rt.output_store),
        jwt_secret: SECRET.to_string(),
    });

    let job = rt.runner.schedule("slow", ScheduleOpts::default()).unwrap();

    // Poll the endpoint until the first line is buffered.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let response = router
            .clone()
            .oneshot(get(&format!("/jobs/{}/tail?task=work", job.id)))
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            let body = json_body(response).await;
            if body["stdout"][0] == "live-line" {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tail never showed live output"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    rt.task_runner.cancel();
    wait_for_terminal(&rt.runner, job.id, WAIT).await;
}
