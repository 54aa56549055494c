//! Router-level tests: submission validation, status projection,
//! cancellation, uploads, requests, and discovery, all against an
//! isolated store with no worker pool attached, so rows stay exactly
//! where the handlers leave them.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

use fednode::admission::AdmissionController;
use fednode::api;
use fednode::api::state::AppState;
use fednode::catalog::ManifestResolver;
use fednode::config::{Config, SandboxMode};
use fednode::observability::Metrics;
use fednode::queue;
use fednode::sandbox::Runner;
use fednode::store::Store;
use fednode::worker::WorkerContext;
use fednode::workspace::WorkspaceBuilder;

struct TestApp {
    app: Router,
    store: Store,
    // Keeps the queue open; nothing consumes it, so admitted jobs stay
    // queued.
    _receiver: queue::JobReceiver,
    _temp: TempDir,
}

/// Assemble the router with isolated dependencies and NO workers, so
/// admitted jobs stay `queued`.
async fn build_test_app(queue_capacity: usize) -> TestApp {
    let temp = TempDir::new().expect("temp dir");
    let data_root = temp.path().join("data");
    fs::create_dir_all(&data_root).unwrap();

    fs::write(
        data_root.join("subjects.csv"),
        "subject,age\ns1,40\ns2,50\ns3,45\n",
    )
    .unwrap();
    let manifest = json!({
        "catalogs": [
            {
                "id": "clinical_v1",
                "name": "Clinical Outcomes",
                "description": "subject-level outcomes",
                "privacy_level": "restricted",
                "files": [{"name": "subjects", "path": "subjects.csv", "type": "csv"}]
            },
            {
                "id": "tiny_v1",
                "name": "Tiny Pilot",
                "min_cohort_size": 10,
                "files": [{"name": "subjects", "path": "subjects.csv", "type": "csv"}]
            }
        ]
    });
    let manifest_path = data_root.join("data_manifest.json");
    fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();

    let mut config = Config::default();
    config.node.node_id = "test-node".to_string();
    config.server.store_path = temp.path().join("store");
    config.data.data_root = data_root.clone();
    config.data.work_dir = temp.path().join("work");
    config.data.uploads_dir = temp.path().join("uploads");
    config.execution.backend = SandboxMode::Subprocess;
    config.execution.queue_capacity = queue_capacity;
    config.privacy.min_cohort_size = 2;
    let config = Arc::new(config);

    let store = Store::open(&config.server.store_path).unwrap();
    let resolver = ManifestResolver::new(manifest_path, data_root);
    let metrics = Arc::new(Metrics::new());
    let runner = Arc::new(
        Runner::initialize(&config.execution, config.data.data_root.clone()).await,
    );

    let (job_queue, receiver) = queue::channel(config.execution.queue_capacity);

    let worker_ctx = Arc::new(WorkerContext {
        store: store.clone(),
        resolver: resolver.clone(),
        privacy: config.privacy.clone(),
        workspaces: WorkspaceBuilder::new(
            config.data.work_dir.clone(),
            config.data.data_root.clone(),
        ),
        runner,
        metrics: metrics.clone(),
        node_id: config.node.node_id.clone(),
        audit_enabled: true,
    });

    let admission = Arc::new(AdmissionController::new(
        &config,
        store.clone(),
        resolver.clone(),
        job_queue,
        metrics.clone(),
    ));

    let state = AppState::new(
        config,
        store.clone(),
        resolver,
        admission,
        worker_ctx,
        metrics,
    );

    TestApp {
        app: api::build_router(state),
        store,
        _receiver: receiver,
        _temp: temp,
    }
}

fn submission_body() -> Value {
    json!({
        "target_node_id": "test-node",
        "data_catalog": "clinical_v1",
        "script_kind": "python",
        "script_content": "from data_loader import load_data, save_results\nsave_results({'sample_size': 3})\n",
        "parameters": {"alpha": 0.05},
        "filters": {}
    })
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn submit_job_accepted_and_queued() {
    let test = build_test_app(8).await;

    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &submission_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = response_json(response).await;
    assert_eq!(body["status"], json!("submitted"));
    let job_id: uuid::Uuid = body["job_id"].as_str().unwrap().parse().unwrap();

    // Exactly one row exists with the returned id, still queued.
    let job = test.store.get_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, fednode::job::JobStatus::Queued);
    assert_eq!(job.script_hash, fednode::job::script_hash(&job.script_content));

    // The view reflects it.
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view = response_json(response).await;
    assert_eq!(view["status"], json!("queued"));
    assert_eq!(view["catalog_id"], json!("clinical_v1"));

    // The admission audit row is visible on the job's trail.
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{job_id}/audit"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let trail = response_json(response).await;
    assert_eq!(trail[0]["action"], json!("job_submitted"));
}

#[tokio::test]
async fn submit_rejects_unknown_catalog_kind_and_node() {
    let test = build_test_app(8).await;

    let mut bad_catalog = submission_body();
    bad_catalog["data_catalog"] = json!("nonexistent");
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &bad_catalog))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut bad_kind = submission_body();
    bad_kind["script_kind"] = json!("perl");
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &bad_kind))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // sql is a known kind but not in the default allow-list.
    let mut not_allowed = submission_body();
    not_allowed["script_kind"] = json!("sql");
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &not_allowed))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let mut bad_node = submission_body();
    bad_node["target_node_id"] = json!("unknown-node");
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &bad_node))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // No rows created for any refusal.
    assert!(test.store.list_jobs(None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn submit_rejects_oversize_script() {
    let test = build_test_app(8).await;

    let mut oversize = submission_body();
    oversize["script_content"] = json!("x = 1\n".repeat(100_000));
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &oversize))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn full_queue_returns_service_unavailable() {
    let test = build_test_app(1).await;

    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &submission_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &submission_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response_json(response).await;
    assert_eq!(body["code"], json!("OVERLOADED"));
}

#[tokio::test]
async fn get_job_not_found() {
    let test = build_test_app(8).await;
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{}", uuid::Uuid::now_v7()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_jobs_newest_first_with_status_filter() {
    let test = build_test_app(8).await;

    let first = response_json(
        test.app
            .clone()
            .oneshot(post_json("/api/v1/jobs", &submission_body()))
            .await
            .unwrap(),
    )
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = response_json(
        test.app
            .clone()
            .oneshot(post_json("/api/v1/jobs", &submission_body()))
            .await
            .unwrap(),
    )
    .await;

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs?status=queued&limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = response_json(response).await;
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["job_id"], second["job_id"]);
    assert_eq!(list[1]["job_id"], first["job_id"]);

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/jobs?status=bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_queued_job_is_idempotent() {
    let test = build_test_app(8).await;

    let submitted = response_json(
        test.app
            .clone()
            .oneshot(post_json("/api/v1/jobs", &submission_body()))
            .await
            .unwrap(),
    )
    .await;
    let job_id = submitted["job_id"].as_str().unwrap();

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{job_id}"))
                .method("DELETE")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], json!("cancelled"));

    // Second cancel: stable no-op message, no mutation.
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{job_id}"))
                .method("DELETE")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], json!("cancelled"));
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("nothing to cancel")
    );

    let row = test
        .store
        .get_job(&job_id.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(row.status, fednode::job::JobStatus::Cancelled);
}

#[tokio::test]
async fn completed_rows_below_threshold_project_as_blocked() {
    let test = build_test_app(8).await;

    // Simulate a row that completed before the catalog's threshold
    // applied: tiny_v1 overrides min cohort to 10.
    let job = fednode::job::Job::new(fednode::job::NewJob {
        script_kind: fednode::job::ScriptKind::Python,
        script_content: "save_results({})".to_string(),
        catalog_id: "tiny_v1".to_string(),
        parameters: json!({}),
        filters: json!({}),
        uploaded_file_ids: vec![],
        requester_node_id: "remote".to_string(),
        executor_node_id: "test-node".to_string(),
        analysis_request_id: None,
    });
    test.store.insert_job(&job).unwrap();
    test.store.set_running(&job.job_id).unwrap();
    test.store
        .set_completed(&job.job_id, json!({"age_mean": 45.2}), 0.2, None, Some(3))
        .unwrap();

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/jobs/{}", job.job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let view = response_json(response).await;
    assert_eq!(view["status"], json!("blocked"));
    let message = view["result_data"]["message"].as_str().unwrap();
    assert!(message.contains("cohort size (3)"));
    assert!(message.contains("minimum (10)"));
    assert!(view["result_data"].get("age_mean").is_none());
}

#[tokio::test]
async fn uploads_enforce_extension_allow_lists() {
    let test = build_test_app(8).await;

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/uploads/data?filename=my_csv.csv")
                .method("POST")
                .body(Body::from("a,b,c\n1,2,3\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let upload = response_json(response).await;
    assert_eq!(upload["kind"], json!("csv"));
    let file_id = upload["file_id"].as_str().unwrap().to_string();

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/uploads/scripts?filename=run.sh")
                .method("POST")
                .body(Body::from("echo hi"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // A submission may reference the staged file.
    let mut with_upload = submission_body();
    with_upload["uploaded_file_ids"] = json!([file_id]);
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &with_upload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // But not an unknown one.
    let mut bad_upload = submission_body();
    bad_upload["uploaded_file_ids"] = json!([uuid::Uuid::now_v7()]);
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &bad_upload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn discovery_endpoints_report_identity_and_catalogs() {
    let test = build_test_app(8).await;

    let response = test
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = response_json(response).await;
    assert_eq!(health["status"], json!("healthy"));
    assert!(health["components"]["store"].is_string());
    assert!(health["components"]["manifest"].is_string());

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/node")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let info = response_json(response).await;
    assert_eq!(info["node_id"], json!("test-node"));
    assert_eq!(info["total_jobs"], json!(0));

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/catalogs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let catalogs = response_json(response).await;
    let catalogs = catalogs.as_array().unwrap();
    assert_eq!(catalogs.len(), 2);
    // The resolver filled in inferred columns and record counts.
    assert_eq!(catalogs[0]["files"][0]["record_count"], json!(3));
}

#[tokio::test]
async fn peer_node_registration_widens_admission() {
    let test = build_test_app(8).await;

    let response = test
        .app
        .clone()
        .oneshot(post_json(
            "/api/v1/nodes",
            &json!({
                "node_id": "site-b",
                "name": "Site B",
                "institution": "Hospital B",
                "endpoint_url": "https://site-b.example.org"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut to_peer = submission_body();
    to_peer["target_node_id"] = json!("site-b");
    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/jobs", &to_peer))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn analysis_request_approval_admits_a_job() {
    let test = build_test_app(8).await;

    let request_body = json!({
        "requester_name": "A. Researcher",
        "requester_institution": "Example University",
        "requester_email": "a@example.edu",
        "analysis_title": "Age distribution",
        "analysis_description": "Mean age across the cohort",
        "target_node_id": "test-node",
        "data_catalog": "clinical_v1",
        "script_kind": "python",
        "script_content": "from data_loader import save_results\nsave_results({'sample_size': 3})\n"
    });

    let response = test
        .app
        .clone()
        .oneshot(post_json("/api/v1/requests", &request_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = response_json(response).await;
    assert_eq!(created["status"], json!("pending"));
    let request_id = created["request_id"].as_str().unwrap().to_string();

    let response = test
        .app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/requests/{request_id}/approve"),
            &json!({"decided_by": "admin", "notes": "fine"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let approved = response_json(response).await;
    let job_id: uuid::Uuid = approved["job_id"].as_str().unwrap().parse().unwrap();

    let job = test.store.get_job(&job_id).unwrap().unwrap();
    assert_eq!(
        job.analysis_request_id,
        Some(request_id.parse().unwrap())
    );

    // A decided request cannot be decided again.
    let response = test
        .app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/requests/{request_id}/deny"),
            &json!({"decided_by": "admin"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
