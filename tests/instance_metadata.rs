use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get},
};
use runq::core::instance::{GceInstanceController, InstanceController, MetadataClient};
use serde_json::json;

#[derive(Clone, Default)]
struct Recorded {
    deletes: Arc<Mutex<Vec<(String, String)>>>,
}

fn flavored(headers: &HeaderMap) -> bool {
    headers
        .get("metadata-flavor")
        .is_some_and(|v| v == "Google")
}

async fn text(headers: HeaderMap, value: &'static str) -> (StatusCode, String) {
    if flavored(&headers) {
        (StatusCode::OK, value.to_string())
    } else {
        (StatusCode::FORBIDDEN, "missing Metadata-Flavor".to_string())
    }
}

async fn delete_instance(
    State(recorded): State<Recorded>,
    Path((project, zone, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    recorded
        .deletes
        .lock()
        .unwrap()
        .push((format!("{project}/{zone}/{name}"), auth));
    StatusCode::OK
}

/// Serves the metadata endpoints and the compute delete call.
async fn spawn_server(zone: &'static str) -> (String, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/computeMetadata/v1/project/project-id",
            get(|h: HeaderMap| text(h, "my-project")),
        )
        .route(
            "/computeMetadata/v1/instance/name",
            get(|h: HeaderMap| text(h, "worker-7\n")),
        )
        .route(
            "/computeMetadata/v1/instance/zone",
            get(move |h: HeaderMap| text(h, zone)),
        )
        .route(
            "/computeMetadata/v1/instance/service-accounts/default/token",
            get(|h: HeaderMap| async move {
                if flavored(&h) {
                    Ok(Json(json!({
                        "access_token": "tok-123",
                        "expires_in": 3599,
                        "token_type": "Bearer"
                    })))
                } else {
                    Err(StatusCode::FORBIDDEN)
                }
            }),
        )
        .route(
            "/compute/v1/projects/{project}/zones/{zone}/instances/{name}",
            delete(delete_instance),
        )
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), recorded)
}

#[tokio::test]
async fn metadata_values_are_read_with_flavor_header() {
    let (base, _) = spawn_server("projects/123456/zones/us-central1-b").await;
    let metadata = MetadataClient::new(&format!("{base}/computeMetadata/v1/"));

    assert_eq!(metadata.project_id().await.unwrap(), "my-project");
    assert_eq!(metadata.instance_name().await.unwrap(), "worker-7");
    assert_eq!(metadata.zone().await.unwrap(), "us-central1-b");
    assert_eq!(metadata.access_token().await.unwrap(), "tok-123");
}

#[tokio::test]
async fn self_terminate_deletes_this_instance() {
    let (base, recorded) = spawn_server("projects/123456/zones/europe-west1-d").await;
    let controller = GceInstanceController::new(
        MetadataClient::new(&format!("{base}/computeMetadata/v1")),
        &format!("{base}/compute/v1"),
    );

    controller.self_terminate().await.unwrap();

    let deletes = recorded.deletes.lock().unwrap().clone();
    assert_eq!(
        deletes,
        vec![(
            "my-project/europe-west1-d/worker-7".to_string(),
            "Bearer tok-123".to_string()
        )]
    );
}

#[tokio::test]
async fn failed_delete_is_an_error() {
    let (base, _) = spawn_server("projects/1/zones/z").await;
    let controller = GceInstanceController::new(
        MetadataClient::new(&format!("{base}/computeMetadata/v1")),
        &format!("{base}/nowhere"),
    );

    assert!(controller.self_terminate().await.is_err());
}
