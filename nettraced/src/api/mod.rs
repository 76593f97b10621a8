//! HTTP API surface: a thin, 1:1 translation of external requests into
//! Task Registry / Tracing Task operations. This is the only module that
//! knows about HTTP; everything else in the crate is
//! transport-agnostic.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream;
use nettrace_common::{
    DaemonInfoResponse, IdResponse, ListTracingTasksResponse, TracingTaskOptions, TracingTaskResponse,
};

use crate::error::{ApiError, TaskError};
use crate::registry::TaskRegistry;

/// Explicit daemon context passed to every handler, rather than an ambient
/// global singleton. Tests construct their own instance.
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/tracing_tasks", get(list_tasks).post(create_task))
        .route("/tracing_tasks/{id}", get(get_task).delete(remove_task))
        .route("/tracing_tasks/{id}/events", get(stream_events))
        .with_state(state)
}

async fn index() -> Json<DaemonInfoResponse> {
    Json(DaemonInfoResponse {
        name: "nettraced".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<ListTracingTasksResponse> {
    let tasks = state
        .registry
        .list()
        .into_iter()
        .map(|(id, options)| TracingTaskResponse { id, options })
        .collect();
    Json(tasks)
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(options): Json<TracingTaskOptions>,
) -> Result<Json<IdResponse>, ApiError> {
    let id = state.registry.create(options)?;
    Ok(Json(IdResponse { id }))
}

async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<TracingTaskResponse>, ApiError> {
    let task = state.registry.get(&id).ok_or_else(|| TaskError::NotFound(id.clone()))?;
    Ok(Json(TracingTaskResponse {
        id,
        options: task.options().clone(),
    }))
}

async fn remove_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.registry.remove(&id).map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Streams `application/json-lines+json`: one JSON `TracingEvent` per line,
/// connection held open indefinitely. Closing the connection drops the
/// `Subscription`, which removes it from the bus.
async fn stream_events(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let task = state.registry.get(&id).ok_or_else(|| TaskError::NotFound(id.clone()))?;
    let subscription = task.subscribe();

    let body_stream = stream::unfold(subscription, move |mut sub| async move {
        let event = sub.next().await?;
        let mut line = serde_json::to_string(&event).unwrap_or_default();
        line.push('\n');
        Some((Ok::<_, std::io::Error>(line), sub))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json-lines+json; charset=utf-8")
        .body(Body::from_stream(body_stream))
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::KernelClock;
    use crate::probes::ProbeRegistry;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let registry = Arc::new(TaskRegistry::new(Arc::new(ProbeRegistry::default()), Arc::new(KernelClock::new())));
        router(Arc::new(AppState { registry }))
    }

    #[tokio::test]
    async fn index_reports_daemon_name() {
        let response = test_router().oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let info: DaemonInfoResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(info.name, "nettraced");
    }

    #[tokio::test]
    async fn unknown_task_id_returns_404_with_message() {
        let response = test_router()
            .oneshot(Request::builder().uri("/tracing_tasks/does-not-exist").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["message"].as_str().unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn unknown_probe_type_returns_4xx() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tracing_tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"probes":{"no_such":{}}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn create_list_get_delete_round_trip() {
        let router = test_router();

        let create_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tracing_tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"probes":{"demo":{"interval":1.0}}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create_response.status(), StatusCode::OK);
        let body = to_bytes(create_response.into_body(), usize::MAX).await.unwrap();
        let id_response: IdResponse = serde_json::from_slice(&body).unwrap();

        let get_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/tracing_tasks/{}", id_response.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(get_response.status(), StatusCode::OK);

        let delete_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/tracing_tasks/{}", id_response.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(delete_response.status(), StatusCode::NO_CONTENT);

        let after_delete = router
            .oneshot(
                Request::builder()
                    .uri(format!("/tracing_tasks/{}", id_response.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(after_delete.status(), StatusCode::NOT_FOUND);
    }
}
