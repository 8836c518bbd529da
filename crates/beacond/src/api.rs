//! HTTP API: users CRUD plus health probes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use beacon_core::{CreateUserRequest, UpdateUserRequest, User, ValidationError};
use serde::Serialize;
use tokio_postgres::error::SqlState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::store::{StoreError, UserStore};

/// Shared state for request handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn UserStore>,
}

/// Build the application router.
pub fn router(state: ApiState, frontend_url: &str) -> Router {
    let cors = match frontend_url.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            warn!(frontend_url, "invalid frontend origin, allowing any");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    Router::new()
        .route("/ping/liveness", get(liveness))
        .route("/ping/readiness", get(readiness))
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body shape shared by all endpoints.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Handler-level error mapped onto a status code and an error body.
#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Validation(String),
    Conflict(String),
    Internal,
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        if let StoreError::Db(db) = &e {
            if db.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                return ApiError::Conflict("email already in use".into());
            }
        }
        error!("store error: {e}");
        ApiError::Internal
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.to_owned()),
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_owned(),
            ),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct PongResponse {
    message: &'static str,
}

async fn liveness() -> Json<PongResponse> {
    Json(PongResponse { message: "pong" })
}

async fn readiness(State(state): State<ApiState>) -> Result<Json<PongResponse>, Response> {
    match state.store.ping().await {
        Ok(()) => Ok(Json(PongResponse { message: "pong" })),
        Err(e) => {
            error!("readiness probe failed: {e}");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "database not ready".into(),
                }),
            )
                .into_response())
        }
    }
}

async fn list_users(State(state): State<ApiState>) -> Result<Json<Vec<User>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

async fn get_user(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    match state.store.get(id).await? {
        Some(user) => Ok(Json(user)),
        None => Err(ApiError::NotFound("user not found")),
    }
}

async fn create_user(
    State(state): State<ApiState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    req.validate()?;
    let user = state.store.create(&req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    req.validate()?;
    match state.store.update(id, &req).await? {
        Some(user) => Ok(Json(user)),
        None => Err(ApiError::NotFound("user not found")),
    }
}

async fn delete_user(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("user not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryUserStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_app() -> Router {
        let state = ApiState {
            store: Arc::new(MemoryUserStore::default()),
        };
        router(state, "http://localhost:5174")
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_liveness() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/ping/liveness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["message"], "pong");
    }

    #[tokio::test]
    async fn test_list_users_empty() {
        let response = test_app()
            .oneshot(Request::builder().uri("/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_create_then_get_user() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/users",
                serde_json::json!({
                    "email": "alice@example.com",
                    "name": "Alice",
                    "password": "correct-horse"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response.into_response()).await;
        assert_eq!(created["email"], "alice@example.com");
        assert_eq!(created["role"], "user");
        assert!(created.get("password").is_none());

        let id = created["id"].as_i64().unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/users/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_user_invalid_body() {
        let response = test_app()
            .oneshot(json_request(
                "POST",
                "/users",
                serde_json::json!({
                    "email": "no-at-sign",
                    "name": "Alice",
                    "password": "correct-horse"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response.into_response()).await;
        assert!(body["error"].as_str().unwrap().contains("email"));
    }

    #[tokio::test]
    async fn test_get_missing_user_is_404() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/users/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["error"], "user not found");
    }

    #[tokio::test]
    async fn test_update_user() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/users",
                serde_json::json!({
                    "email": "alice@example.com",
                    "name": "Alice",
                    "password": "correct-horse"
                }),
            ))
            .await
            .unwrap();
        let id = body_json(response.into_response()).await["id"]
            .as_i64()
            .unwrap();

        let response = app
            .oneshot(json_request(
                "PUT",
                &format!("/users/{id}"),
                serde_json::json!({ "name": "Alice Cooper", "status": "inactive" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["name"], "Alice Cooper");
        assert_eq!(body["status"], "inactive");
    }

    #[tokio::test]
    async fn test_update_missing_user_is_404() {
        let response = test_app()
            .oneshot(json_request(
                "PUT",
                "/users/999",
                serde_json::json!({ "name": "Nobody" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_user() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/users",
                serde_json::json!({
                    "email": "alice@example.com",
                    "name": "Alice",
                    "password": "correct-horse"
                }),
            ))
            .await
            .unwrap();
        let id = body_json(response.into_response()).await["id"]
            .as_i64()
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/users/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/users/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
