use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use measurements_api::auth::Authenticator;
use measurements_api::model::Role;
use measurements_api::password::PasswordHasher;
use measurements_api::rate_limit::{InMemoryRateLimiter, RateLimitConfig};
use measurements_api::rest::{create_router, AppState, SENSOR_KEY_HEADER};
use measurements_api::store::{MemoryStore, Store};
use measurements_api::token::TokenIssuer;

async fn test_app() -> Router {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let auth = Authenticator::new(
        store.clone(),
        PasswordHasher::new(4, "test-pepper"),
        TokenIssuer::new(b"scenario-secret", chrono::Duration::minutes(60)),
        Arc::new(InMemoryRateLimiter::new(RateLimitConfig::default())),
    )
    .unwrap();
    auth.provision_user("admin", "admin123", Role::Admin)
        .await
        .unwrap();
    auth.provision_user("viewer", "viewer123", Role::Viewer)
        .await
        .unwrap();
    create_router(AppState::new(store, auth))
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn client(ip: &str) -> ConnectInfo<SocketAddr> {
    ConnectInfo(format!("{}:40000", ip).parse().unwrap())
}

async fn login_from(app: &Router, username: &str, password: &str, ip: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .extension(client(ip))
                .body(Body::from(
                    json!({ "username": username, "password": password }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn token_for(app: &Router, username: &str, password: &str) -> String {
    let response = login_from(app, username, password, "127.0.0.1").await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["access_token"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

async fn send_from_sensor(app: &Router, api_key: &str, body: Value) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/measurements/from-sensor")
                .header(header::CONTENT_TYPE, "application/json")
                .header(SENSOR_KEY_HEADER, api_key)
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn create_temperature_series(app: &Router, admin: &str) -> i64 {
    let response = send(
        app,
        "POST",
        "/series",
        Some(admin),
        Some(json!({ "name": "Temperature", "min_value": 15.0, "max_value": 30.0 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_i64().unwrap()
}

async fn register_sensor(app: &Router, admin: &str, series_id: i64) -> String {
    let response = send(
        app,
        "POST",
        "/sensors",
        Some(admin),
        Some(json!({ "name": "probe-1", "series_id": series_id })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["api_key"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let response = send(&app, "GET", "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_sensor_ingest_flow() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;
    let series_id = create_temperature_series(&app, &admin).await;
    let api_key = register_sensor(&app, &admin, series_id).await;

    let response = send_from_sensor(&app, &api_key, json!({ "value": 22.5 })).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["series_id"], series_id);
    assert_eq!(created["value"], 22.5);
    assert!(created["timestamp"].as_str().unwrap().ends_with('Z'));

    let response = send_from_sensor(
        &app,
        &api_key,
        json!({ "value": 16.0, "timestamp": "2024-05-01T14:00:00+02:00" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["timestamp"], "2024-05-01T12:00:00Z");

    let response = send_from_sensor(&app, &api_key, json!({ "value": 40.0 })).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body_json(response).await["error"].is_string());

    let response = send_from_sensor(&app, "not-a-real-key", json!({ "value": 22.5 })).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        "GET",
        &format!("/measurements?series_id={}", series_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    // Ascending by timestamp.
    assert_eq!(listed[0]["value"], 16.0);
}

#[tokio::test]
async fn test_measurement_time_window() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;
    let series_id = create_temperature_series(&app, &admin).await;

    for (value, ts) in [
        (20.0, "2024-01-01T00:00:00Z"),
        (21.0, "2024-01-02T00:00:00Z"),
        (22.0, "2024-01-03T00:00:00Z"),
    ] {
        let response = send(
            &app,
            "POST",
            "/measurements",
            Some(&admin),
            Some(json!({ "series_id": series_id, "value": value, "timestamp": ts })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = send(
        &app,
        "GET",
        "/measurements?ts_from=2024-01-02T00:00:00Z&ts_to=2024-01-02T23:59:59Z",
        Some(&admin),
        None,
    )
    .await;
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["value"], 21.0);

    let response = send(
        &app,
        "GET",
        "/measurements?since=2024-01-02T00:00:00Z",
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_login_rate_limit() {
    let app = test_app().await;

    for _ in 0..10 {
        let response = login_from(&app, "admin", "wrong", "10.0.0.1").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = login_from(&app, "admin", "admin123", "10.0.0.1").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = login_from(&app, "admin", "admin123", "10.0.0.2").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_form_login() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/auth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("grant_type=password&username=viewer&password=viewer123"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["token_type"], "bearer");
    assert!(body["access_token"].is_string());
}

#[tokio::test]
async fn test_viewer_reads_but_cannot_write() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;
    let viewer = token_for(&app, "viewer", "viewer123").await;
    create_temperature_series(&app, &admin).await;

    let response = send(
        &app,
        "POST",
        "/series",
        Some(&viewer),
        Some(json!({ "name": "Humidity", "min_value": 0.0, "max_value": 100.0 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, "GET", "/sensors", Some(&viewer), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, "GET", "/series", Some(&viewer), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-total-count").unwrap(), "1");
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_or_bad_token() {
    let app = test_app().await;

    let response = send(&app, "GET", "/series", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );

    let response = send(&app, "GET", "/series", Some("not.a.jwt"), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_series_validation() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;

    let response = send(
        &app,
        "POST",
        "/series",
        Some(&admin),
        Some(json!({ "name": "Backwards", "min_value": 30.0, "max_value": 15.0 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let series_id = create_temperature_series(&app, &admin).await;
    let response = send(
        &app,
        "PATCH",
        &format!("/series/{}", series_id),
        Some(&admin),
        Some(json!({ "min_value": 31.0 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = send(
        &app,
        "PATCH",
        &format!("/series/{}", series_id),
        Some(&admin),
        Some(json!({ "color": "#ff0000" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let patched = body_json(response).await;
    assert_eq!(patched["color"], "#ff0000");
    assert_eq!(patched["min_value"], 15.0);

    let response = send(&app, "GET", "/series/9999", Some(&admin), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cascade_delete() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;
    let series_id = create_temperature_series(&app, &admin).await;
    let api_key = register_sensor(&app, &admin, series_id).await;

    let response = send_from_sensor(&app, &api_key, json!({ "value": 20.0 })).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let uri = format!("/series/{}", series_id);
    let response = send(&app, "DELETE", &uri, Some(&admin), None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, "GET", &uri, Some(&admin), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        "GET",
        &format!("/measurements?series_id={}", series_id),
        Some(&admin),
        None,
    )
    .await;
    assert!(body_json(response).await.as_array().unwrap().is_empty());

    // The sensor went with its series.
    let response = send_from_sensor(&app, &api_key, json!({ "value": 20.0 })).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, "DELETE", &uri, Some(&admin), None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_change_password() {
    let app = test_app().await;
    let viewer = token_for(&app, "viewer", "viewer123").await;

    let response = send(
        &app,
        "POST",
        "/auth/change-password",
        Some(&viewer),
        Some(json!({ "old_password": "wrong", "new_password": "next-pass" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        "POST",
        "/auth/change-password",
        Some(&viewer),
        Some(json!({ "old_password": "viewer123", "new_password": "next-pass" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = login_from(&app, "viewer", "viewer123", "10.0.0.5").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = login_from(&app, "viewer", "next-pass", "10.0.0.5").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_sensor_listing_hides_keys() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;
    let series_id = create_temperature_series(&app, &admin).await;
    register_sensor(&app, &admin, series_id).await;

    let response = send(&app, "GET", "/sensors", Some(&admin), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let sensors = body_json(response).await;
    assert_eq!(sensors.as_array().unwrap().len(), 1);
    assert!(sensors[0].get("api_key").is_none());
}

async fn assert_validation_body(response: Response) {
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body = body_json(response).await;
    assert_eq!(body["error"], "Validation error");
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn test_malformed_requests_get_json_errors() {
    let app = test_app().await;
    let admin = token_for(&app, "admin", "admin123").await;
    let series_id = create_temperature_series(&app, &admin).await;

    // Missing timestamp.
    let response = send(
        &app,
        "POST",
        "/measurements",
        Some(&admin),
        Some(json!({ "series_id": series_id, "value": 20.0 })),
    )
    .await;
    assert_validation_body(response).await;

    let response = send(
        &app,
        "POST",
        "/measurements",
        Some(&admin),
        Some(json!({ "series_id": series_id, "value": 20.0, "timestamp": "not-a-time" })),
    )
    .await;
    assert_validation_body(response).await;

    let response = send(&app, "GET", "/series/abc", Some(&admin), None).await;
    assert_validation_body(response).await;

    let response = send(&app, "GET", "/measurements?limit=abc", Some(&admin), None).await;
    assert_validation_body(response).await;

    let response = send(&app, "GET", "/measurements?ts_from=yesterday", Some(&admin), None).await;
    assert_validation_body(response).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/series")
                .header(header::AUTHORIZATION, format!("Bearer {}", admin))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{\"name\": "))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_validation_body(response).await;
}

#[tokio::test]
async fn test_unknown_route_is_json_not_found() {
    let app = test_app().await;
    let response = send(&app, "GET", "/no-such-route", None, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "Not Found");
}
