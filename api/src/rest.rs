use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::auth::Authenticator;
use crate::errors::{AuthError, Error, ValidationError};
use crate::ingest::Ingestor;
use crate::model::{
    utc, AccessToken, Identity, LoginRequest, Measurement, MeasurementFilter, MeasurementPatch,
    NewMeasurement, NewSensorRequest, NewSeries, PasswordChangeRequest, Role, Sensor, SensorRead,
    SensorReading, SensorWithKey, Series, SeriesPatch,
};
use crate::sensors::SensorRegistry;
use crate::store::Store;

pub const SENSOR_KEY_HEADER: &str = "x-sensor-key";
const TOTAL_COUNT_HEADER: &str = "x-total-count";
const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<Authenticator>,
    pub sensors: Arc<SensorRegistry>,
    pub ingest: Arc<Ingestor>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, auth: Authenticator) -> Self {
        Self {
            sensors: Arc::new(SensorRegistry::new(store.clone())),
            ingest: Arc::new(Ingestor::new(store.clone())),
            auth: Arc::new(auth),
            store,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login_json))
        .route("/auth/token", post(login_form))
        .route("/auth/change-password", post(change_password))
        .route("/series", get(list_series).post(create_series))
        .route(
            "/series/:id",
            get(get_series)
                .put(replace_series)
                .patch(patch_series)
                .delete(delete_series),
        )
        .route(
            "/measurements",
            get(list_measurements).post(create_measurement),
        )
        .route("/measurements/from-sensor", post(ingest_from_sensor))
        .route(
            "/measurements/:id",
            put(replace_measurement)
                .patch(patch_measurement)
                .delete(delete_measurement),
        )
        .route("/sensors", get(list_sensors).post(create_sensor))
        .fallback(not_found)
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn client_identity(connect_info: Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Any authenticated user.
pub struct CurrentUser(pub Identity);

/// An authenticated user holding the admin role.
pub struct AdminUser(pub Identity);

/// A sensor authenticated by its API key.
pub struct SensorAuth(pub Sensor);

async fn authorize(parts: &Parts, state: &AppState, role: Option<Role>) -> Result<Identity, AppError> {
    let token = bearer_token(&parts.headers).ok_or(AuthError::Unauthenticated)?;
    Ok(state.auth.authorize(token, role).await?)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize(parts, state, None).await.map(CurrentUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authorize(parts, state, Some(Role::Admin)).await.map(AdminUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for SensorAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(SENSOR_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Ok(SensorAuth(state.sensors.resolve(key).await?))
    }
}

/// `Json` whose rejection uses the API error body.
pub struct ApiJson<T>(pub T);

/// `Form` whose rejection uses the API error body.
pub struct ApiForm<T>(pub T);

/// `Path` whose rejection uses the API error body.
pub struct ApiPath<T>(pub T);

/// `Query` whose rejection uses the API error body.
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(AppError::Rejected(rejection.body_text())),
        }
    }
}

#[async_trait]
impl<T, S> FromRequest<S> for ApiForm<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Form::<T>::from_request(req, state).await {
            Ok(Form(value)) => Ok(ApiForm(value)),
            Err(rejection) => Err(AppError::Rejected(rejection.body_text())),
        }
    }
}

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(ApiPath(value)),
            Err(rejection) => Err(AppError::Rejected(rejection.body_text())),
        }
    }
}

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(AppError::Rejected(rejection.body_text())),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" }))).into_response()
}

async fn login_json(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<Json<AccessToken>, AppError> {
    let client = client_identity(connect_info);
    let token = state.auth.login(&body.username, &body.password, &client).await?;
    Ok(Json(token))
}

/// OAuth2 password-grant style login (`application/x-www-form-urlencoded`).
async fn login_form(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ApiForm(body): ApiForm<LoginRequest>,
) -> Result<Json<AccessToken>, AppError> {
    let client = client_identity(connect_info);
    let token = state.auth.login(&body.username, &body.password, &client).await?;
    Ok(Json(token))
}

async fn change_password(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    ApiJson(body): ApiJson<PasswordChangeRequest>,
) -> Result<StatusCode, AppError> {
    state
        .auth
        .change_password(&identity, &body.old_password, &body.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_series(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    ApiQuery(params): ApiQuery<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);

    let (rows, total) = state.store.list_series(limit, offset).await?;
    Ok(([(TOTAL_COUNT_HEADER, total.to_string())], Json(rows)))
}

async fn get_series(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Series>, AppError> {
    let series = state
        .store
        .get_series(id)
        .await?
        .ok_or_else(|| ValidationError::series_not_found(id))?;
    Ok(Json(series))
}

async fn create_series(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiJson(body): ApiJson<NewSeries>,
) -> Result<(StatusCode, Json<Series>), AppError> {
    let series = state.ingest.create_series(body).await?;
    Ok((StatusCode::CREATED, Json(series)))
}

async fn replace_series(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<NewSeries>,
) -> Result<Json<Series>, AppError> {
    Ok(Json(state.ingest.replace_series(id, body).await?))
}

async fn patch_series(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<SeriesPatch>,
) -> Result<Json<Series>, AppError> {
    Ok(Json(state.ingest.patch_series(id, body).await?))
}

async fn delete_series(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, AppError> {
    state.ingest.delete_series(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MeasurementQuery {
    series_id: Option<i64>,
    #[serde(default, deserialize_with = "utc::deserialize_option")]
    ts_from: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "utc::deserialize_option")]
    ts_to: Option<DateTime<Utc>>,
    // Older clients send `since` / `until`.
    #[serde(default, deserialize_with = "utc::deserialize_option")]
    since: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "utc::deserialize_option")]
    until: Option<DateTime<Utc>>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl From<MeasurementQuery> for MeasurementFilter {
    fn from(params: MeasurementQuery) -> Self {
        Self {
            series_id: params.series_id,
            ts_from: params.ts_from.or(params.since),
            ts_to: params.ts_to.or(params.until),
            limit: params.limit.unwrap_or(200).clamp(1, 1000),
            offset: params.offset.unwrap_or(0).max(0),
        }
    }
}

async fn list_measurements(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
    ApiQuery(params): ApiQuery<MeasurementQuery>,
) -> Result<Json<Vec<Measurement>>, AppError> {
    let filter = MeasurementFilter::from(params);
    Ok(Json(state.store.list_measurements(&filter).await?))
}

async fn create_measurement(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiJson(body): ApiJson<NewMeasurement>,
) -> Result<(StatusCode, Json<Measurement>), AppError> {
    let measurement = state.ingest.create_measurement(body).await?;
    Ok((StatusCode::CREATED, Json(measurement)))
}

async fn replace_measurement(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<NewMeasurement>,
) -> Result<Json<Measurement>, AppError> {
    Ok(Json(state.ingest.replace_measurement(id, body).await?))
}

async fn patch_measurement(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<MeasurementPatch>,
) -> Result<Json<Measurement>, AppError> {
    Ok(Json(state.ingest.patch_measurement(id, body).await?))
}

async fn delete_measurement(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, AppError> {
    state.ingest.delete_measurement(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_from_sensor(
    State(state): State<AppState>,
    SensorAuth(sensor): SensorAuth,
    ApiJson(body): ApiJson<SensorReading>,
) -> Result<(StatusCode, Json<Measurement>), AppError> {
    let measurement = state.ingest.ingest_from_sensor(&sensor, body).await?;
    Ok((StatusCode::CREATED, Json(measurement)))
}

async fn list_sensors(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
) -> Result<Json<Vec<SensorRead>>, AppError> {
    let sensors = state.store.list_sensors().await?;
    Ok(Json(sensors.iter().map(SensorRead::from).collect()))
}

async fn create_sensor(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    ApiJson(body): ApiJson<NewSensorRequest>,
) -> Result<(StatusCode, Json<SensorWithKey>), AppError> {
    let sensor = state.sensors.register(body).await?;
    Ok((StatusCode::CREATED, Json(SensorWithKey::from(sensor))))
}

fn auth_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::InvalidCredentials
        | AuthError::Unauthenticated
        | AuthError::UnknownSensorKey
        | AuthError::InvalidToken
        | AuthError::ExpiredToken
        | AuthError::MalformedToken => StatusCode::UNAUTHORIZED,
        AuthError::IncorrectPassword => StatusCode::BAD_REQUEST,
        AuthError::Forbidden => StatusCode::FORBIDDEN,
        AuthError::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
    }
}

fn validation_status(err: &ValidationError) -> StatusCode {
    match err {
        ValidationError::OutOfRange { .. }
        | ValidationError::InvalidRange { .. }
        | ValidationError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ValidationError::NotFound { .. } => StatusCode::NOT_FOUND,
    }
}

/// Bearer-token failures advertise the scheme to the client.
fn wants_bearer_challenge(err: &AuthError) -> bool {
    matches!(
        err,
        AuthError::Unauthenticated
            | AuthError::InvalidToken
            | AuthError::ExpiredToken
            | AuthError::MalformedToken
    )
}

pub enum AppError {
    Service(Error),
    /// The request could not be extracted (bad JSON, path or query).
    Rejected(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = match self {
            AppError::Service(err) => err,
            AppError::Rejected(details) => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": "Validation error", "details": details })),
                )
                    .into_response();
            }
        };

        let (status, message, challenge) = match &err {
            Error::Auth(e) => (auth_status(e), e.to_string(), wants_bearer_challenge(e)),
            Error::Validation(e) => (validation_status(e), e.to_string(), false),
            other => {
                error!("API error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    false,
                )
            }
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self::Service(err.into())
    }
}
