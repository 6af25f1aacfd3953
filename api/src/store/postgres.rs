use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, error, info, warn};

use super::Store;
use crate::errors::{Error, Result, ValidationError};
use crate::model::{
    CascadeReport, Measurement, MeasurementFilter, NewMeasurement, NewSensor, NewSeries, NewUser,
    Role, Sensor, Series, User,
};

const SERIES_BOUNDS_CONSTRAINT: &str = "series_bounds_check";
const MAX_INSERT_ATTEMPTS: u32 = 5;

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    role: String,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self> {
        let role: Role = row.role.parse().map_err(Error::Internal)?;
        Ok(User {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role,
        })
    }
}

/// Postgres-backed store. Foreign keys do not cascade; dependents are
/// removed explicitly inside `delete_series_cascade`'s transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_measurement(&self, measurement: &NewMeasurement) -> Result<Measurement> {
        let row = sqlx::query_as::<_, Measurement>(
            r#"
            INSERT INTO measurements (series_id, value, ts)
            VALUES ($1, $2, $3)
            RETURNING id, series_id, value, ts AS timestamp
            "#,
        )
        .bind(measurement.series_id)
        .bind(measurement.value)
        .bind(measurement.timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_series_fk(e, measurement.series_id))?;

        Ok(row)
    }
}

/// A foreign key violation means the series vanished after validation.
fn map_series_fk(err: sqlx::Error, series_id: i64) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_foreign_key_violation() {
            return ValidationError::series_not_found(series_id).into();
        }
    }
    err.into()
}

fn map_bounds_check(err: sqlx::Error, min: f64, max: f64) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.constraint() == Some(SERIES_BOUNDS_CONSTRAINT) {
            return ValidationError::InvalidRange { min, max }.into();
        }
    }
    err.into()
}

fn map_unique_username(err: sqlx::Error, username: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return ValidationError::Invalid(format!("User '{}' already exists", username)).into();
        }
    }
    err.into()
}

/// Only failures raised before the statement reaches the server are
/// retried. An I/O error mid-query may follow a committed insert.
fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, role FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (username, password_hash, role)
            VALUES ($1, $2, $3)
            RETURNING id, username, password_hash, role
            "#,
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_username(e, &user.username))?;

        User::try_from(row)
    }

    async fn replace_password_hash(
        &self,
        username: &str,
        expected_hash: &str,
        new_hash: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $1 WHERE username = $2 AND password_hash = $3",
        )
        .bind(new_hash)
        .bind(username)
        .bind(expected_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_series(&self, limit: i64, offset: i64) -> Result<(Vec<Series>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM series")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, Series>(
            r#"
            SELECT id, name, min_value, max_value, color, icon
            FROM series
            ORDER BY id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn get_series(&self, id: i64) -> Result<Option<Series>> {
        let row = sqlx::query_as::<_, Series>(
            "SELECT id, name, min_value, max_value, color, icon FROM series WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_series(&self, series: NewSeries) -> Result<Series> {
        let row = sqlx::query_as::<_, Series>(
            r#"
            INSERT INTO series (name, min_value, max_value, color, icon)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, min_value, max_value, color, icon
            "#,
        )
        .bind(&series.name)
        .bind(series.min_value)
        .bind(series.max_value)
        .bind(&series.color)
        .bind(&series.icon)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_bounds_check(e, series.min_value, series.max_value))?;

        Ok(row)
    }

    async fn update_series(&self, series: Series) -> Result<Option<Series>> {
        let row = sqlx::query_as::<_, Series>(
            r#"
            UPDATE series
            SET name = $2, min_value = $3, max_value = $4, color = $5, icon = $6
            WHERE id = $1
            RETURNING id, name, min_value, max_value, color, icon
            "#,
        )
        .bind(series.id)
        .bind(&series.name)
        .bind(series.min_value)
        .bind(series.max_value)
        .bind(&series.color)
        .bind(&series.icon)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_bounds_check(e, series.min_value, series.max_value))?;

        Ok(row)
    }

    async fn delete_series_cascade(&self, id: i64) -> Result<CascadeReport> {
        let mut tx = self.pool.begin().await?;

        // Lock the parent first so no new dependents can be inserted
        // between the dependent deletes and the parent delete.
        sqlx::query("SELECT id FROM series WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let measurements = sqlx::query("DELETE FROM measurements WHERE series_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let sensors = sqlx::query("DELETE FROM sensors WHERE series_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let series = sqlx::query("DELETE FROM series WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        // Dropping `tx` on any early return above rolls everything back.
        tx.commit().await?;

        let report = CascadeReport {
            series_deleted: series.rows_affected() == 1,
            measurements_deleted: measurements.rows_affected(),
            sensors_deleted: sensors.rows_affected(),
        };
        debug!("Cascade delete of series {}: {:?}", id, report);
        Ok(report)
    }

    async fn list_measurements(&self, filter: &MeasurementFilter) -> Result<Vec<Measurement>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id, series_id, value, ts AS timestamp FROM measurements");

        let mut separator = " WHERE ";
        if let Some(series_id) = filter.series_id {
            query.push(separator).push("series_id = ").push_bind(series_id);
            separator = " AND ";
        }
        if let Some(from) = filter.ts_from {
            query.push(separator).push("ts >= ").push_bind(from);
            separator = " AND ";
        }
        if let Some(to) = filter.ts_to {
            query.push(separator).push("ts <= ").push_bind(to);
        }

        query
            .push(" ORDER BY ts ASC, id ASC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = query
            .build_query_as::<Measurement>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn get_measurement(&self, id: i64) -> Result<Option<Measurement>> {
        let row = sqlx::query_as::<_, Measurement>(
            "SELECT id, series_id, value, ts AS timestamp FROM measurements WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_measurement(&self, measurement: NewMeasurement) -> Result<Measurement> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.insert_measurement(&measurement).await {
                Ok(row) => return Ok(row),
                Err(Error::Database(db_err))
                    if attempts < MAX_INSERT_ATTEMPTS && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Measurement insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, MAX_INSERT_ATTEMPTS, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    if attempts > 1 {
                        error!(
                            "Measurement insert failed permanently after {} attempts: {}",
                            attempts, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn update_measurement(&self, measurement: Measurement) -> Result<Option<Measurement>> {
        let row = sqlx::query_as::<_, Measurement>(
            r#"
            UPDATE measurements
            SET series_id = $2, value = $3, ts = $4
            WHERE id = $1
            RETURNING id, series_id, value, ts AS timestamp
            "#,
        )
        .bind(measurement.id)
        .bind(measurement.series_id)
        .bind(measurement.value)
        .bind(measurement.timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_series_fk(e, measurement.series_id))?;

        Ok(row)
    }

    async fn delete_measurement(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM measurements WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, Sensor>(
            "SELECT id, name, api_key, series_id FROM sensors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn create_sensor(&self, sensor: NewSensor) -> Result<Sensor> {
        let row = sqlx::query_as::<_, Sensor>(
            r#"
            INSERT INTO sensors (name, api_key, series_id)
            VALUES ($1, $2, $3)
            RETURNING id, name, api_key, series_id
            "#,
        )
        .bind(&sensor.name)
        .bind(&sensor.api_key)
        .bind(sensor.series_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_series_fk(e, sensor.series_id))?;

        Ok(row)
    }

    async fn find_sensor_by_key(&self, api_key: &str) -> Result<Option<Sensor>> {
        let row = sqlx::query_as::<_, Sensor>(
            "SELECT id, name, api_key, series_id FROM sensors WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
