use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::Store;
use crate::errors::{Error, Result, ValidationError};
use crate::model::{
    CascadeReport, Measurement, MeasurementFilter, NewMeasurement, NewSensor, NewSeries, NewUser,
    Sensor, Series, User,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<i64, User>,
    series: BTreeMap<i64, Series>,
    measurements: BTreeMap<i64, Measurement>,
    sensors: BTreeMap<i64, Sensor>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_series(&self, id: i64) -> Result<()> {
        if self.series.contains_key(&id) {
            Ok(())
        } else {
            Err(ValidationError::series_not_found(id).into())
        }
    }
}

/// Mirrors the Postgres constraint on series bounds.
fn check_bounds(series: &Series) -> Result<()> {
    if series.min_value <= series.max_value {
        Ok(())
    } else {
        Err(ValidationError::InvalidRange {
            min: series.min_value,
            max: series.max_value,
        }
        .into())
    }
}

/// Process-local store. Every call takes one lock over all tables, which
/// makes each call atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_next_cascade: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next cascading delete fail after its dependents have been
    /// removed from the staged copy and before the series itself is removed.
    pub fn fail_next_cascade(&self) {
        self.fail_next_cascade.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let tables = self.tables.read();
        Ok(tables
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut tables = self.tables.write();
        if tables.users.values().any(|u| u.username == user.username) {
            return Err(ValidationError::Invalid(format!(
                "User '{}' already exists",
                user.username
            ))
            .into());
        }

        let id = tables.allocate_id();
        let user = User {
            id,
            username: user.username,
            password_hash: user.password_hash,
            role: user.role,
        };
        tables.users.insert(id, user.clone());
        Ok(user)
    }

    async fn replace_password_hash(
        &self,
        username: &str,
        expected_hash: &str,
        new_hash: &str,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables
            .users
            .values_mut()
            .find(|u| u.username == username && u.password_hash == expected_hash)
        {
            Some(user) => {
                user.password_hash = new_hash.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_series(&self, limit: i64, offset: i64) -> Result<(Vec<Series>, i64)> {
        let tables = self.tables.read();
        let page = tables
            .series
            .values()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, tables.series.len() as i64))
    }

    async fn get_series(&self, id: i64) -> Result<Option<Series>> {
        Ok(self.tables.read().series.get(&id).cloned())
    }

    async fn create_series(&self, series: NewSeries) -> Result<Series> {
        let mut tables = self.tables.write();
        let id = tables.allocate_id();
        let series = Series {
            id,
            name: series.name,
            min_value: series.min_value,
            max_value: series.max_value,
            color: series.color,
            icon: series.icon,
        };
        check_bounds(&series)?;
        tables.series.insert(id, series.clone());
        Ok(series)
    }

    async fn update_series(&self, series: Series) -> Result<Option<Series>> {
        check_bounds(&series)?;
        let mut tables = self.tables.write();
        match tables.series.get_mut(&series.id) {
            Some(stored) => {
                *stored = series.clone();
                Ok(Some(series))
            }
            None => Ok(None),
        }
    }

    async fn delete_series_cascade(&self, id: i64) -> Result<CascadeReport> {
        let mut tables = self.tables.write();

        // Work on a copy; the live tables are only replaced once every step
        // has succeeded.
        let mut staged = tables.clone();

        let measurements_before = staged.measurements.len();
        staged.measurements.retain(|_, m| m.series_id != id);
        let sensors_before = staged.sensors.len();
        staged.sensors.retain(|_, s| s.series_id != id);

        if self.fail_next_cascade.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "Injected failure while deleting series {}",
                id
            )));
        }

        let series_deleted = staged.series.remove(&id).is_some();
        let report = CascadeReport {
            series_deleted,
            measurements_deleted: (measurements_before - staged.measurements.len()) as u64,
            sensors_deleted: (sensors_before - staged.sensors.len()) as u64,
        };

        *tables = staged;
        debug!("Cascade delete of series {}: {:?}", id, report);
        Ok(report)
    }

    async fn list_measurements(&self, filter: &MeasurementFilter) -> Result<Vec<Measurement>> {
        let tables = self.tables.read();
        let mut rows: Vec<Measurement> = tables
            .measurements
            .values()
            .filter(|m| filter.series_id.map_or(true, |id| m.series_id == id))
            .filter(|m| filter.ts_from.map_or(true, |from| m.timestamp >= from))
            .filter(|m| filter.ts_to.map_or(true, |to| m.timestamp <= to))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn get_measurement(&self, id: i64) -> Result<Option<Measurement>> {
        Ok(self.tables.read().measurements.get(&id).cloned())
    }

    async fn create_measurement(&self, measurement: NewMeasurement) -> Result<Measurement> {
        let mut tables = self.tables.write();
        tables.require_series(measurement.series_id)?;

        let id = tables.allocate_id();
        let measurement = Measurement {
            id,
            series_id: measurement.series_id,
            value: measurement.value,
            timestamp: measurement.timestamp,
        };
        tables.measurements.insert(id, measurement.clone());
        Ok(measurement)
    }

    async fn update_measurement(&self, measurement: Measurement) -> Result<Option<Measurement>> {
        let mut tables = self.tables.write();
        tables.require_series(measurement.series_id)?;

        match tables.measurements.get_mut(&measurement.id) {
            Some(stored) => {
                *stored = measurement.clone();
                Ok(Some(measurement))
            }
            None => Ok(None),
        }
    }

    async fn delete_measurement(&self, id: i64) -> Result<bool> {
        Ok(self.tables.write().measurements.remove(&id).is_some())
    }

    async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        Ok(self.tables.read().sensors.values().cloned().collect())
    }

    async fn create_sensor(&self, sensor: NewSensor) -> Result<Sensor> {
        let mut tables = self.tables.write();
        tables.require_series(sensor.series_id)?;
        if tables.sensors.values().any(|s| s.api_key == sensor.api_key) {
            return Err(Error::Internal("Duplicate sensor API key".to_string()));
        }

        let id = tables.allocate_id();
        let sensor = Sensor {
            id,
            name: sensor.name,
            api_key: sensor.api_key,
            series_id: sensor.series_id,
        };
        tables.sensors.insert(id, sensor.clone());
        Ok(sensor)
    }

    async fn find_sensor_by_key(&self, api_key: &str) -> Result<Option<Sensor>> {
        let tables = self.tables.read();
        Ok(tables
            .sensors
            .values()
            .find(|s| s.api_key == api_key)
            .cloned())
    }
}
