mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{make_pool, PgStore};

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{
    CascadeReport, Measurement, MeasurementFilter, NewMeasurement, NewSensor, NewSeries, NewUser,
    Sensor, Series, User,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, username: &str) -> Result<Option<User>>;

    async fn create_user(&self, user: NewUser) -> Result<User>;

    /// Swaps the stored hash only if it still equals `expected_hash`.
    /// Returns `false` when the user is gone or the hash changed underneath.
    async fn replace_password_hash(
        &self,
        username: &str,
        expected_hash: &str,
        new_hash: &str,
    ) -> Result<bool>;

    /// Page of series ordered by id, plus the total series count.
    async fn list_series(&self, limit: i64, offset: i64) -> Result<(Vec<Series>, i64)>;

    async fn get_series(&self, id: i64) -> Result<Option<Series>>;

    async fn create_series(&self, series: NewSeries) -> Result<Series>;

    /// Replaces every column of an existing series. `None` if it does not exist.
    async fn update_series(&self, series: Series) -> Result<Option<Series>>;

    /// Deletes a series's measurements, then its sensors, then the series,
    /// as one transaction. A missing series is not an error.
    async fn delete_series_cascade(&self, id: i64) -> Result<CascadeReport>;

    async fn list_measurements(&self, filter: &MeasurementFilter) -> Result<Vec<Measurement>>;

    async fn get_measurement(&self, id: i64) -> Result<Option<Measurement>>;

    async fn create_measurement(&self, measurement: NewMeasurement) -> Result<Measurement>;

    async fn update_measurement(&self, measurement: Measurement) -> Result<Option<Measurement>>;

    async fn delete_measurement(&self, id: i64) -> Result<bool>;

    async fn list_sensors(&self) -> Result<Vec<Sensor>>;

    async fn create_sensor(&self, sensor: NewSensor) -> Result<Sensor>;

    async fn find_sensor_by_key(&self, api_key: &str) -> Result<Option<Sensor>>;
}
