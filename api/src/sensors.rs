use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use crate::errors::{AuthError, Result, ValidationError};
use crate::metrics::UNKNOWN_SENSOR_KEY_TOTAL;
use crate::model::{NewSensor, NewSensorRequest, Sensor};
use crate::store::Store;
use crate::validate::validate_name;

/// 32 random bytes, 256 bits of entropy.
pub const API_KEY_BYTES: usize = 32;

pub fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SensorRegistry {
    store: Arc<dyn Store>,
}

impl SensorRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates a sensor bound to an existing series and hands out its key.
    pub async fn register(&self, request: NewSensorRequest) -> Result<Sensor> {
        validate_name("name", &request.name)?;
        if self.store.get_series(request.series_id).await?.is_none() {
            return Err(ValidationError::series_not_found(request.series_id).into());
        }

        let sensor = self
            .store
            .create_sensor(NewSensor {
                name: request.name,
                api_key: generate_api_key(),
                series_id: request.series_id,
            })
            .await?;

        info!(
            "Registered sensor {} ({}) for series {}",
            sensor.id, sensor.name, sensor.series_id
        );
        Ok(sensor)
    }

    /// Exact-match lookup of a presented key.
    pub async fn resolve(&self, api_key: &str) -> Result<Sensor> {
        if api_key.is_empty() {
            UNKNOWN_SENSOR_KEY_TOTAL.inc();
            return Err(AuthError::UnknownSensorKey.into());
        }

        match self.store.find_sensor_by_key(api_key).await? {
            Some(sensor) => Ok(sensor),
            None => {
                warn!("Request with unknown sensor key");
                UNKNOWN_SENSOR_KEY_TOTAL.inc();
                Err(AuthError::UnknownSensorKey.into())
            }
        }
    }
}
