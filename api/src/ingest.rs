use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::{Result, ValidationError};
use crate::metrics::{
    MEASUREMENTS_INGESTED_TOTAL, MEASUREMENTS_REJECTED_TOTAL, SERIES_CASCADE_DELETES_TOTAL,
};
use crate::model::{
    CascadeReport, Measurement, MeasurementPatch, NewMeasurement, NewSeries, Sensor, SensorReading,
    Series, SeriesPatch,
};
use crate::store::Store;
use crate::validate::{validate_range, validate_series};

const SOURCE_ADMIN: &str = "admin";
const SOURCE_SENSOR: &str = "sensor";

pub struct Ingestor {
    store: Arc<dyn Store>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn require_series(&self, id: i64) -> Result<Series> {
        self.store
            .get_series(id)
            .await?
            .ok_or_else(|| ValidationError::series_not_found(id).into())
    }

    async fn require_measurement(&self, id: i64) -> Result<Measurement> {
        self.store
            .get_measurement(id)
            .await?
            .ok_or_else(|| ValidationError::measurement_not_found(id).into())
    }

    /// Looks up the target series and range-checks `value` against it.
    async fn check_value(&self, series_id: i64, value: f64, source: &str) -> Result<Series> {
        let series = self.require_series(series_id).await?;
        if let Err(e) = validate_range(&series, value) {
            warn!("Rejected {} measurement: {}", source, e);
            MEASUREMENTS_REJECTED_TOTAL
                .with_label_values(&[source])
                .inc();
            return Err(e.into());
        }
        Ok(series)
    }

    pub async fn create_series(&self, series: NewSeries) -> Result<Series> {
        validate_series(&Series {
            id: 0,
            name: series.name.clone(),
            min_value: series.min_value,
            max_value: series.max_value,
            color: None,
            icon: None,
        })?;

        let created = self.store.create_series(series).await?;
        info!("Created series {} ({})", created.id, created.name);
        Ok(created)
    }

    /// Full replacement of a series (PUT).
    pub async fn replace_series(&self, id: i64, series: NewSeries) -> Result<Series> {
        let replacement = Series {
            id,
            name: series.name,
            min_value: series.min_value,
            max_value: series.max_value,
            color: series.color,
            icon: series.icon,
        };
        self.require_series(id).await?;
        validate_series(&replacement)?;

        self.store
            .update_series(replacement)
            .await?
            .ok_or_else(|| ValidationError::series_not_found(id).into())
    }

    /// Partial update of a series (PATCH). The merged bounds are what get
    /// validated, whichever field the patch touches.
    pub async fn patch_series(&self, id: i64, patch: SeriesPatch) -> Result<Series> {
        let current = self.require_series(id).await?;
        let merged = patch.apply_to(&current);
        validate_series(&merged)?;

        self.store
            .update_series(merged)
            .await?
            .ok_or_else(|| ValidationError::series_not_found(id).into())
    }

    /// Removes a series together with its measurements and sensors.
    /// Deleting a series that does not exist succeeds.
    pub async fn delete_series(&self, id: i64) -> Result<CascadeReport> {
        let report = self.store.delete_series_cascade(id).await?;
        if report.series_deleted {
            SERIES_CASCADE_DELETES_TOTAL.inc();
            info!(
                "Deleted series {} with {} measurements and {} sensors",
                id, report.measurements_deleted, report.sensors_deleted
            );
        } else {
            debug!("Delete of missing series {} ignored", id);
        }
        Ok(report)
    }

    pub async fn create_measurement(&self, measurement: NewMeasurement) -> Result<Measurement> {
        self.check_value(measurement.series_id, measurement.value, SOURCE_ADMIN)
            .await?;

        let created = self.store.create_measurement(measurement).await?;
        MEASUREMENTS_INGESTED_TOTAL
            .with_label_values(&[SOURCE_ADMIN])
            .inc();
        Ok(created)
    }

    /// Full replacement of a measurement (PUT), re-validated against the
    /// possibly different target series.
    pub async fn replace_measurement(
        &self,
        id: i64,
        measurement: NewMeasurement,
    ) -> Result<Measurement> {
        self.require_measurement(id).await?;
        self.check_value(measurement.series_id, measurement.value, SOURCE_ADMIN)
            .await?;

        self.store
            .update_measurement(Measurement {
                id,
                series_id: measurement.series_id,
                value: measurement.value,
                timestamp: measurement.timestamp,
            })
            .await?
            .ok_or_else(|| ValidationError::measurement_not_found(id).into())
    }

    /// Partial update (PATCH); the effective series and value are validated.
    pub async fn patch_measurement(&self, id: i64, patch: MeasurementPatch) -> Result<Measurement> {
        let current = self.require_measurement(id).await?;
        let merged = patch.apply_to(&current);
        self.check_value(merged.series_id, merged.value, SOURCE_ADMIN)
            .await?;

        self.store
            .update_measurement(merged)
            .await?
            .ok_or_else(|| ValidationError::measurement_not_found(id).into())
    }

    /// Deleting a measurement that does not exist succeeds.
    pub async fn delete_measurement(&self, id: i64) -> Result<bool> {
        self.store.delete_measurement(id).await
    }

    /// Stores a reading posted by a sensor into the series it is bound to.
    /// A missing timestamp means "now".
    pub async fn ingest_from_sensor(
        &self,
        sensor: &Sensor,
        reading: SensorReading,
    ) -> Result<Measurement> {
        self.check_value(sensor.series_id, reading.value, SOURCE_SENSOR)
            .await?;

        let created = self
            .store
            .create_measurement(NewMeasurement {
                series_id: sensor.series_id,
                value: reading.value,
                timestamp: reading.timestamp.unwrap_or_else(Utc::now),
            })
            .await?;

        debug!(
            "Sensor {} recorded {} into series {}",
            sensor.id, created.value, created.series_id
        );
        MEASUREMENTS_INGESTED_TOTAL
            .with_label_values(&[SOURCE_SENSOR])
            .inc();
        Ok(created)
    }
}
