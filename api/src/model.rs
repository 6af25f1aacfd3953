use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two roles a user can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Stored user record. Never serialized to clients.
#[derive(Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Authenticated caller, resolved against the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

/// Named, range-bounded measurement category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Series {
    pub id: i64,
    pub name: String,
    pub min_value: f64,
    pub max_value: f64,
    pub color: Option<String>,
    pub icon: Option<String>,
}

/// Body of `POST /series` and `PUT /series/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSeries {
    pub name: String,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Body of `PATCH /series/{id}`. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesPatch {
    pub name: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

impl SeriesPatch {
    /// The series as it would look after applying this patch.
    pub fn apply_to(&self, current: &Series) -> Series {
        Series {
            id: current.id,
            name: self.name.clone().unwrap_or_else(|| current.name.clone()),
            min_value: self.min_value.unwrap_or(current.min_value),
            max_value: self.max_value.unwrap_or(current.max_value),
            color: self.color.clone().or_else(|| current.color.clone()),
            icon: self.icon.clone().or_else(|| current.icon.clone()),
        }
    }
}

/// A single timestamped value belonging to a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Measurement {
    pub id: i64,
    pub series_id: i64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /measurements` and `PUT /measurements/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMeasurement {
    pub series_id: i64,
    pub value: f64,
    #[serde(deserialize_with = "utc::deserialize")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementPatch {
    pub series_id: Option<i64>,
    pub value: Option<f64>,
    #[serde(default, deserialize_with = "utc::deserialize_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MeasurementPatch {
    pub fn apply_to(&self, current: &Measurement) -> Measurement {
        Measurement {
            id: current.id,
            series_id: self.series_id.unwrap_or(current.series_id),
            value: self.value.unwrap_or(current.value),
            timestamp: self.timestamp.unwrap_or(current.timestamp),
        }
    }
}

/// Body of `POST /measurements/from-sensor`. The series comes from the
/// sensor's binding, never from the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    #[serde(default, deserialize_with = "utc::deserialize_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementFilter {
    pub series_id: Option<i64>,
    pub ts_from: Option<DateTime<Utc>>,
    pub ts_to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Machine credential bound to exactly one series.
#[derive(Clone, PartialEq, sqlx::FromRow)]
pub struct Sensor {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub series_id: i64,
}

impl fmt::Debug for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("series_id", &self.series_id)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSensorRequest {
    pub name: String,
    pub series_id: i64,
}

#[derive(Clone)]
pub struct NewSensor {
    pub name: String,
    pub api_key: String,
    pub series_id: i64,
}

/// Sensor as listed to admins, without its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRead {
    pub id: i64,
    pub name: String,
    pub series_id: i64,
}

impl From<&Sensor> for SensorRead {
    fn from(sensor: &Sensor) -> Self {
        Self {
            id: sensor.id,
            name: sensor.name.clone(),
            series_id: sensor.series_id,
        }
    }
}

/// Returned exactly once, when the sensor is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorWithKey {
    pub id: i64,
    pub name: String,
    pub series_id: i64,
    pub api_key: String,
}

impl From<Sensor> for SensorWithKey {
    fn from(sensor: Sensor) -> Self {
        Self {
            id: sensor.id,
            name: sensor.name,
            series_id: sensor.series_id,
            api_key: sensor.api_key,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordChangeRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
}

impl AccessToken {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

/// Rows removed by a cascading series delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub series_deleted: bool,
    pub measurements_deleted: u64,
    pub sensors_deleted: u64,
}

/// Timestamp parsing for inbound payloads and query strings.
///
/// Values with an offset are converted to UTC; values without one are taken
/// to already be UTC.
pub mod utc {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer};

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_role_round_trips_through_str() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("viewer".parse::<Role>().unwrap(), Role::Viewer);
        assert!("root".parse::<Role>().is_err());
        assert!("Admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_offset_timestamp_normalized_to_utc() {
        let ts = utc::parse("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_naive_timestamp_treated_as_utc() {
        let ts = utc::parse("2024-03-01T12:00:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        let ts = utc::parse("2024-03-01 12:00:00.250").unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_garbage_timestamp_rejected() {
        assert!(utc::parse("yesterday").is_none());

        let body = r#"{"series_id": 1, "value": 2.0, "timestamp": "nope"}"#;
        assert!(serde_json::from_str::<NewMeasurement>(body).is_err());
    }

    #[test]
    fn test_sensor_reading_timestamp_optional() {
        let reading: SensorReading = serde_json::from_str(r#"{"value": 22.5}"#).unwrap();
        assert!(reading.timestamp.is_none());

        let reading: SensorReading =
            serde_json::from_str(r#"{"value": 22.5, "timestamp": "2024-01-01T00:00:00Z"}"#)
                .unwrap();
        assert!(reading.timestamp.is_some());
    }

    #[test]
    fn test_series_patch_keeps_unset_fields() {
        let current = Series {
            id: 3,
            name: "Temperature".to_string(),
            min_value: 15.0,
            max_value: 30.0,
            color: Some("#ff0000".to_string()),
            icon: None,
        };
        let patch = SeriesPatch {
            max_value: Some(40.0),
            ..Default::default()
        };

        let merged = patch.apply_to(&current);
        assert_eq!(merged.name, "Temperature");
        assert_eq!(merged.min_value, 15.0);
        assert_eq!(merged.max_value, 40.0);
        assert_eq!(merged.color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn test_secrets_redacted_in_debug() {
        let user = User {
            id: 1,
            username: "admin".to_string(),
            password_hash: "bcrypt$secret-hash".to_string(),
            role: Role::Admin,
        };
        assert!(!format!("{:?}", user).contains("secret-hash"));

        let sensor = Sensor {
            id: 1,
            name: "probe".to_string(),
            api_key: "deadbeef".to_string(),
            series_id: 1,
        };
        assert!(!format!("{:?}", sensor).contains("deadbeef"));
    }
}
