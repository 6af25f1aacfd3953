use crate::errors::ValidationError;
use crate::model::Series;

/// Checks that `value` lies within the series' declared range.
///
/// Written as a negated inclusive check so NaN is rejected.
pub fn validate_range(series: &Series, value: f64) -> Result<(), ValidationError> {
    if !(series.min_value <= value && value <= series.max_value) {
        return Err(ValidationError::OutOfRange {
            value,
            min: series.min_value,
            max: series.max_value,
            series: series.name.clone(),
        });
    }

    Ok(())
}

/// Checks the effective bounds of a series, after any partial update is applied.
pub fn validate_series_bounds(min_value: f64, max_value: f64) -> Result<(), ValidationError> {
    if !(min_value <= max_value) {
        return Err(ValidationError::InvalidRange {
            min: min_value,
            max: max_value,
        });
    }

    Ok(())
}

pub fn validate_name(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Invalid(format!("{} cannot be empty", field)));
    }

    Ok(())
}

/// Full validation of a series as it will be stored.
pub fn validate_series(series: &Series) -> Result<(), ValidationError> {
    validate_name("name", &series.name)?;
    validate_series_bounds(series.min_value, series.max_value)
}
