use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AnalyticsQuery {
    #[validate(length(min = 1, max = 64))]
    pub owner_id: String,
    #[serde(rename = "from")]
    pub from_date: String,
    #[serde(rename = "to")]
    pub to_date: String,
    pub property_id: Option<String>,
    pub time_frame: Option<String>,
    pub compare_from: Option<String>,
    pub compare_to: Option<String>,
}

impl AnalyticsQuery {
    /// Stable cache key covering every parameter that changes the response.
    pub fn cache_key(&self, view: &str) -> String {
        let part = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_ascii_lowercase()
        };
        format!(
            "{view}|{}|{}|{}|{}|{}|{}|{}",
            self.owner_id.trim(),
            self.from_date.trim(),
            self.to_date.trim(),
            part(&self.property_id),
            part(&self.time_frame),
            part(&self.compare_from),
            part(&self.compare_to),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ExtensionStatusQuery {
    #[validate(length(min = 1, max = 64))]
    pub owner_id: String,
}

/// Client-supplied rows to aggregate without touching the database.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregateInput {
    pub records: Value,
    #[serde(default)]
    pub time_frame: Option<String>,
}
