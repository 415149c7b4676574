//! Configuration of the periodic state report.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::{Validate, ValidationError};

/// What the agent reports and how often.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReportConfig {
    /// Seconds between two state reports.
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Report interval must be between 1 and 86400 seconds"
    ))]
    pub interval: u64,

    /// Include the agent uptime in seconds as `uptime`.
    pub uptime: bool,

    /// Include the 1/5/15 minute load averages as `load` (Linux only).
    pub load_average: bool,

    /// Static attributes merged into every report.
    #[validate(custom(function = "validate_attributes"))]
    pub attributes: Map<String, Value>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            uptime: true,
            load_average: true,
            attributes: Map::new(),
        }
    }
}

/// Attribute names must not shadow the generated fields.
fn validate_attributes(attributes: &Map<String, Value>) -> Result<(), ValidationError> {
    for reserved in ["uptime", "load", "sequence"] {
        if attributes.contains_key(reserved) {
            let mut err = ValidationError::new("reserved_attribute");
            err.message = Some(format!("Attribute name '{reserved}' is reserved").into());
            return Err(err);
        }
    }
    Ok(())
}
