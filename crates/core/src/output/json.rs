use crate::models::ScanOutcome;
use super::FormatError;

/// Serialize a scan outcome to pretty-printed JSON
pub fn to_json(outcome: &ScanOutcome) -> Result<String, FormatError> {
    serde_json::to_string_pretty(outcome).map_err(FormatError::from)
}

/// Serialize a scan outcome to compact JSON
pub fn to_json_compact(outcome: &ScanOutcome) -> Result<String, FormatError> {
    serde_json::to_string(outcome).map_err(FormatError::from)
}
