use crate::models::ScanOutcome;
use super::FormatError;

/// Serialize a scan outcome to YAML
pub fn to_yaml(outcome: &ScanOutcome) -> Result<String, FormatError> {
    serde_yaml::to_string(outcome).map_err(FormatError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanReport;
    use std::path::PathBuf;

    #[test]
    fn test_to_yaml() {
        let mut report = ScanReport {
            root: PathBuf::from("/test"),
            ..ScanReport::default()
        };
        report.module_counts.insert("requests".to_string(), 3);

        let yaml = to_yaml(&ScanOutcome::Completed(report)).unwrap();
        assert!(yaml.contains("status: completed"));
        assert!(yaml.contains("root: /test"));
        assert!(yaml.contains("requests: 3"));
    }
}
