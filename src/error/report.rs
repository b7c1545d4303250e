use serde::{Deserialize, Serialize};

use super::kinds::DataMoveError;

/// Structured view of a fatal error.
///
/// Intended to be serialized to JSON and printed by the binary, or consumed
/// by wrappers that run the mover unattended.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub(crate) error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) object_set: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) endpoint: Option<String>,
    pub(crate) message: String,
}

impl ErrorReport {
    /// Extract the report from an error, lifting the outermost context.
    pub fn from_error(error: &DataMoveError) -> Self {
        let mut report = ErrorReport {
            error_type: format!("datamove.{}", error.kind_name()),
            message: error.root().to_string(),
            ..Default::default()
        };

        if let DataMoveError::Context {
            object_set,
            entity,
            endpoint,
            ..
        } = error
        {
            report.object_set = Some(*object_set);
            report.entity = Some(entity.clone());
            report.endpoint = endpoint.clone();
        }

        report
    }

    /// Pretty-printed JSON wrapped in an `error` field.
    pub fn to_json_pretty(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&serde_json::json!({ "error": self }))
    }

    /// Compact JSON string (single line).
    pub fn to_json_compact(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;

    #[test]
    fn test_report_lifts_context() {
        let err: DataMoveError = SchemaError::ExternalIdFieldMissing {
            entity: "Account".into(),
            field: "Code__c".into(),
            endpoint: "target".into(),
        }
        .into();
        let err = err.with_context(1, "Account", Some("target"));

        let report = ErrorReport::from_error(&err);
        assert_eq!(report.error_type, "datamove.schema");
        assert_eq!(report.object_set, Some(1));
        assert_eq!(report.entity.as_deref(), Some("Account"));

        let json = report.to_json_compact().unwrap();
        assert!(json.contains("\"objectSet\":1"));
        assert!(json.contains("Code__c"));
    }
}
