//! JSON response envelopes.

use serde::{Deserialize, Serialize};

/// Wraps every command response with its schema name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Schema reference, e.g. `remedy://ticket-response/v1`
    #[serde(rename = "$schema")]
    pub schema: String,
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// "single" for objects, "array" for collections
    pub schema_type: String,
    pub success: bool,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn single(schema_name: &str, data: T) -> Self {
        Self::new(schema_name, "single", data)
    }

    fn new(schema_name: &str, schema_type: &str, data: T) -> Self {
        Self {
            schema: format!("remedy://{schema_name}/v1"),
            schema_version: "1.0".to_string(),
            schema_type: schema_type.to_string(),
            success: true,
            data,
        }
    }
}

impl<T> Envelope<Vec<T>> {
    pub fn array(schema_name: &str, data: Vec<T>) -> Self {
        Self::new(schema_name, "array", data)
    }
}

impl<T: Serialize> Envelope<T> {
    /// Convert to an untyped value for printing or inspection.
    pub fn into_value(self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_envelope_shape() -> serde_json::Result<()> {
        let value = Envelope::single("stats-response", serde_json::json!({ "open": 2 })).into_value()?;
        assert_eq!(value["$schema"], "remedy://stats-response/v1");
        assert_eq!(value["schema_type"], "single");
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["open"], 2);
        Ok(())
    }

    #[test]
    fn test_array_envelope_shape() -> serde_json::Result<()> {
        let value = Envelope::array("ticket-list-response", vec![1, 2, 3]).into_value()?;
        assert_eq!(value["schema_type"], "array");
        assert_eq!(value["data"].as_array().map(Vec::len), Some(3));
        Ok(())
    }
}
