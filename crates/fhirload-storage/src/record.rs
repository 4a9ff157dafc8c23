//! The unit of ingestion: one FHIR resource with its type and identifier.

use serde_json::Value;

/// Reasons a JSON document cannot become a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("resource is not a JSON object")]
    NotAnObject,

    #[error("resource has no string resourceType")]
    MissingResourceType,

    #[error("resource id must be a string")]
    InvalidId,
}

/// A single resource instance read from a source.
///
/// The type tag and identifier are extracted once at construction so sinks
/// and the loader never re-inspect the payload. An absent `id` means the
/// sink assigns one.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    resource_type: String,
    id: Option<String>,
    resource: Value,
}

impl Record {
    /// Builds a record from a parsed resource.
    pub fn from_value(resource: Value) -> Result<Self, RecordError> {
        let obj = resource.as_object().ok_or(RecordError::NotAnObject)?;

        let resource_type = obj
            .get("resourceType")
            .and_then(Value::as_str)
            .filter(|rt| !rt.is_empty())
            .ok_or(RecordError::MissingResourceType)?
            .to_string();

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) if id.is_empty() => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(RecordError::InvalidId),
        };

        Ok(Self {
            resource_type,
            id,
            resource,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn resource(&self) -> &Value {
        &self.resource
    }

    pub fn into_resource(self) -> Value {
        self.resource
    }

    /// `Type/id` reference for logging; `Type/?` when the id is unassigned.
    pub fn reference(&self) -> String {
        format!(
            "{}/{}",
            self.resource_type,
            self.id.as_deref().unwrap_or("?")
        )
    }
}

impl TryFrom<Value> for Record {
    type Error = RecordError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}
