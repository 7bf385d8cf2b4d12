use serde::Serialize;

use crate::config::{FieldOptions, GroupOptions};
use crate::error::{VizError, VizResult};

pub const OUTPUT_FORMAT: &str = "application/json";

/// Transport-agnostic description of a feature request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub service_url: String,
    pub property_names: Vec<String>,
    pub feature_prefix: String,
    pub feature_types: Vec<String>,
    pub view_params: String,
    pub output_format: String,
}

impl QueryDescriptor {
    /// The join key, which `build` always places last.
    pub fn geoid_field(&self) -> Option<&str> {
        self.property_names.last().map(String::as_str)
    }
}

/// Build the descriptor for one request.
///
/// Only the first field's parameters become the view parameters: all fields
/// of a request are fetched under one parameter set.
pub fn build(group: &GroupOptions, fields: &[FieldOptions]) -> VizResult<QueryDescriptor> {
    let first = fields
        .first()
        .ok_or_else(|| VizError::invalid_request("at least one field option is required"))?;
    if group.geoid_field.trim().is_empty() {
        return Err(VizError::invalid_request("group option 'geoid_field' is required"));
    }

    let mut property_names: Vec<String> =
        fields.iter().map(|f| f.property_name.clone()).collect();
    // Join key always requested, and last.
    property_names.retain(|p| p != &group.geoid_field);
    property_names.push(group.geoid_field.clone());

    let view_params = first
        .parameters
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(";");

    Ok(QueryDescriptor {
        service_url: group.service_url.clone(),
        property_names,
        feature_prefix: group.workspace.clone(),
        feature_types: vec![group.layer.clone()],
        view_params,
        output_format: OUTPUT_FORMAT.to_string(),
    })
}
