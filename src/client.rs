use async_trait::async_trait;
use geojson::{FeatureCollection, GeoJson};
use std::time::Duration;
use tracing::debug;

use crate::error::{VizError, VizResult};
use crate::query::QueryDescriptor;
use crate::types::{EnumUnitRecord, GeoId};

/// One feature's attributes, keyed by the unit it describes. Geometry is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub geo_id: GeoId,
    pub fields: EnumUnitRecord,
}

/// Remote source of feature attributes. This is the only suspension point of
/// the visualization pipeline.
#[async_trait]
pub trait FeatureClient: Send + Sync {
    async fn fetch_features(&self, query: &QueryDescriptor) -> VizResult<Vec<FeatureRecord>>;
}

/// GeoServer-style WFS client issuing `GetFeature` key-value requests.
pub struct WfsClient {
    http: reqwest::Client,
}

impl WfsClient {
    pub fn new() -> VizResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http })
    }

    fn request_params(query: &QueryDescriptor) -> Vec<(&'static str, String)> {
        let type_names = query
            .feature_types
            .iter()
            .map(|t| format!("{}:{}", query.feature_prefix, t))
            .collect::<Vec<_>>()
            .join(",");
        let mut params = vec![
            ("service", "WFS".to_string()),
            ("version", "1.1.0".to_string()),
            ("request", "GetFeature".to_string()),
            ("typeName", type_names),
            ("propertyName", query.property_names.join(",")),
            ("outputFormat", query.output_format.clone()),
        ];
        if !query.view_params.is_empty() {
            params.push(("viewparams", query.view_params.clone()));
        }
        params
    }
}

#[async_trait]
impl FeatureClient for WfsClient {
    async fn fetch_features(&self, query: &QueryDescriptor) -> VizResult<Vec<FeatureRecord>> {
        let geoid_field = query
            .geoid_field()
            .ok_or_else(|| VizError::invalid_request("query has no property names"))?;

        debug!(url = %query.service_url, view_params = %query.view_params, "Requesting features");
        let geojson = self
            .http
            .get(&query.service_url)
            .query(&Self::request_params(query))
            .send()
            .await?
            .error_for_status()?
            .json::<GeoJson>()
            .await
            .map_err(|e| VizError::transport(format!("Failed to parse feature response: {}", e)))?;
        let collection = match geojson {
            GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(VizError::transport("Feature response must be a FeatureCollection")),
        };

        Ok(records_from_collection(collection, geoid_field))
    }
}

/// Read a GeoId from a property value; strings and numbers are accepted.
pub fn geoid_from_value(value: Option<&serde_json::Value>) -> Option<GeoId> {
    match value {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Flatten a feature collection into per-unit records, skipping features
/// without a usable id.
pub fn records_from_collection(collection: FeatureCollection, geoid_field: &str) -> Vec<FeatureRecord> {
    let mut records = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let props = match feature.properties {
            Some(props) => props,
            None => continue,
        };
        let geo_id = match geoid_from_value(props.get(geoid_field)) {
            Some(id) => id,
            None => continue,
        };
        records.push(FeatureRecord {
            geo_id,
            fields: props.into_iter().collect(),
        });
    }
    records
}
