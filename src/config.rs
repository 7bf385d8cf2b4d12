use std::collections::{BTreeMap, HashMap};
use std::fmt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

use crate::error::{VizError, VizResult};
use crate::types::Level;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub groups: HashMap<String, GroupOptions>,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: Option<PathBuf>, // client build served at "/"
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassificationConfig {
    #[serde(default = "default_class_count")]
    pub class_count: usize,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_class_count() -> usize {
    5
}

fn default_method() -> String {
    "quantile".to_string()
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            class_count: default_class_count(),
            method: default_method(),
        }
    }
}

/// GeoJSON layer used to seed a store level at start-up.
#[derive(Debug, Deserialize, Clone)]
pub struct LayerConfig {
    pub level: Level,
    pub path: PathBuf,
    #[serde(default = "default_layer_geoid_field")]
    pub geoid_field: String,
}

fn default_layer_geoid_field() -> String {
    "geoid".to_string()
}

/// Where a group of fields lives on the feature service. Every field is required.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GroupOptions {
    #[serde(default, alias = "serviceUrl")]
    pub service_url: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub layer: String,
    #[serde(default, alias = "geoIdField")]
    pub geoid_field: String,
}

impl GroupOptions {
    pub fn validate(&self) -> VizResult<()> {
        let required = [
            ("service_url", &self.service_url),
            ("workspace", &self.workspace),
            ("layer", &self.layer),
            ("geoid_field", &self.geoid_field),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(VizError::invalid_request(format!(
                    "group option '{}' is required",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Scalar request parameter (a GeoServer view parameter).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Integer(i)
    }
}

impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        ParamValue::Integer(i64::from(i))
    }
}

/// Parameters are kept ordered by name so every consumer sees the same order.
pub type Parameters = BTreeMap<String, ParamValue>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FieldOptions {
    #[serde(alias = "propertyName")]
    pub property_name: String,
    #[serde(default, alias = "viewParams")]
    pub parameters: Parameters,
}

impl FieldOptions {
    pub fn new(property_name: impl Into<String>) -> Self {
        Self {
            property_name: property_name.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        for (name, group) in &config.groups {
            group
                .validate()
                .with_context(|| format!("Invalid group '{}' in configuration", name))?;
        }
        Ok(config)
    }

    pub fn group(&self, name: &str) -> VizResult<&GroupOptions> {
        self.groups
            .get(name)
            .ok_or_else(|| VizError::invalid_request(format!("unknown group '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
port = 3000

[groups.demographics]
service_url = "http://localhost:8080/geoserver/wfs"
workspace = "solap"
layer = "demographics"
geoid_field = "tract_geoid"

[[layers]]
level = "county"
path = "data/mn_county_2010.geojson"
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(config.server.static_dir.is_none());
        assert_eq!(config.classification.class_count, 5);
        assert_eq!(config.classification.method, "quantile");
        assert_eq!(config.group("demographics").unwrap().layer, "demographics");
        assert_eq!(config.layers[0].level, Level::County);
        assert_eq!(config.layers[0].geoid_field, "geoid");
    }

    #[test]
    fn test_load_rejects_incomplete_group() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[server]\nport = 1\n[groups.bad]\nworkspace = \"solap\"\n")
            .unwrap();
        assert!(AppConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_group_validate_missing_geoid_field() {
        let group = GroupOptions {
            service_url: "http://localhost/wfs".into(),
            workspace: "solap".into(),
            layer: "demographics".into(),
            geoid_field: String::new(),
        };
        let err = group.validate().unwrap_err();
        assert!(matches!(err, VizError::InvalidRequest(ref m) if m.contains("geoid_field")));
    }

    #[test]
    fn test_field_options_from_json() {
        let field: FieldOptions = serde_json::from_str(
            r#"{"propertyName": "data_value", "viewParams": {"pollutant": "so2", "year": 2005}}"#,
        )
        .unwrap();
        assert_eq!(field.property_name, "data_value");
        assert_eq!(field.parameters["year"], ParamValue::Integer(2005));
        assert_eq!(field.parameters["pollutant"].to_string(), "so2");
    }

    #[test]
    fn test_field_options_default_empty_parameters() {
        let field: FieldOptions = serde_json::from_str(r#"{"property_name": "total"}"#).unwrap();
        assert!(field.parameters.is_empty());
    }
}
