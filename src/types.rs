use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::VizError;

/// Census geographic identifier. Tract ids are 11 characters, the first 5 of
/// which are the owning county's id.
pub type GeoId = String;

/// Length of the county prefix inside a tract GeoId.
pub const COUNTY_PREFIX_LEN: usize = 5;

/// Field identity -> value for one enumeration unit. Geometry is never kept.
pub type EnumUnitRecord = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Tract,
    County,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Tract => "tract",
            Level::County => "county",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = VizError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tract" => Ok(Level::Tract),
            "county" => Ok(Level::County),
            other => Err(VizError::invalid_request(format!(
                "level must be 'county' or 'tract', got '{}'",
                other
            ))),
        }
    }
}

/// Classification methods understood by the break calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMethod {
    Quantile,
}

impl FromStr for ClassMethod {
    type Err = VizError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quantile" => Ok(ClassMethod::Quantile),
            other => Err(VizError::unsupported(format!(
                "only quantile breaks supported, got '{}'",
                other
            ))),
        }
    }
}

/// Breaks for one symbolized variable. Each break is an inclusive upper bound:
/// a value belongs to the first class whose break is >= the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBreakResult {
    pub min_val: f64,
    pub breaks: Vec<f64>,
}

/// Parent county of a tract GeoId, if the id is long enough to carry one.
pub fn county_of(tract: &str) -> Option<&str> {
    tract.get(..COUNTY_PREFIX_LEN)
}
