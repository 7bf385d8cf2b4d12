use geojson::FeatureCollection;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::client::{records_from_collection, FeatureRecord};
use crate::types::{county_of, EnumUnitRecord, GeoId, Level};

pub type UnitMap = HashMap<GeoId, EnumUnitRecord>;

/// Attribute cache for tracts and counties. Records only grow: fields are
/// merged in and never removed except by an explicit `reset`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnumUnitStore {
    pub tract: UnitMap,
    pub county: UnitMap,
}

impl EnumUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self, level: Level) -> &UnitMap {
        match level {
            Level::Tract => &self.tract,
            Level::County => &self.county,
        }
    }

    pub fn units_mut(&mut self, level: Level) -> &mut UnitMap {
        match level {
            Level::Tract => &mut self.tract,
            Level::County => &mut self.county,
        }
    }

    pub fn get(&self, level: Level, geo_id: &str) -> Option<&EnumUnitRecord> {
        self.units(level).get(geo_id)
    }

    /// Merge `fields` into the unit's record. Incoming fields win on conflict.
    pub fn merge(&mut self, level: Level, geo_id: GeoId, fields: EnumUnitRecord) {
        self.units_mut(level).entry(geo_id).or_default().extend(fields);
    }

    pub fn merge_all(&mut self, level: Level, records: impl IntoIterator<Item = (GeoId, EnumUnitRecord)>) {
        for (geo_id, fields) in records {
            self.merge(level, geo_id, fields);
        }
    }

    /// Whether any unit at `level` carries `identity`.
    pub fn field_exists(&self, level: Level, identity: &str) -> bool {
        self.units(level).values().any(|r| r.contains_key(identity))
    }

    /// Numeric values of `identity` across all units at `level` that carry it.
    pub fn values(&self, level: Level, identity: &str) -> Vec<f64> {
        let mut values = Vec::new();
        for (geo_id, record) in self.units(level) {
            if let Some(v) = record.get(identity) {
                match v.as_f64() {
                    Some(x) => values.push(x),
                    None => debug!(%geo_id, identity, "Skipping non-numeric value"),
                }
            }
        }
        values
    }

    pub fn reset(&mut self, level: Level) {
        self.units_mut(level).clear();
    }

    /// Seed a level from a feature collection, keeping properties and
    /// discarding geometry. Returns the number of units ingested.
    pub fn ingest_features(&mut self, level: Level, collection: FeatureCollection, geoid_field: &str) -> usize {
        let records = records_from_collection(collection, geoid_field);
        let count = records.len();
        self.merge_all(level, records.into_iter().map(|r| (r.geo_id, r.fields)));
        info!("Seeded {} {} units", count, level);
        count
    }

    /// Sum `identity` over each county's tracts into the county records.
    ///
    /// Counties already in the store are seeded at 0, so one with no
    /// contributing tract still ends up with the field.
    pub fn roll_up(&mut self, identity: &str) -> usize {
        let sums = aggregate_counties(&self.tract, identity, self.county.keys().cloned());
        let count = sums.len();
        for (county, sum) in sums {
            let mut fields = EnumUnitRecord::new();
            fields.insert(identity.to_string(), serde_json::Value::from(sum));
            self.merge(Level::County, county, fields);
        }
        count
    }
}

/// County sums of `identity` over `tracts`, keyed by the first 5 characters of
/// each tract id.
///
/// Tracts without a numeric value for `identity` neither contribute to a sum
/// nor cause their county to appear. Every id in `seeds` appears, at 0 if no
/// tract contributes.
pub fn aggregate_counties(
    tracts: &UnitMap,
    identity: &str,
    seeds: impl IntoIterator<Item = GeoId>,
) -> HashMap<GeoId, f64> {
    let mut sums: HashMap<GeoId, f64> = seeds.into_iter().map(|c| (c, 0.0)).collect();
    for (tract, record) in tracts {
        let value = match record.get(identity).and_then(|v| v.as_f64()) {
            Some(v) => v,
            None => continue,
        };
        if let Some(county) = county_of(tract) {
            *sums.entry(county.to_string()).or_insert(0.0) += value;
        }
    }
    sums
}

/// Rename requested fields to their identities and drop everything else,
/// including the join key. Fields missing from the raw record are skipped.
pub fn rekey(record: FeatureRecord, identities: &[(String, String)]) -> (GeoId, EnumUnitRecord) {
    let FeatureRecord { geo_id, mut fields } = record;
    let mut rekeyed = EnumUnitRecord::with_capacity(identities.len());
    for (original, identity) in identities {
        if let Some(value) = fields.remove(original) {
            rekeyed.insert(identity.clone(), value);
        }
    }
    (geo_id, rekeyed)
}

/// Distinct counties implied by a set of tract ids.
pub fn counties_of<'a>(tracts: impl IntoIterator<Item = &'a str>) -> BTreeSet<GeoId> {
    tracts
        .into_iter()
        .filter_map(county_of)
        .map(str::to_string)
        .collect()
}
