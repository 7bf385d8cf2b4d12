use crate::config::AppConfig;
use crate::viz::VizEngine;
use anyhow::{Context, Result, anyhow};
use geojson::{FeatureCollection, GeoJson};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

/// Seed the store with every `[[layers]]` entry in the configuration.
pub async fn seed_layers(config: &AppConfig, engine: &VizEngine) -> Result<usize> {
    let mut total = 0;
    for layer in &config.layers {
        let collection = load_feature_collection(&layer.path)?;
        total += engine.seed(layer.level, collection, &layer.geoid_field).await;
    }
    Ok(total)
}

pub fn load_feature_collection(path: &Path) -> Result<FeatureCollection> {
    info!("Loading GeoJSON from {:?}...", path);
    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let reader = BufReader::new(file);

    // Loads the whole file into memory.
    let geojson = GeoJson::from_reader(reader).context("Failed to parse GeoJSON")?;

    match geojson {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        _ => Err(anyhow!("GeoJSON must be a FeatureCollection")),
    }
}
