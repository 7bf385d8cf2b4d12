use geojson::FeatureCollection;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::classify;
use crate::client::FeatureClient;
use crate::config::{FieldOptions, GroupOptions};
use crate::error::{VizError, VizResult};
use crate::identity::{field_identity, parameter_suffix};
use crate::query::{self, QueryDescriptor};
use crate::store::{counties_of, rekey, EnumUnitStore};
use crate::types::{ClassBreakResult, EnumUnitRecord, Level};

/// A validated request: what to fetch and how fields are renamed on arrival.
struct PreparedRequest {
    query: QueryDescriptor,
    identities: Vec<(String, String)>,
}

/// Owns the unit store for a dashboard session and runs visualization requests
/// against it.
///
/// Requests for the same level are queued: each holds its level's queue from
/// fetch to commit, so overlapping calls apply in the order they were admitted.
/// The store sits behind a synchronous lock that is never held across the fetch.
pub struct VizEngine {
    client: Arc<dyn FeatureClient>,
    store: Mutex<EnumUnitStore>,
    tract_queue: tokio::sync::Mutex<()>,
    county_queue: tokio::sync::Mutex<()>,
}

impl VizEngine {
    pub fn new(client: Arc<dyn FeatureClient>) -> Self {
        Self::with_store(client, EnumUnitStore::new())
    }

    pub fn with_store(client: Arc<dyn FeatureClient>, store: EnumUnitStore) -> Self {
        Self {
            client,
            store: Mutex::new(store),
            tract_queue: tokio::sync::Mutex::new(()),
            county_queue: tokio::sync::Mutex::new(()),
        }
    }

    fn queue(&self, level: Level) -> &tokio::sync::Mutex<()> {
        match level {
            Level::Tract => &self.tract_queue,
            Level::County => &self.county_queue,
        }
    }

    /// Fetch `fields` for `level`, merge them into the store and classify the
    /// first field (and the second, for a bivariate map).
    ///
    /// Classification runs on a staged copy of the level; the store is only
    /// updated when it succeeds.
    pub async fn update_viz(
        &self,
        level: Level,
        group: &GroupOptions,
        fields: &[FieldOptions],
        class_count: usize,
        class_method: &str,
    ) -> VizResult<Vec<ClassBreakResult>> {
        let request = prepare(group, fields, class_count, class_method)?;

        let _queued = self.queue(level).lock().await;
        let records = self.fetch(&request).await?;

        let mut store = self.lock_store();
        let mut staged = EnumUnitStore::new();
        *staged.units_mut(level) = store.units(level).clone();
        staged.merge_all(level, records);

        let results = classify_staged(&staged, level, &request, class_count, class_method)?;
        *store.units_mut(level) = std::mem::take(staged.units_mut(level));
        Ok(results)
    }

    /// Fetch tract-level `fields`, merge them into the tract store, sum each
    /// field into its counties and classify the county values.
    pub async fn update_viz_rolled_up(
        &self,
        group: &GroupOptions,
        fields: &[FieldOptions],
        class_count: usize,
        class_method: &str,
    ) -> VizResult<Vec<ClassBreakResult>> {
        let request = prepare(group, fields, class_count, class_method)?;

        // Tract before county, always.
        let _tracts = self.tract_queue.lock().await;
        let _counties = self.county_queue.lock().await;
        let records = self.fetch(&request).await?;

        let mut store = self.lock_store();
        let mut staged = store.clone();
        staged.merge_all(Level::Tract, records);
        for (_, identity) in &request.identities {
            staged.roll_up(identity);
        }
        info!(
            "Rolled up {} tracts into {} counties",
            staged.tract.len(),
            staged.county.len()
        );

        let results = classify_staged(&staged, Level::County, &request, class_count, class_method)?;
        *store = staged;
        Ok(results)
    }

    async fn fetch(&self, request: &PreparedRequest) -> VizResult<Vec<(String, EnumUnitRecord)>> {
        let raw = self.client.fetch_features(&request.query).await?;
        let records: Vec<_> = raw
            .into_iter()
            .map(|r| rekey(r, &request.identities))
            .collect();

        info!(
            "Retrieved attributes for {} units in {} counties",
            records.len(),
            counties_of(records.iter().map(|(id, _)| id.as_str())).len()
        );
        Ok(records)
    }

    pub async fn record(&self, level: Level, geo_id: &str) -> Option<EnumUnitRecord> {
        self.lock_store().get(level, geo_id).cloned()
    }

    pub async fn field_exists(&self, level: Level, identity: &str) -> bool {
        self.lock_store().field_exists(level, identity)
    }

    pub async fn reset(&self, level: Level) {
        let _queued = self.queue(level).lock().await;
        self.lock_store().reset(level);
    }

    pub async fn seed(&self, level: Level, collection: FeatureCollection, geoid_field: &str) -> usize {
        let _queued = self.queue(level).lock().await;
        self.lock_store().ingest_features(level, collection, geoid_field)
    }

    /// Copy of the current store contents.
    pub async fn snapshot(&self) -> EnumUnitStore {
        self.lock_store().clone()
    }

    // Never held across an await. A panic mid-commit leaves the previous
    // contents in place, so a poisoned lock is still usable.
    fn lock_store(&self) -> MutexGuard<'_, EnumUnitStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn prepare(
    group: &GroupOptions,
    fields: &[FieldOptions],
    class_count: usize,
    class_method: &str,
) -> VizResult<PreparedRequest> {
    classify::validate(class_count, class_method)?;
    group.validate()?;

    let first = fields
        .first()
        .ok_or_else(|| VizError::invalid_request("at least one field option is required"))?;
    let shared = parameter_suffix(&first.parameters);
    if let Some(other) = fields
        .iter()
        .find(|f| parameter_suffix(&f.parameters) != shared)
    {
        return Err(VizError::invalid_request(format!(
            "field '{}' has different parameters than '{}'; fields in one request must share parameters",
            other.property_name, first.property_name
        )));
    }

    let identities = fields
        .iter()
        .map(|f| {
            (
                f.property_name.clone(),
                field_identity(group, f, &first.parameters),
            )
        })
        .collect();

    Ok(PreparedRequest {
        query: query::build(group, fields)?,
        identities,
    })
}

fn classify_staged(
    staged: &EnumUnitStore,
    level: Level,
    request: &PreparedRequest,
    class_count: usize,
    class_method: &str,
) -> VizResult<Vec<ClassBreakResult>> {
    let mut symbolized = request.identities.iter().map(|(_, id)| id);
    let values1 = symbolized
        .next()
        .map(|id| staged.values(level, id))
        .unwrap_or_default();
    let values2 = symbolized.next().map(|id| staged.values(level, id));
    classify::class_breaks(class_count, class_method, &values1, values2.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FeatureRecord;
    use crate::config::ParamValue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TOTAL: &str = "solap|demographics|total";

    struct StubClient {
        responses: std::sync::Mutex<VecDeque<(Duration, VizResult<Vec<FeatureRecord>>)>>,
        fallback: Vec<FeatureRecord>,
        calls: AtomicUsize,
    }

    impl StubClient {
        fn fixed(records: Vec<FeatureRecord>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(VecDeque::new()),
                fallback: records,
                calls: AtomicUsize::new(0),
            })
        }

        fn sequence(responses: Vec<(Duration, VizResult<Vec<FeatureRecord>>)>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into()),
                fallback: Vec::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FeatureClient for StubClient {
        async fn fetch_features(&self, _query: &QueryDescriptor) -> VizResult<Vec<FeatureRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some((delay, response)) => {
                    tokio::time::sleep(delay).await;
                    response
                }
                None => Ok(self.fallback.clone()),
            }
        }
    }

    fn tract(geo_id: &str, fields: &[(&str, serde_json::Value)]) -> FeatureRecord {
        let mut all: EnumUnitRecord = fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        all.insert("tract_geoid".into(), json!(geo_id));
        FeatureRecord {
            geo_id: geo_id.to_string(),
            fields: all,
        }
    }

    fn demographics() -> GroupOptions {
        GroupOptions {
            service_url: "http://localhost:8080/geoserver/wfs".into(),
            workspace: "solap".into(),
            layer: "demographics".into(),
            geoid_field: "tract_geoid".into(),
        }
    }

    fn pollutants() -> GroupOptions {
        GroupOptions {
            layer: "caces_pollutants".into(),
            ..demographics()
        }
    }

    fn totals() -> Vec<FeatureRecord> {
        vec![
            tract("27001010100", &[("total", json!(100))]),
            tract("27001010200", &[("total", json!(200))]),
        ]
    }

    #[tokio::test]
    async fn test_update_viz_end_to_end() {
        let engine = VizEngine::new(StubClient::fixed(totals()));
        let results = engine
            .update_viz(Level::Tract, &demographics(), &[FieldOptions::new("total")], 3, "quantile")
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].min_val, 100.0);
        assert_eq!(results[0].breaks.len(), 3);

        let store = engine.snapshot().await;
        assert_eq!(store.tract.len(), 2);
        for geo_id in ["27001010100", "27001010200"] {
            let record = &store.tract[geo_id];
            assert!(record.contains_key(TOTAL));
            assert!(!record.contains_key("tract_geoid"));
            assert!(!record.contains_key("total"));
        }
        assert!(store.county.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_method_leaves_store_untouched() {
        let client = StubClient::fixed(totals());
        let engine = VizEngine::new(client.clone());
        let err = engine
            .update_viz(Level::Tract, &demographics(), &[FieldOptions::new("total")], 5, "equal")
            .await
            .unwrap_err();

        assert!(matches!(err, VizError::UnsupportedClassification(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert!(!engine.field_exists(Level::Tract, TOTAL).await);
    }

    #[tokio::test]
    async fn test_class_count_out_of_range() {
        let engine = VizEngine::new(StubClient::fixed(totals()));
        for class_count in [2, 10] {
            let err = engine
                .update_viz(Level::Tract, &demographics(), &[FieldOptions::new("total")], class_count, "quantile")
                .await
                .unwrap_err();
            assert!(matches!(err, VizError::UnsupportedClassification(_)));
        }
        assert!(engine.snapshot().await.tract.is_empty());
    }

    #[tokio::test]
    async fn test_update_viz_idempotent() {
        let engine = VizEngine::new(StubClient::fixed(totals()));
        let fields = [FieldOptions::new("total")];
        let first = engine
            .update_viz(Level::Tract, &demographics(), &fields, 5, "quantile")
            .await
            .unwrap();
        let store_after_first = engine.snapshot().await;
        let second = engine
            .update_viz(Level::Tract, &demographics(), &fields, 5, "quantile")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store_after_first, engine.snapshot().await);
    }

    #[tokio::test]
    async fn test_parameterized_fields_accumulate_without_collision() {
        let client = StubClient::sequence(vec![
            (Duration::ZERO, Ok(vec![tract("27001010100", &[("data_value", json!(1.5))])])),
            (Duration::ZERO, Ok(vec![tract("27001010100", &[("data_value", json!(9.0))])])),
        ]);
        let engine = VizEngine::new(client);
        let so2 = FieldOptions::new("data_value").with_param("pollutant", "so2").with_param("year", 2005);
        let no2 = FieldOptions::new("data_value").with_param("pollutant", "no2").with_param("year", 2005);

        engine
            .update_viz(Level::Tract, &pollutants(), &[so2], 3, "quantile")
            .await
            .unwrap();
        engine
            .update_viz(Level::Tract, &pollutants(), &[no2], 3, "quantile")
            .await
            .unwrap();

        let record = engine.record(Level::Tract, "27001010100").await.unwrap();
        assert_eq!(record["solap|caces_pollutants|data_value|pollutant:so2|year:2005"], 1.5);
        assert_eq!(record["solap|caces_pollutants|data_value|pollutant:no2|year:2005"], 9.0);
    }

    #[tokio::test]
    async fn test_bivariate_returns_two_three_class_results() {
        let records = (1..=12)
            .map(|i| {
                tract(
                    &format!("270010{:05}", i),
                    &[("total", json!(i * 10)), ("male", json!(i * 4))],
                )
            })
            .collect();
        let engine = VizEngine::new(StubClient::fixed(records));
        let results = engine
            .update_viz(
                Level::Tract,
                &demographics(),
                &[FieldOptions::new("total"), FieldOptions::new("male")],
                7,
                "quantile",
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.breaks.len() == 3));
        assert_eq!(results[0].min_val, 10.0);
        assert_eq!(results[1].min_val, 4.0);
    }

    #[tokio::test]
    async fn test_mismatched_parameters_rejected() {
        let client = StubClient::fixed(Vec::new());
        let engine = VizEngine::new(client.clone());
        let fields = [
            FieldOptions::new("data_value").with_param("pollutant", "so2"),
            FieldOptions::new("other").with_param("pollutant", "no2"),
        ];
        let err = engine
            .update_viz(Level::Tract, &pollutants(), &fields, 3, "quantile")
            .await
            .unwrap_err();
        assert!(matches!(err, VizError::InvalidRequest(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_equivalent_parameters_accepted() {
        let records = vec![tract(
            "27001010100",
            &[("data_value", json!(2.5)), ("other", json!(4.0))],
        )];
        let engine = VizEngine::new(StubClient::fixed(records));
        let fields = [
            FieldOptions::new("data_value").with_param("year", 2005),
            FieldOptions::new("other").with_param("year", ParamValue::Float(2005.0)),
        ];
        engine
            .update_viz(Level::Tract, &pollutants(), &fields, 3, "quantile")
            .await
            .unwrap();

        let record = engine.record(Level::Tract, "27001010100").await.unwrap();
        assert_eq!(record["solap|caces_pollutants|other|year:2005"], 4.0);
    }

    #[tokio::test]
    async fn test_missing_group_option_rejected() {
        let engine = VizEngine::new(StubClient::fixed(totals()));
        let group = GroupOptions {
            geoid_field: String::new(),
            ..demographics()
        };
        let err = engine
            .update_viz(Level::Tract, &group, &[FieldOptions::new("total")], 3, "quantile")
            .await
            .unwrap_err();
        assert!(matches!(err, VizError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_transport_error_leaves_store_untouched() {
        let client = StubClient::sequence(vec![(
            Duration::ZERO,
            Err(VizError::transport("connection refused")),
        )]);
        let engine = VizEngine::new(client);
        let err = engine
            .update_viz(Level::Tract, &demographics(), &[FieldOptions::new("total")], 3, "quantile")
            .await
            .unwrap_err();
        assert!(matches!(err, VizError::Transport(_)));
        assert!(engine.snapshot().await.tract.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_data_does_not_commit() {
        let records = vec![tract("27001010100", &[("male", json!(3))])];
        let engine = VizEngine::new(StubClient::fixed(records));
        let err = engine
            .update_viz(
                Level::Tract,
                &demographics(),
                &[FieldOptions::new("total"), FieldOptions::new("male")],
                3,
                "quantile",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VizError::InsufficientData(_)));
        assert!(engine.snapshot().await.tract.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_calls_apply_in_admission_order() {
        let client = StubClient::sequence(vec![
            (
                Duration::from_millis(50),
                Ok(vec![tract("27001010100", &[("total", json!(1))])]),
            ),
            (Duration::ZERO, Ok(vec![tract("27001010100", &[("total", json!(2))])])),
        ]);
        let engine = VizEngine::new(client);
        let group = demographics();
        let fields = [FieldOptions::new("total")];

        let (a, b) = tokio::join!(
            engine.update_viz(Level::Tract, &group, &fields, 3, "quantile"),
            engine.update_viz(Level::Tract, &group, &fields, 3, "quantile"),
        );
        assert_eq!(a.unwrap()[0].min_val, 1.0);
        assert_eq!(b.unwrap()[0].min_val, 2.0);

        let record = engine.record(Level::Tract, "27001010100").await.unwrap();
        assert_eq!(record[TOTAL], 2);
    }

    #[tokio::test]
    async fn test_rolled_up_counties() {
        let records = vec![
            tract("27001010100", &[("total", json!(10))]),
            tract("27001010200", &[("total", json!(5))]),
            tract("27003010100", &[("total", json!(7))]),
        ];
        let mut seeded = EnumUnitStore::new();
        seeded.merge(Level::County, "27005".into(), EnumUnitRecord::new());
        let engine = VizEngine::with_store(StubClient::fixed(records), seeded);

        let results = engine
            .update_viz_rolled_up(&demographics(), &[FieldOptions::new("total")], 3, "quantile")
            .await
            .unwrap();
        assert_eq!(results[0].min_val, 0.0);
        assert_eq!(*results[0].breaks.last().unwrap(), 15.0);

        let store = engine.snapshot().await;
        assert_eq!(store.tract.len(), 3);
        assert_eq!(store.county["27001"][TOTAL].as_f64(), Some(15.0));
        assert_eq!(store.county["27003"][TOTAL].as_f64(), Some(7.0));
        assert_eq!(store.county["27005"][TOTAL].as_f64(), Some(0.0));
    }

    #[test]
    fn test_engine_futures_are_send() {
        fn assert_send<T: Send>(_: T) {}
        let engine = VizEngine::new(StubClient::fixed(Vec::new()));
        let group = demographics();
        let fields = [FieldOptions::new("total")];
        assert_send(engine.update_viz(Level::Tract, &group, &fields, 3, "quantile"));
        assert_send(engine.update_viz_rolled_up(&group, &fields, 3, "quantile"));
        assert_send(engine.record(Level::Tract, "27001010100"));
        assert_send(engine.reset(Level::Tract));
    }

    #[tokio::test]
    async fn test_store_usable_after_poisoned_lock() {
        let engine = Arc::new(VizEngine::new(StubClient::fixed(totals())));
        let holder = engine.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.store.lock().unwrap();
            panic!("panicked while holding the store");
        })
        .join();
        assert!(engine.store.is_poisoned());

        engine
            .update_viz(Level::Tract, &demographics(), &[FieldOptions::new("total")], 3, "quantile")
            .await
            .unwrap();
        assert!(engine.field_exists(Level::Tract, TOTAL).await);
    }

    #[tokio::test]
    async fn test_reset_clears_level() {
        let engine = VizEngine::new(StubClient::fixed(totals()));
        engine
            .update_viz(Level::Tract, &demographics(), &[FieldOptions::new("total")], 3, "quantile")
            .await
            .unwrap();
        engine.reset(Level::Tract).await;
        assert!(engine.record(Level::Tract, "27001010100").await.is_none());
    }
}
