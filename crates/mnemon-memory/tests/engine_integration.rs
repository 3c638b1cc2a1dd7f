//! End-to-end tests for the memory engine.
//!
//! Most tests use an in-process gateway that returns the same unit vector for
//! every input, so ranking is decided by activation and recency alone. No
//! external services are contacted.

use async_trait::async_trait;
use mnemon_memory::embedding::{EmbeddingGateway, SectorEmbedding};
use mnemon_memory::MemoryEngine;
use mnemon_types::config::{
    CompressionOptions, DecayOptions, EmbeddingOptions, EngineOptions, IngestOptions,
    ReflectionOptions,
};
use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::memory::{AddOptions, MemoryId, QueryOptions, Sector, COMPRESSION_META_KEY};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DIMS: usize = 256;

// ---------------------------------------------------------------------------
// Test gateways
// ---------------------------------------------------------------------------

/// Returns the same unit vector for everything, optionally after a delay.
struct ConstantGateway {
    delay: Duration,
    calls: AtomicUsize,
}

impl ConstantGateway {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EmbeddingGateway for ConstantGateway {
    async fn embed(
        &self,
        _content: &str,
        sectors: &[Sector],
        _chunks: Option<&[String]>,
    ) -> MnemonResult<Vec<SectorEmbedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut v = vec![0.0; DIMS];
        v[0] = 1.0;
        Ok(sectors
            .iter()
            .map(|s| SectorEmbedding {
                sector: *s,
                vector: v.clone(),
                dim: DIMS,
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Always fails, like an unreachable provider.
struct FailingGateway;

#[async_trait]
impl EmbeddingGateway for FailingGateway {
    async fn embed(
        &self,
        _content: &str,
        _sectors: &[Sector],
        _chunks: Option<&[String]>,
    ) -> MnemonResult<Vec<SectorEmbedding>> {
        Err(MnemonError::Provider("connection refused".to_string()))
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Drops the last requested sector.
struct ShortGateway;

#[async_trait]
impl EmbeddingGateway for ShortGateway {
    async fn embed(
        &self,
        content: &str,
        sectors: &[Sector],
        chunks: Option<&[String]>,
    ) -> MnemonResult<Vec<SectorEmbedding>> {
        let mut out = ConstantGateway::new().embed(content, sectors, chunks).await?;
        out.pop();
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

fn options() -> EngineOptions {
    EngineOptions::new(":memory:", "fast", EmbeddingOptions::synthetic())
}

async fn constant_engine(opts: EngineOptions) -> MemoryEngine {
    MemoryEngine::open_with_gateway(opts, ConstantGateway::new())
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_required_fields_name_the_field() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("mem.db");
    let db_str = db.to_string_lossy().into_owned();

    let cases: Vec<(&str, EngineOptions)> = vec![
        ("path", {
            let mut o = options();
            o.path = None;
            o
        }),
        ("tier", {
            let mut o = options();
            o.path = Some(db_str.clone());
            o.tier = None;
            o
        }),
        ("embeddings", {
            let mut o = options();
            o.path = Some(db_str.clone());
            o.embeddings = None;
            o
        }),
    ];

    for (field, opts) in cases {
        match MemoryEngine::open(opts).await {
            Err(MnemonError::Config { field: f, .. }) => assert_eq!(f, field),
            Err(other) => panic!("expected config error for {field}, got {other}"),
            Ok(_) => panic!("expected config error for {field}"),
        }
    }
    assert!(!db.parent().unwrap().exists(), "no store may be opened");
}

#[tokio::test]
async fn test_gateway_dimension_mismatch_is_a_config_error() {
    let mut opts = options();
    opts.tier = Some("smart".to_string());
    let err = MemoryEngine::open_with_gateway(opts, ConstantGateway::new())
        .await
        .err()
        .unwrap();
    assert!(
        matches!(err, MnemonError::Config { ref field, .. } if field == "embeddings.dimensions")
    );
}

#[tokio::test]
async fn test_out_of_range_interval_is_a_config_error() {
    for minutes in [1e300, 1e-12] {
        let mut opts = options();
        opts.decay = Some(DecayOptions {
            interval_minutes: Some(minutes),
            ..Default::default()
        });
        let err = MemoryEngine::open(opts).await.err().unwrap();
        assert!(
            matches!(err, MnemonError::Config { ref field, .. } if field == "decay.interval_minutes")
        );
    }
}

#[tokio::test]
async fn test_toml_options_open_a_file_backed_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("memory.db");
    let toml = format!(
        r#"
path = "{}"
tier = "fast"

[embeddings]
provider = "synthetic"

[decay]
interval_minutes = 30.0
cold_threshold = 0.2
"#,
        path.to_string_lossy().replace('\\', "/")
    );
    let opts = EngineOptions::from_toml_str(&toml).unwrap();

    let engine = MemoryEngine::open(opts.clone()).await.unwrap();
    let record = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .unwrap();
    engine.close().await.unwrap();

    let reopened = MemoryEngine::open(opts).await.unwrap();
    assert_eq!(reopened.count().await.unwrap(), 1);
    assert_eq!(reopened.get(record.id).await.unwrap().content, record.content);
    reopened.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Add / classify
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_add_classifies_example_memories() {
    let engine = MemoryEngine::open(options()).await.unwrap();

    let trip = engine
        .add(
            "I went to Paris yesterday and loved the Eiffel Tower",
            AddOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(trip.sectors[0], Sector::Episodic);

    let fact = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .unwrap();
    assert_eq!(fact.sectors, vec![Sector::Semantic]);

    let recipe = engine
        .add("1) Heat water 2) Add grounds 3) Pour", AddOptions::default())
        .await
        .unwrap();
    assert_eq!(recipe.sectors[0], Sector::Procedural);

    for record in [&trip, &fact, &recipe] {
        assert!(!record.sectors.is_empty());
        for sector in &record.sectors {
            assert_eq!(record.embeddings[sector].len(), DIMS);
        }
    }
    let ids: std::collections::HashSet<MemoryId> =
        [trip.id, fact.id, recipe.id].into_iter().collect();
    assert_eq!(ids.len(), 3);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_pinned_sector_and_custom_lambda() {
    let engine = constant_engine(options()).await;
    let record = engine
        .add(
            "Quarterly numbers look fine",
            AddOptions::default()
                .tags(["sector:emotional", "work"])
                .decay_lambda(0.5),
        )
        .await
        .unwrap();
    assert_eq!(record.sectors[0], Sector::Emotional);
    assert_eq!(record.decay_lambda, 0.5);
    assert_eq!(record.tags, vec!["sector:emotional", "work"]);

    let err = engine
        .add("x", AddOptions::default().tags(["sector:imaginary"]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MnemonError::InvalidInput(_)));
    assert_eq!(engine.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_provider_failure_surfaces_and_stores_nothing() {
    let engine = MemoryEngine::open_with_gateway(options(), Arc::new(FailingGateway))
        .await
        .unwrap();
    let err = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MnemonError::Provider(_)));
    assert_eq!(engine.count().await.unwrap(), 0);

    let err = engine.query("Paris", QueryOptions::default()).await.err().unwrap();
    assert!(matches!(err, MnemonError::Provider(_)));
}

#[tokio::test]
async fn test_gateway_missing_a_sector_is_rejected() {
    let engine = MemoryEngine::open_with_gateway(options(), Arc::new(ShortGateway))
        .await
        .unwrap();
    let err = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MnemonError::Provider(_)));
    assert_eq!(engine.count().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Query / reinforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_recently_reinforced_episodic_memory_ranks_first() {
    let engine = constant_engine(options()).await;
    let trip = engine
        .add(
            "I went to Paris yesterday and loved the Eiffel Tower",
            AddOptions::default(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let fact = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let listed = engine.get_by_sector(Sector::Episodic, None, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, trip.id);

    let results = engine
        .query("Paris travel experience", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].record.id, trip.id);
    assert_eq!(results[1].record.id, fact.id);
    assert!((results[0].similarity - results[1].similarity).abs() < 1e-6);
}

#[tokio::test]
async fn test_query_respects_limit_order_and_sector_filter() {
    let engine = MemoryEngine::open(options()).await.unwrap();
    engine
        .add("1) Heat water 2) Add grounds 3) Pour", AddOptions::default())
        .await
        .unwrap();
    engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .unwrap();
    for i in 0..6 {
        engine
            .add(&format!("Coffee brewing fact number {i}"), AddOptions::default())
            .await
            .unwrap();
    }

    let results = engine
        .query("coffee brewing", QueryOptions::default().limit(3))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    for pair in results.windows(2) {
        assert!(pair[0].rank >= pair[1].rank);
    }

    let procedural = engine
        .query("how to make coffee", QueryOptions::sector(Sector::Procedural))
        .await
        .unwrap();
    assert!(!procedural.is_empty());
    assert!(procedural.iter().all(|r| r.record.has_sector(Sector::Procedural)));

    assert!(engine
        .query("coffee", QueryOptions::default().limit(0))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_query_reinforcement_never_lowers_activation() {
    let engine = constant_engine(options()).await;
    let record = engine
        .add("The capital of France is Paris", AddOptions::default().decay_lambda(200.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.decay_now().await.unwrap();
    let before = engine.get(record.id).await.unwrap();
    assert!(before.activation_score < 1.0);

    let results = engine.query("Paris", QueryOptions::default()).await.unwrap();
    assert_eq!(results.len(), 1);
    let returned = &results[0].record;
    assert!(returned.activation_score >= before.activation_score);
    assert!(returned.last_accessed_at > before.last_accessed_at);

    let after = engine.get(record.id).await.unwrap();
    assert!((after.activation_score - returned.activation_score).abs() < 1e-6);
}

#[tokio::test]
async fn test_query_without_reinforcement_leaves_activation() {
    let mut opts = options();
    opts.decay = Some(DecayOptions {
        reinforce_on_query: Some(false),
        ..Default::default()
    });
    let engine = constant_engine(opts).await;
    let record = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .unwrap();
    let before = engine.get(record.id).await.unwrap();
    engine.query("Paris", QueryOptions::default()).await.unwrap();
    let after = engine.get(record.id).await.unwrap();
    assert_eq!(after.last_accessed_at, before.last_accessed_at);
    assert_eq!(after.activation_score, before.activation_score);
}

// ---------------------------------------------------------------------------
// Decay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_activation_is_bounded_and_non_increasing_under_decay() {
    let engine = constant_engine(options()).await;
    let record = engine
        .add("The capital of France is Paris", AddOptions::default().decay_lambda(500.0))
        .await
        .unwrap();

    let mut last = record.activation_score;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.decay_now().await.unwrap();
        let current = engine.get(record.id).await.unwrap().activation_score;
        assert!((0.0..=1.0).contains(&current));
        assert!(current <= last);
        last = current;
    }
    assert!(last < 1.0);
}

#[tokio::test]
async fn test_cold_records_hidden_from_listing_and_query() {
    let mut opts = options();
    opts.decay = Some(DecayOptions {
        cold_threshold: Some(0.99),
        ..Default::default()
    });
    let engine = constant_engine(opts).await;
    let faded = engine
        .add("The capital of France is Paris", AddOptions::default().decay_lambda(1_000_000.0))
        .await
        .unwrap();
    let steady = engine
        .add("Water boils at 100 degrees", AddOptions::default().decay_lambda(0.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = engine.decay_now().await.unwrap();
    assert_eq!(report.cold_marked, 1);

    let all = engine.get_all(None, None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, steady.id);

    let hits = engine.query("Paris", QueryOptions::default()).await.unwrap();
    assert!(hits.iter().all(|r| r.record.id != faded.id));

    let with_cold = engine
        .query(
            "Paris",
            QueryOptions {
                include_cold: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(with_cold.iter().any(|r| r.record.id == faded.id));
    assert_eq!(engine.count().await.unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Delete / listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_removes_and_unknown_is_not_found() {
    let engine = constant_engine(options()).await;
    let keep = engine
        .add("The capital of France is Paris", AddOptions::default())
        .await
        .unwrap();
    let gone = engine
        .add("Water boils at 100 degrees", AddOptions::default())
        .await
        .unwrap();

    engine.delete(gone.id).await.unwrap();
    let all = engine.get_all(None, None).await.unwrap();
    assert!(all.iter().all(|r| r.id != gone.id));
    assert!(all.iter().any(|r| r.id == keep.id));

    let err = engine.delete(MemoryId::new()).await.err().unwrap();
    assert!(matches!(err, MnemonError::NotFound(_)));
    assert!(matches!(
        engine.delete(gone.id).await,
        Err(MnemonError::NotFound(_))
    ));
    assert_eq!(engine.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_get_all_pagination() {
    let engine = constant_engine(options()).await;
    for i in 0..5 {
        engine
            .add(&format!("Fact number {i}"), AddOptions::default())
            .await
            .unwrap();
    }
    let first = engine.get_all(Some(2), None).await.unwrap();
    let second = engine.get_all(Some(2), Some(2)).await.unwrap();
    let rest = engine.get_all(None, Some(4)).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(rest.len(), 1);
    assert!(first.iter().all(|r| r.embeddings.is_empty()));
}

// ---------------------------------------------------------------------------
// Reflection
// ---------------------------------------------------------------------------

fn reflection_options() -> EngineOptions {
    let mut opts = options();
    opts.reflection = Some(ReflectionOptions {
        enabled: Some(false),
        min_memories: Some(5),
        ..Default::default()
    });
    opts
}

#[tokio::test]
async fn test_reflection_needs_min_memories() {
    let engine = constant_engine(reflection_options()).await;
    for i in 0..4 {
        engine
            .add(&format!("Espresso needs finely ground coffee, note {i}"), AddOptions::default())
            .await
            .unwrap();
    }
    let report = engine.reflect_now().await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(engine.count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_reflection_synthesizes_one_record_per_cluster() {
    let engine = constant_engine(reflection_options()).await;
    let mut sources = Vec::new();
    for i in 0..5 {
        let r = engine
            .add(&format!("Espresso needs finely ground coffee, note {i}"), AddOptions::default())
            .await
            .unwrap();
        sources.push(r.id);
    }

    let report = engine.reflect_now().await.unwrap();
    assert_eq!(report.created.len(), 1);
    let reflection = engine.get(report.created[0]).await.unwrap();
    assert_eq!(reflection.sectors, vec![Sector::Reflective]);
    assert_eq!(reflection.embeddings[&Sector::Reflective].len(), DIMS);

    let mut derived = reflection.derived_from.clone().unwrap();
    derived.sort();
    sources.sort();
    assert_eq!(derived, sources);

    // Sources survive, and an unchanged set is not reflected again.
    assert_eq!(engine.count().await.unwrap(), 6);
    let again = engine.reflect_now().await.unwrap();
    assert!(again.created.is_empty());
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

fn padded_text() -> String {
    "This  is   a   really   very   long   note   about   the   build   pipeline.   ".repeat(4)
}

#[tokio::test]
async fn test_compression_on_ingest_records_provenance() {
    let mut opts = options();
    opts.compression = Some(CompressionOptions {
        enabled: Some(true),
        algorithm: Some("lexical".to_string()),
        min_length: Some(50),
        ..Default::default()
    });
    let engine = constant_engine(opts).await;

    let text = padded_text();
    let long = engine.add(&text, AddOptions::default()).await.unwrap();
    assert!(long.compressed);
    assert!(long.content.chars().count() < text.chars().count());
    let meta = &long.metadata[COMPRESSION_META_KEY];
    assert_eq!(meta["algorithm"], "lexical");
    assert_eq!(meta["original_length"], text.chars().count());

    let short = engine.add("Short note", AddOptions::default()).await.unwrap();
    assert!(!short.compressed);
    assert_eq!(short.content, "Short note");
}

#[tokio::test]
async fn test_compress_pass_shrinks_existing_records() {
    let mut opts = options();
    opts.compression = Some(CompressionOptions {
        enabled: Some(false),
        algorithm: Some("lexical".to_string()),
        min_length: Some(50),
        ..Default::default()
    });
    let engine = constant_engine(opts).await;
    let text = padded_text();
    let long = engine.add(&text, AddOptions::default()).await.unwrap();
    assert!(!long.compressed);
    assert_eq!(long.content, text);
    engine.add("Short note", AddOptions::default()).await.unwrap();

    let report = engine.compress_pass().await.unwrap();
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.compressed, 1);
    assert!(report.chars_saved > 0);

    let stored = engine.get(long.id).await.unwrap();
    assert!(stored.compressed);
    assert!(stored.metadata.contains_key(COMPRESSION_META_KEY));

    let again = engine.compress_pass().await.unwrap();
    assert_eq!(again.compressed, 0);
}

// ---------------------------------------------------------------------------
// Users / deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_queries_and_listing_scoped_by_user() {
    let engine = constant_engine(options()).await;
    let alice = engine
        .add("Alice prefers tea", AddOptions::default().user("alice"))
        .await
        .unwrap();
    let bob = engine
        .add("Bob prefers coffee", AddOptions::default().user("bob"))
        .await
        .unwrap();
    engine.add("Shared office note", AddOptions::default()).await.unwrap();
    assert_eq!(alice.user_id.as_deref(), Some("alice"));

    let results = engine
        .query("prefers", QueryOptions::default().user("bob"))
        .await
        .unwrap();
    let ids: Vec<MemoryId> = results.iter().map(|r| r.record.id).collect();
    assert_eq!(ids, vec![bob.id]);

    let owned = engine.get_by_user("alice", None, None).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, alice.id);
    assert!(engine.get_by_user("carol", None, None).await.unwrap().is_empty());

    assert_eq!(engine.query("prefers", QueryOptions::default()).await.unwrap().len(), 3);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_content_reinforces_existing_when_enabled() {
    let mut opts = options();
    opts.ingest = Some(IngestOptions {
        deduplicate: Some(true),
    });
    let engine = constant_engine(opts).await;

    let first = engine
        .add("The build server reboots at midnight.", AddOptions::default().user("ops"))
        .await
        .unwrap();
    let again = engine
        .add("the build server REBOOTS at midnight", AddOptions::default().user("ops"))
        .await
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(engine.count().await.unwrap(), 1);

    let other_user = engine
        .add("The build server reboots at midnight.", AddOptions::default().user("dev"))
        .await
        .unwrap();
    assert_ne!(other_user.id, first.id);
    assert_eq!(engine.count().await.unwrap(), 2);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_content_gets_fresh_id_by_default() {
    let engine = constant_engine(options()).await;
    let a = engine.add("Same words", AddOptions::default()).await.unwrap();
    let b = engine.add("Same words", AddOptions::default()).await.unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(engine.count().await.unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Concurrency / shutdown
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_foreground_and_maintenance() {
    let engine = Arc::new(constant_engine(options()).await);
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .add(&format!("Concurrent fact {i}"), AddOptions::default())
                .await?;
            engine.query("fact", QueryOptions::default()).await?;
            engine.decay_now().await?;
            Ok::<_, MnemonError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(engine.count().await.unwrap(), 16);
    for record in engine.get_all(None, None).await.unwrap() {
        assert!((0.0..=1.0).contains(&record.activation_score));
    }
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_in_flight_add() {
    let gateway = ConstantGateway::with_delay(Duration::from_millis(50));
    let engine = Arc::new(
        MemoryEngine::open_with_gateway(options(), gateway.clone())
            .await
            .unwrap(),
    );

    let adder = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .add("The capital of France is Paris", AddOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);

    engine.close().await.unwrap();
    let record = adder.await.unwrap().unwrap();
    assert_eq!(record.sectors, vec![Sector::Semantic]);

    assert!(matches!(
        engine.get(record.id).await,
        Err(MnemonError::ShuttingDown)
    ));
    assert!(matches!(
        engine.query("Paris", QueryOptions::default()).await,
        Err(MnemonError::ShuttingDown)
    ));
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_close_calls_all_wait_for_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("close.db").to_string_lossy().into_owned();
    let mut opts = options();
    opts.path = Some(path.clone());

    let gateway = ConstantGateway::with_delay(Duration::from_millis(100));
    let engine = Arc::new(
        MemoryEngine::open_with_gateway(opts.clone(), gateway)
            .await
            .unwrap(),
    );

    let adder = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.add("Slow write", AddOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first_close = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.close().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(engine.is_closed());

    // The second caller must not return before the first has finished.
    engine.close().await.unwrap();
    assert!(adder.is_finished());
    first_close.await.unwrap().unwrap();
    adder.await.unwrap().unwrap();

    let reopened = MemoryEngine::open(opts).await.unwrap();
    assert_eq!(reopened.count().await.unwrap(), 1);
    reopened.close().await.unwrap();
}
