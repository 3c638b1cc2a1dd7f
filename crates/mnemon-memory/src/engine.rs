//! The memory engine: the public entry point tying classification,
//! embedding, compression, storage, retrieval and background maintenance
//! together.

use crate::classifier::{self, Hints};
use crate::compression::{Compressor, Summarizer};
use crate::decay::{DecayEngine, SCAN_BATCH_SIZE};
use crate::embedding::{BoundedGateway, DriverGateway, EmbeddingGateway};
use crate::reflection::ReflectionEngine;
use crate::retrieval::{self, ActivationDampedRank, RankPolicy};
use crate::scheduler::Scheduler;
use crate::store::{RecordStore, ScanFilter};
use crate::summarizer::create_summarizer;
use chrono::Utc;
use mnemon_types::config::{ColdPolicy, EngineConfig, EngineOptions};
use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::memory::{
    AddOptions, CompressionReport, DecayReport, MemoryId, MemoryRecord, QueryOptions,
    ReflectionReport, ScoredRecord, Sector,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, OnceCell, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

/// Builder for a [`MemoryEngine`] with custom components.
pub struct EngineBuilder {
    options: EngineOptions,
    gateway: Option<Arc<dyn EmbeddingGateway>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    rank_policy: Option<Arc<dyn RankPolicy>>,
}

impl EngineBuilder {
    /// Use this gateway instead of the one described by `embeddings`.
    pub fn gateway(mut self, gateway: Arc<dyn EmbeddingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Summarizer for semantic compression and reflections.
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Ranking policy for queries.
    pub fn rank_policy(mut self, policy: Arc<dyn RankPolicy>) -> Self {
        self.rank_policy = Some(policy);
        self
    }

    /// Validate the options, open the store and start background maintenance.
    ///
    /// Must be called within a tokio runtime.
    pub async fn open(self) -> MnemonResult<MemoryEngine> {
        let config = self.options.validate()?;

        let gateway: Arc<dyn EmbeddingGateway> = match self.gateway {
            Some(g) => g,
            None => Arc::new(DriverGateway::from_config(&config.embeddings)?),
        };
        if gateway.dimensions() != config.embeddings.dimensions {
            return Err(MnemonError::config(
                "embeddings.dimensions",
                format!(
                    "gateway produces {}-dimensional vectors but the engine expects {}",
                    gateway.dimensions(),
                    config.embeddings.dimensions
                ),
            ));
        }
        let gateway = BoundedGateway::new(gateway, config.max_concurrent_embeddings);
        let summarizer: Arc<dyn Summarizer> = match self.summarizer {
            Some(s) => s,
            None => create_summarizer(&config.embeddings),
        };
        let rank_policy: Arc<dyn RankPolicy> = match self.rank_policy {
            Some(p) => p,
            None => Arc::new(ActivationDampedRank),
        };

        let store = RecordStore::open(&config.path)?;

        let inner = Arc::new(Inner {
            compressor: Compressor::from_config(config.compression.clone(), summarizer.clone()),
            decay: DecayEngine::new(store.clone(), config.decay.clone()),
            reflection: ReflectionEngine::new(
                store.clone(),
                gateway.clone(),
                summarizer,
                config.reflection.clone(),
            ),
            rank_policy,
            store,
            gateway,
            scheduler: Scheduler::new(),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
            shutdown: OnceCell::new(),
            decay_busy: Mutex::new(()),
            reflect_busy: Mutex::new(()),
            config,
        });
        Inner::start_maintenance(&inner);

        info!(
            path = %inner.config.path,
            tier = ?inner.config.tier,
            provider = ?inner.config.embeddings.provider,
            dimensions = inner.config.embeddings.dimensions,
            reflection = inner.config.reflection.enabled,
            compression = inner.config.compression.enabled,
            "Memory engine opened"
        );
        Ok(MemoryEngine { inner })
    }
}

/// Local, embedding-backed memory store with decay, reinforcement,
/// compression and reflection.
///
/// Dropping the engine stops its background tasks; call
/// [`MemoryEngine::close`] to also wait for them and release the store.
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    store: RecordStore,
    gateway: BoundedGateway,
    compressor: Compressor,
    decay: DecayEngine,
    reflection: ReflectionEngine,
    rank_policy: Arc<dyn RankPolicy>,
    scheduler: Scheduler,
    /// Foreground operations hold a read guard; `close` takes the write side.
    gate: RwLock<()>,
    closed: AtomicBool,
    /// Set once the store has been released.
    shutdown: OnceCell<()>,
    decay_busy: Mutex<()>,
    reflect_busy: Mutex<()>,
}

impl Inner {
    fn start_maintenance(inner: &Arc<Inner>) {
        let weak = Arc::downgrade(inner);
        inner
            .scheduler
            .spawn_periodic("decay", inner.config.decay.interval, move |rx| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.decay_tick(rx).await,
                        None => Ok(()),
                    }
                }
            });

        if inner.config.reflection.enabled {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            inner.scheduler.spawn_periodic(
                "reflection",
                inner.config.reflection.interval,
                move |rx| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => inner.reflection_tick(rx).await,
                            None => Ok(()),
                        }
                    }
                },
            );
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn decay_tick(&self, rx: watch::Receiver<bool>) -> MnemonResult<()> {
        let Ok(_busy) = self.decay_busy.try_lock() else {
            debug!("Decay tick skipped (busy)");
            return Ok(());
        };
        let stop = || *rx.borrow() || self.is_closed();
        self.decay.run(Utc::now(), &stop)?;
        Ok(())
    }

    async fn reflection_tick(&self, rx: watch::Receiver<bool>) -> MnemonResult<()> {
        let Ok(_busy) = self.reflect_busy.try_lock() else {
            debug!("Reflection tick skipped (busy)");
            return Ok(());
        };
        let stop = || *rx.borrow() || self.is_closed();
        let report = self.reflection.run(Utc::now(), &stop).await?;
        debug!(
            eligible = report.eligible,
            clusters = report.clusters,
            created = report.created.len(),
            "Reflection tick complete"
        );
        Ok(())
    }

    /// Include cold records unless the caller asked and the policy hides them.
    fn include_cold(&self, requested: bool) -> bool {
        requested || self.config.decay.cold_policy == ColdPolicy::Keep
    }

    /// Reinforce returned records and reflect the new state in `records`.
    fn reinforce<'a, I>(&self, records: I) -> MnemonResult<()>
    where
        I: IntoIterator<Item = &'a mut MemoryRecord>,
    {
        if !self.config.decay.reinforce_on_query {
            return Ok(());
        }
        let mut records: Vec<&mut MemoryRecord> = records.into_iter().collect();
        if records.is_empty() {
            return Ok(());
        }
        let ids: Vec<MemoryId> = records.iter().map(|r| r.id).collect();
        let now = Utc::now();
        let threshold = self.config.decay.cold_threshold;
        let updated =
            self.store
                .reinforce(&ids, self.config.decay.reinforcement_boost, threshold, now)?;
        for record in records.iter_mut() {
            if let Some(score) = updated.get(&record.id) {
                record.activation_score = *score;
                record.last_accessed_at = now;
                record.cold = *score < threshold;
            }
        }
        Ok(())
    }
}

impl MemoryEngine {
    /// Start building an engine from `options`.
    pub fn builder(options: EngineOptions) -> EngineBuilder {
        EngineBuilder {
            options,
            gateway: None,
            summarizer: None,
            rank_policy: None,
        }
    }

    /// Open an engine using the embedding provider named in `options`.
    pub async fn open(options: EngineOptions) -> MnemonResult<Self> {
        Self::builder(options).open().await
    }

    /// Open an engine with an explicit embedding gateway.
    pub async fn open_with_gateway(
        options: EngineOptions,
        gateway: Arc<dyn EmbeddingGateway>,
    ) -> MnemonResult<Self> {
        Self::builder(options).gateway(gateway).open().await
    }

    /// The validated configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    async fn enter(&self) -> MnemonResult<RwLockReadGuard<'_, ()>> {
        if self.inner.is_closed() {
            return Err(MnemonError::ShuttingDown);
        }
        let guard = self.inner.gate.read().await;
        if self.inner.is_closed() {
            return Err(MnemonError::ShuttingDown);
        }
        Ok(guard)
    }

    /// Store a new memory.
    ///
    /// The content is classified into sectors (metadata `sector`/`sectors`
    /// and `sector:<name>` tags pin sectors), embedded per sector, compressed
    /// when enabled and long enough, then persisted. With
    /// `ingest.deduplicate`, content matching a memory of the same owner
    /// reinforces and returns that memory instead.
    pub async fn add(&self, content: &str, options: AddOptions) -> MnemonResult<MemoryRecord> {
        let _gate = self.enter().await?;
        let inner = &*self.inner;

        if content.trim().is_empty() {
            return Err(MnemonError::InvalidInput("content must not be empty".to_string()));
        }
        if let Some(lambda) = options.decay_lambda {
            if !lambda.is_finite() || lambda < 0.0 {
                return Err(MnemonError::InvalidInput(format!(
                    "decay_lambda must be a finite non-negative number, got {lambda}"
                )));
            }
        }

        let mut sectors = classifier::classify(
            content,
            &Hints {
                tags: &options.tags,
                metadata: &options.metadata,
            },
        )?;
        if sectors.is_empty() {
            warn!("Classifier returned no sectors; using semantic");
            sectors.push(Sector::Semantic);
        }

        if inner.config.ingest.deduplicate {
            if let Some(existing) = self.reinforce_duplicate(content, options.user_id.as_deref())? {
                return Ok(existing);
            }
        }

        let embeddings = inner.gateway.embed(content, &sectors, None).await?;

        let mut tags = options.tags;
        tags.sort();
        tags.dedup();
        let primary = sectors[0];
        let now = Utc::now();
        let record = MemoryRecord {
            id: MemoryId::new(),
            user_id: options.user_id,
            content: content.to_string(),
            decay_lambda: options
                .decay_lambda
                .unwrap_or_else(|| primary.default_decay_lambda()),
            sectors,
            tags,
            metadata: options.metadata,
            embeddings,
            created_at: now,
            last_accessed_at: now,
            activation_score: 1.0,
            compressed: false,
            cold: false,
            derived_from: None,
            reflected_at: None,
        };

        let mut record = if inner.compressor.config().enabled {
            let _permit = inner.gateway.permit().await?;
            inner.compressor.maybe_compress(record).await
        } else {
            record
        };
        if record.compressed && inner.config.compression.reembed {
            record.embeddings = inner
                .gateway
                .embed(&record.content, &record.sectors, None)
                .await?;
        }

        inner.store.insert_with_source(&record, content)?;
        debug!(
            id = %record.id,
            sectors = ?record.sectors,
            compressed = record.compressed,
            "Added memory"
        );
        Ok(record)
    }

    /// Reinforce and return the stored memory `content` duplicates, if any.
    fn reinforce_duplicate(
        &self,
        content: &str,
        user_id: Option<&str>,
    ) -> MnemonResult<Option<MemoryRecord>> {
        let inner = &*self.inner;
        let Some(id) = inner.store.find_duplicate(content, user_id)? else {
            return Ok(None);
        };
        let decay = &inner.config.decay;
        let updated = inner
            .store
            .reinforce(&[id], decay.reinforcement_boost, decay.cold_threshold, Utc::now())?;
        if updated.is_empty() {
            return Ok(None);
        }
        let record = inner.store.get(id)?;
        if record.is_some() {
            debug!(id = %id, "Duplicate content reinforced existing memory");
        }
        Ok(record)
    }

    /// Rank stored memories by similarity to `text`.
    ///
    /// Results are ordered by rank (similarity damped by activation), ties
    /// going to the most recently accessed record. Returned records are
    /// reinforced when `reinforce_on_query` is enabled.
    pub async fn query(&self, text: &str, options: QueryOptions) -> MnemonResult<Vec<ScoredRecord>> {
        let _gate = self.enter().await?;
        let inner = &*self.inner;

        if text.trim().is_empty() {
            return Err(MnemonError::InvalidInput("query text must not be empty".to_string()));
        }
        if let Some(min) = options.min_activation {
            if !(0.0..=1.0).contains(&min) {
                return Err(MnemonError::InvalidInput(format!(
                    "min_activation must be within [0, 1], got {min}"
                )));
            }
        }
        let limit = options.limit.unwrap_or(inner.config.retrieval.default_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut filter_sectors = options.sectors.clone();
        filter_sectors.sort();
        filter_sectors.dedup();
        let query_sectors: Vec<Sector> = if filter_sectors.is_empty() {
            Sector::ALL.to_vec()
        } else {
            filter_sectors.clone()
        };

        let query_vectors = inner.gateway.embed(text, &query_sectors, None).await?;
        let candidates = inner.store.scan(&ScanFilter {
            sectors: filter_sectors,
            include_cold: inner.include_cold(options.include_cold),
            min_activation: options.min_activation,
            with_embeddings: true,
            user_id: options.user_id.clone(),
        })?;
        let evaluated = candidates.len();

        let mut results = retrieval::rank(
            &query_vectors,
            candidates,
            inner.rank_policy.as_ref(),
            limit,
        );
        inner.reinforce(results.iter_mut().map(|r| &mut r.record))?;

        debug!(evaluated, returned = results.len(), "Query complete");
        Ok(results)
    }

    /// Memories in `sector`, by activation then creation time (newest first).
    ///
    /// Vectors are not loaded. Returned records are reinforced when enabled.
    pub async fn get_by_sector(
        &self,
        sector: Sector,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> MnemonResult<Vec<MemoryRecord>> {
        self.list(vec![sector], None, limit, offset).await
    }

    /// Every memory, by activation then creation time (newest first).
    ///
    /// Vectors are not loaded. Returned records are reinforced when enabled.
    pub async fn get_all(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> MnemonResult<Vec<MemoryRecord>> {
        self.list(Vec::new(), None, limit, offset).await
    }

    /// Memories owned by `user_id`, by activation then creation time (newest first).
    ///
    /// Vectors are not loaded. Returned records are reinforced when enabled.
    pub async fn get_by_user(
        &self,
        user_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> MnemonResult<Vec<MemoryRecord>> {
        self.list(Vec::new(), Some(user_id.to_string()), limit, offset)
            .await
    }

    async fn list(
        &self,
        sectors: Vec<Sector>,
        user_id: Option<String>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> MnemonResult<Vec<MemoryRecord>> {
        let _gate = self.enter().await?;
        let inner = &*self.inner;
        let limit = limit.unwrap_or(inner.config.retrieval.list_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = ScanFilter {
            sectors,
            include_cold: inner.include_cold(false),
            min_activation: None,
            with_embeddings: false,
            user_id,
        };
        let mut records = inner.store.list(&filter, limit, offset.unwrap_or(0))?;
        inner.reinforce(records.iter_mut())?;
        Ok(records)
    }

    /// Look up one memory (with vectors). Does not reinforce.
    pub async fn get(&self, id: MemoryId) -> MnemonResult<MemoryRecord> {
        let _gate = self.enter().await?;
        self.inner
            .store
            .get(id)?
            .ok_or_else(|| MnemonError::NotFound(id.to_string()))
    }

    /// Delete a memory. Unknown ids report `NotFound`.
    pub async fn delete(&self, id: MemoryId) -> MnemonResult<()> {
        let _gate = self.enter().await?;
        if self.inner.store.delete(id)? {
            debug!(id = %id, "Deleted memory");
            Ok(())
        } else {
            Err(MnemonError::NotFound(id.to_string()))
        }
    }

    /// Number of stored memories, cold ones included.
    pub async fn count(&self) -> MnemonResult<u64> {
        let _gate = self.enter().await?;
        self.inner.store.count()
    }

    /// Run a decay tick now.
    pub async fn decay_now(&self) -> MnemonResult<DecayReport> {
        let _gate = self.enter().await?;
        let inner = &*self.inner;
        let _busy = inner.decay_busy.lock().await;
        let stop = || inner.is_closed();
        inner.decay.run(Utc::now(), &stop)
    }

    /// Run a reflection pass now, whether or not periodic reflection is enabled.
    pub async fn reflect_now(&self) -> MnemonResult<ReflectionReport> {
        let _gate = self.enter().await?;
        let inner = &*self.inner;
        let _busy = inner.reflect_busy.lock().await;
        let stop = || inner.is_closed();
        inner.reflection.run(Utc::now(), &stop).await
    }

    /// Compress every stored record that is long enough and not yet
    /// compressed, using the configured algorithm.
    pub async fn compress_pass(&self) -> MnemonResult<CompressionReport> {
        let _gate = self.enter().await?;
        let inner = &*self.inner;
        let mut report = CompressionReport::default();

        let ids = inner.store.ids()?;
        for batch in ids.chunks(SCAN_BATCH_SIZE) {
            if inner.is_closed() {
                break;
            }
            for id in batch {
                let Some(record) = inner.store.get(*id)? else {
                    continue;
                };
                report.evaluated += 1;
                if !inner.compressor.is_eligible(&record) {
                    continue;
                }
                let original_len = record.content.chars().count();
                let record = {
                    let _permit = inner.gateway.permit().await?;
                    inner.compressor.compress(record).await
                };
                if !record.compressed {
                    continue;
                }
                let embeddings = if inner.config.compression.reembed {
                    Some(
                        inner
                            .gateway
                            .embed(&record.content, &record.sectors, None)
                            .await?,
                    )
                } else {
                    None
                };
                let updated = inner.store.update_compressed(
                    record.id,
                    &record.content,
                    &record.metadata,
                    embeddings.as_ref(),
                )?;
                if updated {
                    report.compressed += 1;
                    report.chars_saved +=
                        original_len.saturating_sub(record.content.chars().count()) as u64;
                }
            }
        }

        info!(
            evaluated = report.evaluated,
            compressed = report.compressed,
            chars_saved = report.chars_saved,
            "Compression pass complete"
        );
        Ok(report)
    }

    /// Shut the engine down.
    ///
    /// New operations fail with `ShuttingDown`; in-flight operations finish,
    /// background tasks are stopped and joined, then the store is released.
    /// Every call, including concurrent ones, returns only after the store
    /// has been released.
    pub async fn close(&self) -> MnemonResult<()> {
        let inner = &*self.inner;
        if !inner.closed.swap(true, Ordering::SeqCst) {
            info!(path = %inner.config.path, "Closing memory engine");
        }

        inner
            .shutdown
            .get_or_init(|| async {
                let _exclusive = inner.gate.write().await;
                inner.scheduler.shutdown().await;
                inner.gateway.close();
                inner.store.close();
                info!("Memory engine closed");
            })
            .await;
        Ok(())
    }

    /// Whether [`MemoryEngine::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.inner.scheduler.signal_shutdown();
    }
}
