//! Embedding drivers and the sector embedding gateway.
//!
//! An [`EmbeddingDriver`] turns a batch of texts into vectors. The
//! [`EmbeddingGateway`] sits on top and produces exactly one vector per
//! requested sector, handling the simple/advanced modes and chunking of long
//! content. Drivers:
//! - `synthetic`: deterministic feature-hashed bag of words, fully offline
//! - `openai` / `ollama`: any OpenAI-compatible `/embeddings` endpoint
//! - `gemini`: Google `batchEmbedContents`

use crate::text::{chunk_text, fnv1a, tokenize};
use crate::vector::{mean, normalize};
use async_trait::async_trait;
use mnemon_types::config::{EmbeddingConfig, EmbeddingMode, EmbeddingProvider};
use mnemon_types::error::{MnemonError, MnemonResult};
use mnemon_types::memory::Sector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Content longer than this (in characters) is embedded in chunks.
pub const CHUNK_THRESHOLD_CHARS: usize = 3000;

pub(crate) const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub(crate) const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const DEFAULT_OLLAMA_MODEL: &str = "nomic-embed-text";
const DEFAULT_GEMINI_MODEL: &str = "text-embedding-004";

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing API key: {0}")]
    MissingApiKey(String),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

impl From<EmbeddingError> for MnemonError {
    fn from(e: EmbeddingError) -> Self {
        MnemonError::Provider(e.to_string())
    }
}

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingDriver: Send + Sync {
    /// Compute embedding vectors for a batch of texts.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Compute embedding for a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.embed(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Parse("Empty embedding response".to_string()))
    }

    /// Return the dimensionality of embeddings produced by this driver.
    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Synthetic
// ---------------------------------------------------------------------------

/// Deterministic offline driver.
///
/// Each token (and each adjacent token pair, at half weight) is hashed with
/// FNV-1a into one of `dims` buckets with a hash-derived sign; the result is
/// L2-normalized. Texts sharing vocabulary get high cosine similarity.
pub struct SyntheticEmbeddingDriver {
    dims: usize,
}

impl SyntheticEmbeddingDriver {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let tokens = tokenize(text);
        for token in &tokens {
            self.bump(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.bump(&mut v, joined.as_bytes(), 0.5);
        }
        normalize(&mut v);
        v
    }

    fn bump(&self, v: &mut [f32], bytes: &[u8], weight: f32) {
        let h = fnv1a(bytes);
        let idx = (h % self.dims as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingDriver for SyntheticEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible (openai, ollama)
// ---------------------------------------------------------------------------

/// OpenAI-compatible embedding driver.
///
/// Works with any provider that implements the `/embeddings` endpoint,
/// including Ollama's `/v1` compatibility layer.
pub struct OpenAIEmbeddingDriver {
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
    /// Send `dimensions` in the request (OpenAI v3 models support shortening).
    request_dims: bool,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl OpenAIEmbeddingDriver {
    /// Create a new OpenAI-compatible embedding driver.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dims: usize,
        request_dims: bool,
    ) -> Self {
        Self {
            api_key: Zeroizing::new(api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
            dims,
            request_dims,
        }
    }
}

#[async_trait]
impl EmbeddingDriver for OpenAIEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
            dimensions: self.request_dims.then_some(self.dims),
        };

        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.as_str().is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key.as_str()));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        let status = resp.status().as_u16();

        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status,
                message: body_text,
            });
        }

        let data: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;

        let embeddings: Vec<Vec<f32>> = data.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        debug!(
            count = embeddings.len(),
            dims = embeddings.first().map(|e| e.len()).unwrap_or(0),
            "Embedded texts"
        );

        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

/// Google Gemini embedding driver (`batchEmbedContents`).
pub struct GeminiEmbeddingDriver {
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBatchRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiContent,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl GeminiEmbeddingDriver {
    pub fn new(api_key: String, base_url: String, model: String, dims: usize) -> Self {
        Self {
            api_key: Zeroizing::new(api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingDriver for GeminiEmbeddingDriver {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let model_path = format!("models/{}", self.model);
        let body = GeminiBatchRequest {
            requests: texts
                .iter()
                .map(|t| GeminiEmbedRequest {
                    model: model_path.clone(),
                    content: GeminiContent {
                        parts: vec![GeminiPart {
                            text: (*t).to_string(),
                        }],
                    },
                    output_dimensionality: self.dims,
                })
                .collect(),
        };

        let url = format!("{}/{}:batchEmbedContents", self.base_url, model_path);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        let status = resp.status().as_u16();

        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status,
                message: body_text,
            });
        }

        let data: GeminiBatchResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        if data.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.embeddings.len()
            )));
        }

        debug!(count = data.embeddings.len(), "Embedded texts via Gemini");
        Ok(data.embeddings.into_iter().map(|e| e.values).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Create the embedding driver selected by `config`.
pub fn create_driver(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingDriver>, EmbeddingError> {
    let dims = config.dimensions;
    let (default_url, default_model) = match config.provider {
        EmbeddingProvider::Synthetic => return Ok(Arc::new(SyntheticEmbeddingDriver::new(dims))),
        EmbeddingProvider::OpenAi => (OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL),
        EmbeddingProvider::Ollama => (OLLAMA_BASE_URL, DEFAULT_OLLAMA_MODEL),
        EmbeddingProvider::Gemini => (GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL),
    };

    let api_key = config.api_key.clone().unwrap_or_default();
    if config.provider.requires_api_key() && api_key.is_empty() {
        return Err(EmbeddingError::MissingApiKey(format!(
            "provider {:?} requires embeddings.api_key",
            config.provider
        )));
    }

    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| default_url.to_string());
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| default_model.to_string());

    let is_local = base_url.contains("localhost")
        || base_url.contains("127.0.0.1")
        || base_url.contains("[::1]");
    if !is_local {
        warn!(
            provider = ?config.provider,
            base_url = %base_url,
            "Embedding driver configured to send data to external API; memory content will leave this machine"
        );
    }

    let driver: Arc<dyn EmbeddingDriver> = match config.provider {
        EmbeddingProvider::Gemini => {
            Arc::new(GeminiEmbeddingDriver::new(api_key, base_url, model, dims))
        }
        _ => Arc::new(OpenAIEmbeddingDriver::new(
            api_key,
            base_url,
            model,
            dims,
            config.provider == EmbeddingProvider::OpenAi,
        )),
    };
    Ok(driver)
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// One sector's vector for a piece of content.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorEmbedding {
    pub sector: Sector,
    pub vector: Vec<f32>,
    pub dim: usize,
}

/// Produces one vector per requested sector. Must be safe to call concurrently.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Embed `content` for each of `sectors`. When `chunks` is given the
    /// vectors are computed from those pieces instead of the whole content.
    async fn embed(
        &self,
        content: &str,
        sectors: &[Sector],
        chunks: Option<&[String]>,
    ) -> MnemonResult<Vec<SectorEmbedding>>;

    /// Dimension of every vector this gateway returns.
    fn dimensions(&self) -> usize;
}

/// Gateway backed by an [`EmbeddingDriver`].
pub struct DriverGateway {
    driver: Arc<dyn EmbeddingDriver>,
    mode: EmbeddingMode,
    dims: usize,
}

impl DriverGateway {
    pub fn new(driver: Arc<dyn EmbeddingDriver>, mode: EmbeddingMode, dims: usize) -> Self {
        Self { driver, mode, dims }
    }

    /// Build the driver and gateway described by `config`.
    pub fn from_config(config: &EmbeddingConfig) -> MnemonResult<Self> {
        let driver = create_driver(config)?;
        Ok(Self::new(driver, config.mode, config.dimensions))
    }

    /// Embed each text as a set of pieces, averaging the piece vectors.
    async fn embed_pieces(&self, texts: &[Vec<String>]) -> MnemonResult<Vec<Vec<f32>>> {
        let flat: Vec<&str> = texts.iter().flatten().map(String::as_str).collect();
        let vectors = self.driver.embed(&flat).await?;
        if vectors.len() != flat.len() {
            return Err(MnemonError::Provider(format!(
                "driver returned {} vectors for {} texts",
                vectors.len(),
                flat.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(EmbeddingError::Dimension {
                expected: self.dims,
                actual: bad.len(),
            }
            .into());
        }

        let mut out = Vec::with_capacity(texts.len());
        let mut offset = 0;
        for pieces in texts {
            let slice = &vectors[offset..offset + pieces.len()];
            offset += pieces.len();
            let mut v = mean(slice.iter().map(Vec::as_slice))
                .unwrap_or_else(|| vec![0.0; self.dims]);
            if slice.len() > 1 {
                normalize(&mut v);
            }
            out.push(v);
        }
        Ok(out)
    }
}

#[async_trait]
impl EmbeddingGateway for DriverGateway {
    async fn embed(
        &self,
        content: &str,
        sectors: &[Sector],
        chunks: Option<&[String]>,
    ) -> MnemonResult<Vec<SectorEmbedding>> {
        if sectors.is_empty() {
            return Ok(vec![]);
        }
        let pieces: Vec<String> = match chunks {
            Some(c) if !c.is_empty() => c.to_vec(),
            _ if content.chars().count() > CHUNK_THRESHOLD_CHARS => {
                chunk_text(content, CHUNK_THRESHOLD_CHARS)
            }
            _ => vec![content.to_string()],
        };

        let vectors = match self.mode {
            EmbeddingMode::Simple => {
                let v = self.embed_pieces(&[pieces]).await?;
                vec![v.into_iter().next().unwrap_or_default(); sectors.len()]
            }
            EmbeddingMode::Advanced => {
                let conditioned: Vec<Vec<String>> = sectors
                    .iter()
                    .map(|s| pieces.iter().map(|p| format!("[{s}] {p}")).collect())
                    .collect();
                self.embed_pieces(&conditioned).await?
            }
        };

        Ok(sectors
            .iter()
            .zip(vectors)
            .map(|(sector, vector)| SectorEmbedding {
                sector: *sector,
                dim: vector.len(),
                vector,
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Check a gateway result: one vector per requested sector, all of dimension `dims`.
pub fn check_embeddings(
    sectors: &[Sector],
    dims: usize,
    embeddings: &[SectorEmbedding],
) -> MnemonResult<()> {
    for sector in sectors {
        let Some(e) = embeddings.iter().find(|e| e.sector == *sector) else {
            return Err(MnemonError::Provider(format!(
                "gateway returned no vector for sector {sector}"
            )));
        };
        if e.vector.len() != dims || e.dim != dims {
            return Err(EmbeddingError::Dimension {
                expected: dims,
                actual: e.vector.len(),
            }
            .into());
        }
    }
    Ok(())
}

/// Gateway handle whose provider calls share a bounded pool of permits.
#[derive(Clone)]
pub struct BoundedGateway {
    gateway: Arc<dyn EmbeddingGateway>,
    permits: Arc<Semaphore>,
}

impl BoundedGateway {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>, max_concurrent: usize) -> Self {
        Self {
            gateway,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Wait for a provider permit. Fails once the pool is closed.
    pub async fn permit(&self) -> MnemonResult<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| MnemonError::ShuttingDown)
    }

    /// Stop handing out permits. Waiters fail with `ShuttingDown`.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn dimensions(&self) -> usize {
        self.gateway.dimensions()
    }

    /// Embed `content` for `sectors` and verify the result.
    pub async fn embed(
        &self,
        content: &str,
        sectors: &[Sector],
        chunks: Option<&[String]>,
    ) -> MnemonResult<HashMap<Sector, Vec<f32>>> {
        let embeddings = {
            let _permit = self.permit().await?;
            self.gateway.embed(content, sectors, chunks).await?
        };
        check_embeddings(sectors, self.gateway.dimensions(), &embeddings)?;
        Ok(embeddings
            .into_iter()
            .filter(|e| sectors.contains(&e.sector))
            .map(|e| (e.sector, e.vector))
            .collect())
    }
}
