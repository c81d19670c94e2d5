//! Duplicate-detection core: pairwise text/image similarity scoring, the
//! match engine, and aggregation of accepted pairs into duplicate groups.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dupemark_core::{
    DuplicateGroup, DuplicatePairRecord, Listing, MatchCandidate, MatchReason, PairKey,
};
use dupemark_ingest::{load_listing_bundle, source_for, IngestSession};
use dupemark_storage::{
    AssetFetcher, FetcherConfig, ImageCache, ListingRepository, PairUpsert,
};
use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dupemark-match";

/// A pair is accepted once its best details similarity clears this bar.
pub const DETAILS_MATCH_THRESHOLD: f64 = 50.0;
/// Category agreement above this bar corroborates a match.
pub const CATEGORY_BOOST_THRESHOLD: f64 = 80.0;
/// Size of the category corroboration boost, in percentage points.
pub const CATEGORY_BOOST_PERCENT: f64 = 5.0;
/// Default acceptance bar for the visual signal.
pub const DEFAULT_IMAGE_MATCH_THRESHOLD: f64 = 60.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: String,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStrategyKind {
    Off,
    Hash,
    Embedding,
    Both,
}

impl FromStr for ImageStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ImageStrategyKind::Off),
            "hash" => Ok(ImageStrategyKind::Hash),
            "embedding" => Ok(ImageStrategyKind::Embedding),
            "both" => Ok(ImageStrategyKind::Both),
            other => Err(format!("unknown image strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub image_cache_dir: PathBuf,
    pub image_strategy: ImageStrategyKind,
    pub image_match_threshold: f64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl DetectConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            workspace_root: PathBuf::from("."),
            image_cache_dir: std::env::var("DUPEMARK_IMAGE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./image-cache")),
            image_strategy: std::env::var("DUPEMARK_IMAGE_STRATEGY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(ImageStrategyKind::Off),
            image_match_threshold: std::env::var("DUPEMARK_IMAGE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_IMAGE_MATCH_THRESHOLD),
            http_timeout_secs: std::env::var("DUPEMARK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("DUPEMARK_USER_AGENT")
                .unwrap_or_else(|_| "dupemark-bot/0.1".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Text similarity
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else {
            if current.chars().count() >= 2 {
                tokens.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.chars().count() >= 2 {
        tokens.push(current);
    }
    tokens
}

/// Lexical similarity between two free-text fields as a percentage.
///
/// Pairwise two-document TF-IDF with smoothed idf and L2 normalization,
/// then cosine similarity. Symmetric in its arguments; degenerate input
/// (empty strings, no usable tokens) scores 0 rather than failing, since a
/// comparison that cannot be computed is "not similar", never a crawl stop.
pub fn score_text(a: &str, b: &str) -> f64 {
    let a = a.trim();
    let b = b.trim();
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }

    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);

    let mut vocabulary: BTreeSet<&str> = BTreeSet::new();
    vocabulary.extend(tokens_a.iter().map(String::as_str));
    vocabulary.extend(tokens_b.iter().map(String::as_str));
    if vocabulary.is_empty() {
        return 0.0;
    }

    let mut vec_a = Vec::with_capacity(vocabulary.len());
    let mut vec_b = Vec::with_capacity(vocabulary.len());
    for term in &vocabulary {
        let tf_a = tokens_a.iter().filter(|t| t.as_str() == *term).count() as f64;
        let tf_b = tokens_b.iter().filter(|t| t.as_str() == *term).count() as f64;
        let df = (tf_a > 0.0) as u8 + (tf_b > 0.0) as u8;
        let idf = (3.0 / (1.0 + f64::from(df))).ln() + 1.0;
        vec_a.push(tf_a * idf);
        vec_b.push(tf_b * idf);
    }

    let dot: f64 = vec_a.iter().zip(&vec_b).map(|(x, y)| x * y).sum();
    let norm_a = vec_a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = vec_b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b) * 100.0).clamp(0.0, 100.0)
}

/// Category agreement corroborates a match but is capped so it can never
/// create one on its own.
pub fn apply_category_boost(details_highest_sim: f64, cat_sim: f64) -> f64 {
    if cat_sim > CATEGORY_BOOST_THRESHOLD {
        (details_highest_sim + CATEGORY_BOOST_PERCENT).min(100.0)
    } else {
        details_highest_sim
    }
}

// ---------------------------------------------------------------------------
// Image similarity
// ---------------------------------------------------------------------------

/// A resolvable photo asset: a URL to fetch or bytes already in hand.
#[derive(Debug, Clone)]
pub enum ImageRef {
    Url(String),
    Bytes(Vec<u8>),
}

pub fn listing_image_refs(listing: &Listing) -> Vec<ImageRef> {
    listing
        .image_urls
        .iter()
        .cloned()
        .map(ImageRef::Url)
        .collect()
}

/// Backend that turns a decoded image into a comparable vector. External
/// model services plug in behind this seam.
pub trait ImageEmbedder: Send + Sync {
    fn name(&self) -> &'static str;
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// Coarse luminance-distribution embedding, the built-in backend.
pub struct LumaHistogramEmbedder {
    pub bins: usize,
}

impl Default for LumaHistogramEmbedder {
    fn default() -> Self {
        Self { bins: 64 }
    }
}

impl ImageEmbedder for LumaHistogramEmbedder {
    fn name(&self) -> &'static str {
        "luma-histogram"
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let bins = self.bins.max(1);
        let gray = image.to_luma8();
        let total = (gray.width() * gray.height()).max(1) as f32;
        let mut histogram = vec![0f32; bins];
        for px in gray.pixels() {
            let bucket = (px.0[0] as usize * bins) / 256;
            histogram[bucket.min(bins - 1)] += 1.0;
        }
        for v in &mut histogram {
            *v /= total;
        }
        Ok(histogram)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

const PERCEPTUAL_HASH_BITS: f64 = 64.0;

fn perceptual_best(side_a: &[DynamicImage], side_b: &[DynamicImage]) -> f64 {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher();
    let hashes_a: Vec<_> = side_a.iter().map(|img| hasher.hash_image(img)).collect();
    let hashes_b: Vec<_> = side_b.iter().map(|img| hasher.hash_image(img)).collect();

    let mut best = 0.0f64;
    for ha in &hashes_a {
        for hb in &hashes_b {
            let dist = f64::from(ha.dist(hb));
            let sim = ((PERCEPTUAL_HASH_BITS - dist) / PERCEPTUAL_HASH_BITS * 100.0).max(0.0);
            best = best.max(sim);
        }
    }
    best
}

fn extension_of(url: &str) -> &str {
    url.rsplit('.')
        .next()
        .filter(|ext| ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("img")
}

/// Visual similarity between two listings' photo sets.
///
/// Both strategies expose the same percentage scale; strategy outputs and
/// all cross-set photo pairs combine via max, since any single strong
/// visual match is sufficient evidence.
pub struct ImageScorer {
    strategy: ImageStrategyKind,
    fetcher: Arc<AssetFetcher>,
    cache: Option<Arc<ImageCache>>,
    embedder: Arc<dyn ImageEmbedder>,
    downloaded: Mutex<BTreeSet<String>>,
}

impl ImageScorer {
    pub fn new(
        strategy: ImageStrategyKind,
        fetcher: Arc<AssetFetcher>,
        cache: Option<Arc<ImageCache>>,
        embedder: Arc<dyn ImageEmbedder>,
    ) -> Self {
        Self {
            strategy,
            fetcher,
            cache,
            embedder,
            downloaded: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn strategy(&self) -> ImageStrategyKind {
        self.strategy
    }

    /// Item ids whose full photo sets were materialized since the last call.
    pub async fn take_downloaded(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.downloaded.lock().await)
    }

    pub async fn score_images(
        &self,
        run_id: Uuid,
        item_a: &str,
        refs_a: &[ImageRef],
        item_b: &str,
        refs_b: &[ImageRef],
    ) -> f64 {
        if self.strategy == ImageStrategyKind::Off {
            return 0.0;
        }
        // No photos on either side means no visual evidence, not an error.
        if refs_a.is_empty() || refs_b.is_empty() {
            return 0.0;
        }

        let side_a = self.materialize_side(run_id, item_a, refs_a).await;
        let side_b = self.materialize_side(run_id, item_b, refs_b).await;
        if side_a.is_empty() || side_b.is_empty() {
            return 0.0;
        }

        let mut best = 0.0f64;
        if matches!(self.strategy, ImageStrategyKind::Hash | ImageStrategyKind::Both) {
            best = best.max(perceptual_best(&side_a, &side_b));
        }
        if matches!(
            self.strategy,
            ImageStrategyKind::Embedding | ImageStrategyKind::Both
        ) {
            best = best.max(self.embedding_best(&side_a, &side_b));
        }
        best.clamp(0.0, 100.0)
    }

    fn embedding_best(&self, side_a: &[DynamicImage], side_b: &[DynamicImage]) -> f64 {
        let embed_side = |side: &[DynamicImage]| -> Vec<Vec<f32>> {
            side.iter()
                .filter_map(|img| match self.embedder.embed(img) {
                    Ok(vector) => Some(vector),
                    Err(err) => {
                        warn!(backend = self.embedder.name(), error = %err, "embedding failed; skipping asset");
                        None
                    }
                })
                .collect()
        };
        let vectors_a = embed_side(side_a);
        let vectors_b = embed_side(side_b);

        let mut best = 0.0f64;
        for va in &vectors_a {
            for vb in &vectors_b {
                best = best.max(cosine_similarity(va, vb) * 100.0);
            }
        }
        best
    }

    async fn materialize_side(
        &self,
        run_id: Uuid,
        item_id: &str,
        refs: &[ImageRef],
    ) -> Vec<DynamicImage> {
        let mut images = Vec::new();
        let mut failures = 0usize;
        for image_ref in refs {
            match self.materialize(run_id, item_id, image_ref).await {
                Ok(img) => images.push(img),
                Err(err) => {
                    failures += 1;
                    warn!(item_id, error = %err, "skipping unusable photo asset");
                }
            }
        }
        if failures == 0 && !refs.is_empty() {
            self.downloaded.lock().await.insert(item_id.to_string());
        }
        images
    }

    async fn materialize(
        &self,
        run_id: Uuid,
        item_id: &str,
        image_ref: &ImageRef,
    ) -> Result<DynamicImage> {
        let bytes = match image_ref {
            ImageRef::Bytes(bytes) => bytes.clone(),
            ImageRef::Url(url) => {
                let asset = self
                    .fetcher
                    .fetch_bytes(run_id, url)
                    .await
                    .with_context(|| format!("fetching {url}"))?;
                if let Some(cache) = &self.cache {
                    if let Err(err) = cache
                        .store_bytes(Utc::now(), item_id, extension_of(url), &asset.body)
                        .await
                    {
                        warn!(item_id, error = %err, "image cache write failed");
                    }
                }
                asset.body
            }
        };
        image::load_from_memory(&bytes).context("decoding image bytes")
    }
}

// ---------------------------------------------------------------------------
// Pairwise match engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    pub candidates: Vec<MatchCandidate>,
    pub pairs_compared: usize,
}

pub struct MatchEngine {
    image: Option<ImageScorer>,
    image_match_threshold: f64,
}

impl MatchEngine {
    pub fn text_only() -> Self {
        Self {
            image: None,
            image_match_threshold: DEFAULT_IMAGE_MATCH_THRESHOLD,
        }
    }

    pub fn with_image_scorer(scorer: ImageScorer, image_match_threshold: f64) -> Self {
        Self {
            image: Some(scorer),
            image_match_threshold,
        }
    }

    pub fn image_scorer(&self) -> Option<&ImageScorer> {
        self.image.as_ref()
    }

    /// Enumerate every canonical pair exactly once and emit the candidates
    /// that clear a threshold. A failed comparison only ever costs that one
    /// pair its image evidence; the pass itself always completes.
    pub async fn compute_candidates(&self, run_id: Uuid, listings: &[Listing]) -> CandidateSet {
        let mut seen: HashSet<PairKey> = HashSet::new();
        let mut set = CandidateSet::default();

        for i in 0..listings.len() {
            for j in (i + 1)..listings.len() {
                let a = &listings[i];
                let b = &listings[j];
                // Re-crawled copies can share an item id; same item, not a pair.
                let Some(pair) = PairKey::new(&a.item_id, &b.item_id) else {
                    continue;
                };
                if !seen.insert(pair.clone()) {
                    continue;
                }
                set.pairs_compared += 1;

                let cat_sim = score_text(&a.category, &b.category);
                let title_sim = score_text(&a.title, &b.title);
                let desc_sim = score_text(&a.description, &b.description);
                let details_highest_sim =
                    apply_category_boost(title_sim.max(desc_sim), cat_sim);
                let text_match = details_highest_sim > DETAILS_MATCH_THRESHOLD;

                let images_highest_sim = match &self.image {
                    Some(scorer) => Some(
                        scorer
                            .score_images(
                                run_id,
                                &a.item_id,
                                &listing_image_refs(a),
                                &b.item_id,
                                &listing_image_refs(b),
                            )
                            .await,
                    ),
                    None => None,
                };
                let image_match = images_highest_sim
                    .map(|sim| sim > self.image_match_threshold)
                    .unwrap_or(false);

                if !text_match && !image_match {
                    debug!(pair = %pair, details_highest_sim, "pair below match thresholds");
                    continue;
                }

                // The tag reflects the raw category similarity, not the
                // boosted details score (see DESIGN.md).
                let reason = if text_match {
                    if cat_sim > DETAILS_MATCH_THRESHOLD {
                        MatchReason::CategorySim
                    } else {
                        MatchReason::TitleDescSim
                    }
                } else {
                    MatchReason::ImageSim
                };
                info!(
                    pair = %pair,
                    %reason,
                    details_highest_sim,
                    ?images_highest_sim,
                    "accepted match candidate"
                );
                set.candidates.push(MatchCandidate {
                    pair,
                    reason,
                    details_highest_sim,
                    images_highest_sim,
                });
            }
        }
        set
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Batched upsert of a run's candidates. Score merging is the repository's
/// max-merge, so re-running after a partial failure is safe.
pub async fn persist_candidates(
    repo: &dyn ListingRepository,
    candidates: &[MatchCandidate],
) -> Result<usize> {
    for candidate in candidates {
        repo.upsert_pair(&PairUpsert {
            pair: candidate.pair.clone(),
            reason: candidate.reason,
            details_highest_sim: candidate.details_highest_sim,
            images_highest_sim: candidate.images_highest_sim,
        })
        .await
        .with_context(|| format!("upserting pair {}", candidate.pair))?;
    }
    Ok(candidates.len())
}

/// Connected components over the persisted pair records. Derived on demand;
/// the pair records stay the single source of truth.
pub fn materialize_groups(records: &[DuplicatePairRecord]) -> Vec<DuplicateGroup> {
    let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for record in records {
        adjacency
            .entry(record.pair.first())
            .or_default()
            .insert(record.pair.second());
        adjacency
            .entry(record.pair.second())
            .or_default()
            .insert(record.pair.first());
    }

    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut groups = Vec::new();
    for &start in adjacency.keys() {
        if visited.contains(start) {
            continue;
        }
        visited.insert(start);
        let mut members = Vec::new();
        let mut pending = vec![start];
        while let Some(node) = pending.pop() {
            members.push(node.to_string());
            if let Some(neighbors) = adjacency.get(node) {
                for &next in neighbors {
                    if visited.insert(next) {
                        pending.push(next);
                    }
                }
            }
        }
        members.sort();
        groups.push(DuplicateGroup { members });
    }
    groups.sort_by(|a, b| a.members.cmp(&b.members));
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub item_id_1: String,
    pub item_id_2: String,
    pub reason: MatchReason,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<SimilarityEdge>,
}

/// Read-only projection of the similarity graph for external rendering.
pub fn similarity_graph(records: &[DuplicatePairRecord]) -> SimilarityGraph {
    let mut nodes: BTreeSet<String> = BTreeSet::new();
    let mut edges = Vec::with_capacity(records.len());
    for record in records {
        nodes.insert(record.pair.first().to_string());
        nodes.insert(record.pair.second().to_string());
        let weight = record
            .images_highest_sim
            .map_or(record.details_highest_sim, |img| {
                img.max(record.details_highest_sim)
            });
        edges.push(SimilarityEdge {
            item_id_1: record.pair.first().to_string(),
            item_id_2: record.pair.second().to_string(),
            reason: record.reason,
            weight,
        });
    }
    SimilarityGraph {
        nodes: nodes.into_iter().collect(),
        edges,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub sources: usize,
    pub listings_ingested: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listings: usize,
    pub pairs_compared: usize,
    pub candidates: usize,
    pub persisted_pairs: usize,
    pub reports_dir: String,
}

pub struct DetectPipeline {
    config: DetectConfig,
    repo: Arc<dyn ListingRepository>,
    engine: MatchEngine,
    http: Arc<AssetFetcher>,
}

impl DetectPipeline {
    pub fn new(config: DetectConfig, repo: Arc<dyn ListingRepository>) -> Result<Self> {
        let http = Arc::new(AssetFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let engine = if config.image_strategy == ImageStrategyKind::Off {
            MatchEngine::text_only()
        } else {
            let cache = Arc::new(ImageCache::new(config.image_cache_dir.clone()));
            let scorer = ImageScorer::new(
                config.image_strategy,
                http.clone(),
                Some(cache),
                Arc::new(LumaHistogramEmbedder::default()),
            );
            MatchEngine::with_image_scorer(scorer, config.image_match_threshold)
        };
        Ok(Self {
            config,
            repo,
            engine,
            http,
        })
    }

    pub fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Pull every enabled source's captured bundle into the repository.
    pub async fn ingest_once(&self) -> Result<IngestSummary> {
        let registry = self.load_source_registry()?;
        let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();

        let session = IngestSession::acquire(self.http.clone());
        let run_id = session.run_id();
        let mut listings_ingested = 0usize;

        for entry in &enabled {
            if entry.mode != "fixture" {
                warn!(source_id = %entry.source_id, mode = %entry.mode, "unsupported source mode; skipping");
                continue;
            }
            let source = source_for(&entry.source_id)
                .with_context(|| format!("no source registered for {}", entry.source_id))?;
            let bundle_path = self
                .config
                .workspace_root
                .join("fixtures")
                .join(&entry.source_id)
                .join("sample")
                .join("bundle.json");
            let bundle = load_listing_bundle(&bundle_path)
                .with_context(|| format!("loading bundle {}", bundle_path.display()))?;
            let listings = source
                .parse(&bundle)
                .with_context(|| format!("parsing bundle for {}", entry.source_id))?;
            for listing in &listings {
                self.repo
                    .insert_listing(listing)
                    .await
                    .with_context(|| format!("storing listing {}", listing.item_id))?;
            }
            listings_ingested += listings.len();
        }

        session.release();
        info!(%run_id, sources = enabled.len(), listings_ingested, "ingest run finished");
        Ok(IngestSummary {
            run_id,
            sources: enabled.len(),
            listings_ingested,
        })
    }

    /// One full detection pass: snapshot, enumerate, persist, report.
    pub async fn detect_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        // A partial snapshot would produce misleading duplicate groups, so
        // storage failure aborts the batch here.
        let listings = self
            .repo
            .read_all_listings()
            .await
            .context("reading listing snapshot")?;
        info!(%run_id, listings = listings.len(), "starting duplicate detection pass");

        let set = self.engine.compute_candidates(run_id, &listings).await;

        // Persistence is batched after the full enumeration so a partial
        // write ordering can never surface a non-monotonic score.
        let persisted_pairs = persist_candidates(self.repo.as_ref(), &set.candidates).await?;

        if let Some(scorer) = self.engine.image_scorer() {
            for item_id in scorer.take_downloaded().await {
                self.repo
                    .mark_images_downloaded(&item_id)
                    .await
                    .with_context(|| format!("marking images downloaded for {item_id}"))?;
            }
        }

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, listings.len(), &set)
            .await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            listings: listings.len(),
            pairs_compared: set.pairs_compared,
            candidates: set.candidates.len(),
            persisted_pairs,
            reports_dir: reports_dir.display().to_string(),
        })
    }

    pub async fn groups(&self) -> Result<Vec<DuplicateGroup>> {
        let records = self
            .repo
            .read_all_pairs()
            .await
            .context("reading pair records")?;
        Ok(materialize_groups(&records))
    }

    pub async fn export_graph(&self) -> Result<SimilarityGraph> {
        let records = self
            .repo
            .read_all_pairs()
            .await
            .context("reading pair records")?;
        Ok(similarity_graph(&records))
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        listings: usize,
        set: &CandidateSet,
    ) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        tokio::fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let brief = format!(
            "# Duplicate Detection Brief\n\n- Run ID: `{run_id}`\n- Started: {started_at}\n- Finished: {finished_at}\n- Listings in snapshot: {listings}\n- Pairs visited: {}\n- Accepted candidates: {}\n",
            set.pairs_compared,
            set.candidates.len()
        );
        tokio::fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;

        let pairs_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "candidates": set.candidates,
        }))
        .context("serializing candidates")?;
        tokio::fs::write(reports_dir.join("similar_pairs.json"), pairs_json)
            .await
            .context("writing similar_pairs.json")?;

        Ok(reports_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn mk_listing(item_id: &str, title: &str, description: &str, category: &str) -> Listing {
        Listing {
            item_id: item_id.to_string(),
            seller_id: "s-1".to_string(),
            seller_name: "Seller".to_string(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            price: "RM 100".to_string(),
            image_urls: vec![],
            created_at: Utc::now(),
        }
    }

    fn generated_strings() -> Vec<String> {
        const WORDS: &[&str] = &[
            "iphone", "13", "128gb", "like", "new", "case", "mobile", "phone", "bundle",
            "original", "box", "warranty",
        ];
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut strings = Vec::new();
        for _ in 0..24 {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let len = 1 + (seed >> 33) as usize % 5;
            let mut words = Vec::with_capacity(len);
            for _ in 0..len {
                seed = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                words.push(WORDS[(seed >> 33) as usize % WORDS.len()]);
            }
            strings.push(words.join(" "));
        }
        strings
    }

    #[test]
    fn text_score_is_symmetric_and_self_bounded() {
        let strings = generated_strings();
        for x in &strings {
            for y in &strings {
                let forward = score_text(x, y);
                let backward = score_text(y, x);
                assert!(
                    (forward - backward).abs() < 1e-9,
                    "asymmetry for {x:?} vs {y:?}"
                );
                assert!(
                    score_text(x, x) >= forward - 1e-9,
                    "self-similarity below cross-similarity for {x:?} vs {y:?}"
                );
            }
        }
    }

    #[test]
    fn empty_and_degenerate_text_scores_zero() {
        assert_eq!(score_text("", ""), 0.0);
        assert_eq!(score_text("   ", "\t"), 0.0);
        assert_eq!(score_text("", "iphone 13"), 0.0);
        // Single-character tokens never make it into the vocabulary.
        assert_eq!(score_text("a", "a"), 0.0);
    }

    #[test]
    fn case_and_spacing_do_not_matter() {
        let score = score_text("iPhone 13 128GB", "iphone  13 128gb");
        assert!(score > 99.9, "got {score}");
    }

    #[test]
    fn disjoint_text_scores_zero() {
        assert_eq!(score_text("vintage leather sofa", "gaming laptop rtx"), 0.0);
    }

    #[test]
    fn category_boost_is_capped_at_100() {
        assert_eq!(apply_category_boost(98.0, 90.0), 100.0);
        assert_eq!(apply_category_boost(100.0, 100.0), 100.0);
        assert_eq!(apply_category_boost(40.0, 90.0), 45.0);
        // At or below the bar the boost must not fire.
        assert_eq!(apply_category_boost(40.0, 80.0), 40.0);
        assert_eq!(apply_category_boost(40.0, 10.0), 40.0);
    }

    #[tokio::test]
    async fn engine_visits_each_canonical_pair_once() {
        let listings = vec![
            mk_listing("a", "one", "", "Misc"),
            mk_listing("b", "two", "", "Misc"),
            mk_listing("c", "three", "", "Misc"),
            mk_listing("d", "four", "", "Misc"),
        ];
        let engine = MatchEngine::text_only();
        let set = engine.compute_candidates(Uuid::new_v4(), &listings).await;
        assert_eq!(set.pairs_compared, 6);
    }

    #[tokio::test]
    async fn repeated_item_ids_are_not_double_compared() {
        // Two snapshots of the same item plus two distinct items: the only
        // canonical pairs are (a,b), (a,c), (b,c).
        let listings = vec![
            mk_listing("a", "one", "", "Misc"),
            mk_listing("a", "one again", "", "Misc"),
            mk_listing("b", "two", "", "Misc"),
            mk_listing("c", "three", "", "Misc"),
        ];
        let engine = MatchEngine::text_only();
        let set = engine.compute_candidates(Uuid::new_v4(), &listings).await;
        assert_eq!(set.pairs_compared, 3);
    }

    #[tokio::test]
    async fn near_identical_phones_match_with_category_reason() {
        let listings = vec![
            mk_listing("100", "iPhone 13 128GB", "Like new", "Mobile Phones"),
            mk_listing("200", "iPhone 13 128gb", "like new", "Mobile Phones"),
        ];
        let engine = MatchEngine::text_only();
        let set = engine.compute_candidates(Uuid::new_v4(), &listings).await;

        assert_eq!(set.candidates.len(), 1);
        let candidate = &set.candidates[0];
        // 100% details plus the category boost, capped at 100.
        assert_eq!(candidate.details_highest_sim, 100.0);
        assert_eq!(candidate.reason, MatchReason::CategorySim);
        assert_eq!(candidate.images_highest_sim, None);
    }

    #[tokio::test]
    async fn disjoint_listings_emit_no_candidate() {
        let listings = vec![
            mk_listing("100", "Vintage leather sofa", "well loved", "Furniture"),
            mk_listing("200", "Gaming laptop rtx", "brand sealed", "Computers"),
        ];
        let engine = MatchEngine::text_only();
        let set = engine.compute_candidates(Uuid::new_v4(), &listings).await;
        assert!(set.candidates.is_empty());
        assert_eq!(set.pairs_compared, 1);
    }

    #[tokio::test]
    async fn reason_uses_raw_category_similarity() {
        // Categories overlap enough to clear 50 but stay below the boost
        // bar, so the tag must come from the raw value, not a boosted one.
        let listings = vec![
            mk_listing("100", "iPhone 13 128GB", "", "mobile phones gadgets"),
            mk_listing("200", "iPhone 13 128GB", "", "mobile phones accessories"),
        ];
        let engine = MatchEngine::text_only();
        let set = engine.compute_candidates(Uuid::new_v4(), &listings).await;

        let cat_sim = score_text("mobile phones gadgets", "mobile phones accessories");
        assert!(cat_sim > 50.0 && cat_sim <= 80.0, "got {cat_sim}");
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].reason, MatchReason::CategorySim);

        // Same titles, unrelated categories: the details signal is the tag.
        let listings = vec![
            mk_listing("100", "iPhone 13 128GB", "", "Furniture"),
            mk_listing("200", "iPhone 13 128GB", "", "Computers"),
        ];
        let set = engine.compute_candidates(Uuid::new_v4(), &listings).await;
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.candidates[0].reason, MatchReason::TitleDescSim);
    }

    fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, image::ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    fn ramp_png() -> Vec<u8> {
        let gray = image::GrayImage::from_fn(64, 64, |x, _| image::Luma([(x * 4) as u8]));
        encode_png(DynamicImage::ImageLuma8(gray))
    }

    fn checkerboard_png() -> Vec<u8> {
        let gray = image::GrayImage::from_fn(64, 64, |x, y| {
            image::Luma([if (x / 8 + y / 8) % 2 == 0 { 255 } else { 0 }])
        });
        encode_png(DynamicImage::ImageLuma8(gray))
    }

    fn solid_png(level: u8) -> Vec<u8> {
        let gray = image::GrayImage::from_pixel(32, 32, image::Luma([level]));
        encode_png(DynamicImage::ImageLuma8(gray))
    }

    fn mk_scorer(strategy: ImageStrategyKind) -> ImageScorer {
        let fetcher = Arc::new(AssetFetcher::new(FetcherConfig::default()).expect("fetcher"));
        ImageScorer::new(
            strategy,
            fetcher,
            None,
            Arc::new(LumaHistogramEmbedder::default()),
        )
    }

    #[tokio::test]
    async fn empty_photo_set_scores_zero() {
        let scorer = mk_scorer(ImageStrategyKind::Hash);
        let refs = vec![ImageRef::Bytes(ramp_png())];
        let score = scorer
            .score_images(Uuid::new_v4(), "a", &[], "b", &refs)
            .await;
        assert_eq!(score, 0.0);
    }

    #[tokio::test]
    async fn identical_photos_score_100_under_hash_strategy() {
        let scorer = mk_scorer(ImageStrategyKind::Hash);
        let refs_a = vec![ImageRef::Bytes(ramp_png())];
        let refs_b = vec![ImageRef::Bytes(checkerboard_png()), ImageRef::Bytes(ramp_png())];
        let score = scorer
            .score_images(Uuid::new_v4(), "a", &refs_a, "b", &refs_b)
            .await;
        assert_eq!(score, 100.0);
    }

    #[tokio::test]
    async fn dissimilar_photos_score_below_100() {
        let scorer = mk_scorer(ImageStrategyKind::Hash);
        let refs_a = vec![ImageRef::Bytes(ramp_png())];
        let refs_b = vec![ImageRef::Bytes(checkerboard_png())];
        let score = scorer
            .score_images(Uuid::new_v4(), "a", &refs_a, "b", &refs_b)
            .await;
        assert!(score < 100.0, "got {score}");
    }

    #[tokio::test]
    async fn embedding_strategy_separates_light_from_dark() {
        let scorer = mk_scorer(ImageStrategyKind::Embedding);
        let white = vec![ImageRef::Bytes(solid_png(255))];
        let black = vec![ImageRef::Bytes(solid_png(0))];
        let same = scorer
            .score_images(Uuid::new_v4(), "a", &white, "b", &white.clone())
            .await;
        let different = scorer
            .score_images(Uuid::new_v4(), "a", &white, "b", &black)
            .await;
        assert!(same > 99.9, "got {same}");
        assert_eq!(different, 0.0);
    }

    #[tokio::test]
    async fn undecodable_assets_are_skipped_and_score_zero() {
        let scorer = mk_scorer(ImageStrategyKind::Both);
        let garbage = vec![ImageRef::Bytes(vec![0u8; 16])];
        let refs_b = vec![ImageRef::Bytes(ramp_png())];
        let score = scorer
            .score_images(Uuid::new_v4(), "a", &garbage, "b", &refs_b)
            .await;
        assert_eq!(score, 0.0);
    }

    #[test]
    fn groups_are_transitive_and_deterministic() {
        let mk_record = |a: &str, b: &str| DuplicatePairRecord {
            pair: PairKey::new(a, b).expect("distinct ids"),
            reason: MatchReason::TitleDescSim,
            details_highest_sim: 80.0,
            images_highest_sim: None,
            is_verified: false,
            created_at: Utc::now(),
        };
        let records = vec![
            mk_record("c", "b"),
            mk_record("a", "b"),
            mk_record("e", "d"),
        ];
        let groups = materialize_groups(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec!["a", "b", "c"]);
        assert_eq!(groups[1].members, vec!["d", "e"]);

        let again = materialize_groups(&records);
        assert_eq!(groups, again);
    }

    #[test]
    fn graph_projection_uses_best_available_score() {
        let record = DuplicatePairRecord {
            pair: PairKey::new("a", "b").expect("distinct ids"),
            reason: MatchReason::CategorySim,
            details_highest_sim: 62.0,
            images_highest_sim: Some(91.0),
            is_verified: false,
            created_at: Utc::now(),
        };
        let graph = similarity_graph(&[record]);
        assert_eq!(graph.nodes, vec!["a", "b"]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].weight, 91.0);
    }

    #[test]
    fn image_strategy_parses_from_env_style_strings() {
        assert_eq!("hash".parse::<ImageStrategyKind>(), Ok(ImageStrategyKind::Hash));
        assert_eq!("Both".parse::<ImageStrategyKind>(), Ok(ImageStrategyKind::Both));
        assert!("pixel".parse::<ImageStrategyKind>().is_err());
    }
}
