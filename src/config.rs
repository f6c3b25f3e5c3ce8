use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub kb: KbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KbConfig {
    /// Base directory holding one subdirectory per knowledge base.
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// Upper bound on OCR worker threads; the effective pool is
    /// `min(core_count, max_workers)`.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Pages handed out between resource-controller consultations.
    #[serde(default = "default_batch_pages")]
    pub batch_pages: usize,
    /// Soft cap on queued pages; submission blocks beyond it.
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,
    /// CPU usage ceiling in percent.
    #[serde(default = "default_cpu_ceiling")]
    pub cpu_ceiling: f32,
    /// Memory usage ceiling in percent.
    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling: f32,
    /// Soft timeout for one task group (one file's pages).
    #[serde(default = "default_group_timeout_secs")]
    pub group_timeout_secs: u64,
    /// A PDF averaging fewer direct-extracted characters per page than
    /// this falls back to OCR.
    #[serde(default = "default_min_chars_per_page")]
    pub min_chars_per_page: usize,
    /// Rasterization resolution for OCR page images.
    #[serde(default = "default_render_dpi")]
    pub render_dpi: u32,
    /// Skip direct PDF text extraction and always OCR.
    #[serde(default)]
    pub force_ocr: bool,
    /// Run OCR serially in-process instead of through the worker pool.
    #[serde(default)]
    pub serial: bool,
    /// Recognition languages passed to the engine.
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    /// Append-only OCR diagnostics log.
    #[serde(default = "default_ocr_log")]
    pub log_path: PathBuf,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_pages: default_batch_pages(),
            queue_cap: default_queue_cap(),
            cpu_ceiling: default_cpu_ceiling(),
            memory_ceiling: default_memory_ceiling(),
            group_timeout_secs: default_group_timeout_secs(),
            min_chars_per_page: default_min_chars_per_page(),
            render_dpi: default_render_dpi(),
            force_ocr: false,
            serial: false,
            languages: default_languages(),
            log_path: default_ocr_log(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_batch_pages() -> usize {
    16
}
fn default_queue_cap() -> usize {
    128
}
fn default_cpu_ceiling() -> f32 {
    75.0
}
fn default_memory_ceiling() -> f32 {
    85.0
}
fn default_group_timeout_secs() -> u64 {
    20 * 60
}
fn default_min_chars_per_page() -> usize {
    20
}
fn default_render_dpi() -> u32 {
    200
}
fn default_languages() -> Vec<String> {
    vec!["chi_sim".to_string(), "eng".to_string()]
}
fn default_ocr_log() -> PathBuf {
    PathBuf::from("app_logs/ocr_processing.log")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Capacity of the parse→embed and embed→store queues.
    #[serde(default = "default_pipeline_queue_cap")]
    pub queue_cap: usize,
    /// Chunks per embedding request.
    #[serde(default = "default_embed_batch")]
    pub embed_batch: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_cap: default_pipeline_queue_cap(),
            embed_batch: default_embed_batch(),
        }
    }
}

fn default_pipeline_queue_cap() -> usize {
    10
}
fn default_embed_batch() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_endpoint")]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            endpoint: default_endpoint(),
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_endpoint() -> Option<String> {
    None
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    if config.ocr.max_workers == 0 {
        anyhow::bail!("ocr.max_workers must be > 0");
    }
    if config.ocr.batch_pages == 0 {
        anyhow::bail!("ocr.batch_pages must be > 0");
    }
    if !(0.0..=100.0).contains(&config.ocr.cpu_ceiling) {
        anyhow::bail!("ocr.cpu_ceiling must be in [0, 100]");
    }
    if !(0.0..=100.0).contains(&config.ocr.memory_ceiling) {
        anyhow::bail!("ocr.memory_ceiling must be in [0, 100]");
    }

    if config.pipeline.queue_cap == 0 {
        anyhow::bail!("pipeline.queue_cap must be > 0");
    }
    if config.pipeline.embed_batch == 0 {
        anyhow::bail!("pipeline.embed_batch must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}
