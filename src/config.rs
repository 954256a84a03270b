//! Configuration management.
//!
//! Two layers, following the split between device-local paths and app
//! behavior: `Settings` holds filesystem locations; `Config` is the
//! serde-loaded file (JSON, TOML, or YAML by extension) carrying the model
//! endpoint, orchestrator tunables, and the per-stage routing table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::llm::LlmConfig;
use crate::models::StageId;

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "docmill.db";

/// Default documents subdirectory name.
const DOCUMENTS_SUBDIR: &str = "documents";

/// Application settings: where data lives.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Directory for storing ingested document bytes.
    pub documents_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        // Default to ~/Documents/docmill/ for user data.
        // Falls back gracefully: Documents dir -> Home dir -> Current dir
        let data_dir = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docmill");

        Self {
            documents_dir: data_dir.join(DOCUMENTS_SUBDIR),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            documents_dir: data_dir.join(DOCUMENTS_SUBDIR),
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Check if the database appears to be initialized.
    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory '{}': {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })?;
        fs::create_dir_all(&self.documents_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create documents directory '{}': {}",
                    self.documents_dir.display(),
                    e
                ),
            )
        })?;
        Ok(())
    }
}

/// Per-stage wall-clock timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_timeout_extract")]
    pub extract: u64,
    #[serde(default = "default_timeout_visual")]
    pub visual: u64,
    #[serde(default = "default_timeout_format")]
    pub format: u64,
    #[serde(default = "default_timeout_structure")]
    pub structure: u64,
    #[serde(default = "default_timeout_synthesize")]
    pub synthesize: u64,
    #[serde(default = "default_timeout_chunk")]
    pub chunk: u64,
    #[serde(default = "default_timeout_embed")]
    pub embed: u64,
}

fn default_timeout_extract() -> u64 {
    30
}
fn default_timeout_visual() -> u64 {
    120
}
fn default_timeout_format() -> u64 {
    60
}
fn default_timeout_structure() -> u64 {
    60
}
fn default_timeout_synthesize() -> u64 {
    30
}
fn default_timeout_chunk() -> u64 {
    10
}
fn default_timeout_embed() -> u64 {
    60
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            extract: default_timeout_extract(),
            visual: default_timeout_visual(),
            format: default_timeout_format(),
            structure: default_timeout_structure(),
            synthesize: default_timeout_synthesize(),
            chunk: default_timeout_chunk(),
            embed: default_timeout_embed(),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageId) -> std::time::Duration {
        let secs = match stage {
            StageId::Extract => self.extract,
            StageId::Visual => self.visual,
            StageId::Format => self.format,
            StageId::Structure => self.structure,
            StageId::Synthesize => self.synthesize,
            StageId::Chunk => self.chunk,
            StageId::Embed => self.embed,
        };
        std::time::Duration::from_secs(secs)
    }
}

/// In-stage retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per stage, including the first.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    /// Jitter fraction applied to each delay (0.2 = ±20%).
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_factor() -> f64 {
    2.0
}
fn default_retry_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_ms: default_retry_base_ms(),
            factor: default_retry_factor(),
            jitter: default_retry_jitter(),
        }
    }
}

/// Orchestrator and worker-pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Initial dispatch width.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    /// Reactive width never exceeds this.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: u32,
    /// Reactive width never drops below this.
    #[serde(default = "default_floor")]
    pub floor: u32,
    /// Memory fraction above which the governor throttles and downscales.
    #[serde(default = "default_memory_high")]
    pub memory_high: f64,
    /// Memory fraction below which the governor restores width.
    #[serde(default = "default_memory_low")]
    pub memory_low: f64,
    /// Resource sample period in seconds.
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Delay inserted between dispatches while under pressure, in ms.
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    /// Lease time-to-live in seconds.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
    /// Heartbeat every `lease_ttl / heartbeat_fraction`.
    #[serde(default = "default_heartbeat_fraction")]
    pub heartbeat_fraction: u32,
    /// Minimum interval between progress snapshot writes, in ms.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Chunk window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Embedding vector dimension.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Short-circuit re-runs when a prior success has the same input hash.
    #[serde(default = "default_reuse_prior_success")]
    pub reuse_prior_success: bool,
    /// Re-prompt once when the structuring model returns invalid JSON.
    #[serde(default = "default_reprompt_on_bad_output")]
    pub reprompt_on_bad_output: bool,
    #[serde(default)]
    pub stage_timeouts: StageTimeouts,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_parallel() -> u32 {
    8
}
fn default_hard_cap() -> u32 {
    32
}
fn default_floor() -> u32 {
    1
}
fn default_memory_high() -> f64 {
    0.85
}
fn default_memory_low() -> f64 {
    0.70
}
fn default_sample_interval_secs() -> u64 {
    2
}
fn default_throttle_delay_ms() -> u64 {
    500
}
fn default_lease_ttl_secs() -> i64 {
    300
}
fn default_heartbeat_fraction() -> u32 {
    3
}
fn default_progress_interval_ms() -> u64 {
    500
}
fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_embedding_dim() -> usize {
    1536
}
fn default_reuse_prior_success() -> bool {
    true
}
fn default_reprompt_on_bad_output() -> bool {
    true
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            hard_cap: default_hard_cap(),
            floor: default_floor(),
            memory_high: default_memory_high(),
            memory_low: default_memory_low(),
            sample_interval_secs: default_sample_interval_secs(),
            throttle_delay_ms: default_throttle_delay_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_fraction: default_heartbeat_fraction(),
            progress_interval_ms: default_progress_interval_ms(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embedding_dim: default_embedding_dim(),
            reuse_prior_success: default_reuse_prior_success(),
            reprompt_on_bad_output: default_reprompt_on_bad_output(),
            stage_timeouts: StageTimeouts::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ProcessingConfig {
    /// Interval between lease renewals.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        let fraction = self.heartbeat_fraction.max(1) as i64;
        std::time::Duration::from_secs((self.lease_ttl_secs / fraction).max(1) as u64)
    }
}

/// One entry of the per-stage model/prompt routing table.
///
/// Entries are matched by stage, then workspace, then doc_type, then the
/// stage default, in that precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A resolved model/prompt pair for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub model_id: String,
    pub prompt_template: Option<String>,
}

/// Routing table with workspace > doc_type > default precedence.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

/// Default generation model for text stages.
pub const DEFAULT_TEXT_MODEL: &str = "llama3.2:instruct";
/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";

impl RoutingTable {
    /// Build a table from config entries; stage defaults are declared here
    /// at load time so every stage always resolves.
    pub fn new(mut entries: Vec<RouteEntry>) -> Self {
        for stage in StageId::ordered() {
            let has_default = entries
                .iter()
                .any(|e| e.stage == stage && e.workspace.is_none() && e.doc_type.is_none());
            if !has_default {
                let model = if stage == StageId::Embed {
                    DEFAULT_EMBED_MODEL
                } else {
                    DEFAULT_TEXT_MODEL
                };
                entries.push(RouteEntry {
                    stage,
                    workspace: None,
                    doc_type: None,
                    model: model.to_string(),
                    prompt: None,
                });
            }
        }
        Self { entries }
    }

    /// Resolve the route for a stage given the document's workspace and type.
    pub fn resolve(&self, stage: StageId, workspace: &str, doc_type: &str) -> Route {
        let candidates: Vec<&RouteEntry> =
            self.entries.iter().filter(|e| e.stage == stage).collect();

        let chosen = candidates
            .iter()
            .find(|e| e.workspace.as_deref() == Some(workspace))
            .or_else(|| {
                candidates
                    .iter()
                    .find(|e| e.workspace.is_none() && e.doc_type.as_deref() == Some(doc_type))
            })
            .or_else(|| {
                candidates
                    .iter()
                    .find(|e| e.workspace.is_none() && e.doc_type.is_none())
            });

        match chosen {
            Some(entry) => Route {
                model_id: entry.model.clone(),
                prompt_template: entry.prompt.clone(),
            },
            // Unreachable in practice: new() seeds a default per stage.
            None => Route {
                model_id: DEFAULT_TEXT_MODEL.to_string(),
                prompt_template: None,
            },
        }
    }

    /// Fingerprint of every resolved prompt template, for `prompt_hash`.
    pub fn prompt_fingerprint(&self, workspace: &str, doc_type: &str) -> String {
        let mut hasher = Sha256::new();
        for stage in StageId::ordered() {
            let route = self.resolve(stage, workspace, doc_type);
            hasher.update(stage.as_str().as_bytes());
            hasher.update(b"\n");
            hasher.update(route.model_id.as_bytes());
            hasher.update(b"\n");
            if let Some(prompt) = route.prompt_template {
                hasher.update(prompt.as_bytes());
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Per-workspace overrides for chunking and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_overlap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Model backend configuration.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Orchestrator and worker-pool tunables.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Per-stage model/prompt routing entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing: Vec<RouteEntry>,
    /// Per-workspace chunking/embedding overrides.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub workspace_overrides: HashMap<String, WorkspaceOverride>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a specific file path.
    /// Supports JSON, TOML, and YAML based on file extension.
    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Look for a config file next to the database.
    pub fn find_next_to_data_dir(data_dir: &Path) -> Option<PathBuf> {
        let extensions = ["json", "toml", "yaml", "yml"];
        let basenames = ["docmill", "config"];

        for basename in basenames {
            for ext in extensions {
                let path = data_dir.join(format!("{}.{}", basename, ext));
                if path.exists() {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved relative to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
            settings.documents_dir = settings.data_dir.join(DOCUMENTS_SUBDIR);
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
    }

    /// Routing table with stage defaults seeded.
    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(self.routing.clone())
    }

    /// Effective chunk size for a workspace.
    pub fn chunk_size_for(&self, workspace: &str) -> usize {
        self.workspace_overrides
            .get(workspace)
            .and_then(|o| o.chunk_size)
            .unwrap_or(self.processing.chunk_size)
    }

    /// Effective chunk overlap for a workspace.
    pub fn chunk_overlap_for(&self, workspace: &str) -> usize {
        self.workspace_overrides
            .get(workspace)
            .and_then(|o| o.chunk_overlap)
            .unwrap_or(self.processing.chunk_overlap)
    }

    /// Effective embedding dimension for a workspace.
    pub fn embedding_dim_for(&self, workspace: &str) -> usize {
        self.workspace_overrides
            .get(workspace)
            .and_then(|o| o.embedding_dim)
            .unwrap_or(self.processing.embedding_dim)
    }

    /// Compute SHA-256 hash of the serialized config.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides adjacency discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory override (--data flag).
    pub data: Option<PathBuf>,
}

/// Load settings with explicit options. Returns (Settings, Config).
pub fn load_settings_with_options(options: LoadOptions) -> Result<(Settings, Config), String> {
    let data_dir_override = options.data.as_ref().map(|d| {
        if d.is_absolute() {
            d.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(d)
        }
    });

    // Priority: explicit --config, then a config next to the data dir.
    let config = if let Some(ref config_path) = options.config_path {
        Config::load_from_path(config_path)?
    } else if let Some(found) = data_dir_override
        .as_ref()
        .and_then(|d| Config::find_next_to_data_dir(d))
    {
        tracing::debug!("Found config next to data dir: {}", found.display());
        Config::load_from_path(&found)?
    } else {
        Config::default()
    };

    let mut settings = Settings::default();
    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_to_settings(&mut settings, &base_dir);

    // --data override takes precedence for data_dir and documents_dir
    if let Some(data_dir) = data_dir_override {
        settings.documents_dir = data_dir.join(DOCUMENTS_SUBDIR);
        settings.data_dir = data_dir;
    }

    Ok((settings, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = ProcessingConfig::default();
        assert_eq!(cfg.max_parallel, 8);
        assert_eq!(cfg.hard_cap, 32);
        assert!((cfg.memory_high - 0.85).abs() < f64::EPSILON);
        assert!((cfg.memory_low - 0.70).abs() < f64::EPSILON);
        assert_eq!(cfg.lease_ttl_secs, 300);
        assert_eq!(cfg.chunk_size, 800);
        assert_eq!(cfg.chunk_overlap, 100);
        assert_eq!(cfg.embedding_dim, 1536);
        assert_eq!(cfg.stage_timeouts.visual, 120);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn test_heartbeat_interval_is_ttl_fraction() {
        let cfg = ProcessingConfig::default();
        assert_eq!(cfg.heartbeat_interval().as_secs(), 100);
    }

    #[test]
    fn test_routing_precedence() {
        let table = RoutingTable::new(vec![
            RouteEntry {
                stage: StageId::Structure,
                workspace: Some("classroom".to_string()),
                doc_type: None,
                model: "classroom-model".to_string(),
                prompt: None,
            },
            RouteEntry {
                stage: StageId::Structure,
                workspace: None,
                doc_type: Some("receipt".to_string()),
                model: "receipt-model".to_string(),
                prompt: None,
            },
        ]);

        // Workspace match wins over doc_type.
        let route = table.resolve(StageId::Structure, "classroom", "receipt");
        assert_eq!(route.model_id, "classroom-model");

        // Then doc_type.
        let route = table.resolve(StageId::Structure, "household", "receipt");
        assert_eq!(route.model_id, "receipt-model");

        // Then the seeded default.
        let route = table.resolve(StageId::Structure, "household", "memo");
        assert_eq!(route.model_id, DEFAULT_TEXT_MODEL);
    }

    #[test]
    fn test_embed_stage_default_model() {
        let table = RoutingTable::new(Vec::new());
        let route = table.resolve(StageId::Embed, "any", "any");
        assert_eq!(route.model_id, DEFAULT_EMBED_MODEL);
    }

    #[test]
    fn test_prompt_fingerprint_changes_with_routing() {
        let base = RoutingTable::new(Vec::new());
        let customized = RoutingTable::new(vec![RouteEntry {
            stage: StageId::Synthesize,
            workspace: Some("business".to_string()),
            doc_type: None,
            model: "other-model".to_string(),
            prompt: Some("custom {content}".to_string()),
        }]);

        assert_eq!(
            base.prompt_fingerprint("household", "memo"),
            base.prompt_fingerprint("household", "memo")
        );
        assert_ne!(
            base.prompt_fingerprint("business", "memo"),
            customized.prompt_fingerprint("business", "memo")
        );
    }

    #[test]
    fn test_workspace_overrides() {
        let mut config = Config::default();
        config.workspace_overrides.insert(
            "classroom".to_string(),
            WorkspaceOverride {
                chunk_size: Some(400),
                chunk_overlap: None,
                embedding_dim: Some(768),
            },
        );

        assert_eq!(config.chunk_size_for("classroom"), 400);
        assert_eq!(config.chunk_overlap_for("classroom"), 100);
        assert_eq!(config.embedding_dim_for("classroom"), 768);
        assert_eq!(config.chunk_size_for("household"), 800);
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("docmill.toml");
        fs::write(
            &path,
            r#"
data_dir = "./data"

[processing]
max_parallel = 4
chunk_size = 512

[[routing]]
stage = "structure"
workspace = "business"
model = "qwen2.5:14b"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.processing.max_parallel, 4);
        assert_eq!(config.processing.chunk_size, 512);
        assert_eq!(config.routing.len(), 1);
        assert_eq!(config.routing[0].stage, StageId::Structure);

        let table = config.routing_table();
        assert_eq!(
            table.resolve(StageId::Structure, "business", "x").model_id,
            "qwen2.5:14b"
        );
    }
}
