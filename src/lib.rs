pub mod agent_core;
pub mod config;
pub mod inference;
pub mod maintenance;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_core::builtin_tools::register_builtin_tools;
use agent_core::dispatcher::{ToolDispatcher, ToolRegistry};
use agent_core::ConversationLoop;
use config::RuntimeConfig;
use inference::client::ModelClient;
use inference::InferenceClient;
use maintenance::scheduler::SummarizerSettings;
use maintenance::{MaintenanceScheduler, MemoryDatabase};

/// Return the platform-standard data directory for Parley.
///
/// - macOS: `~/Library/Application Support/parley/`
/// - Windows: `{FOLDERID_RoamingAppData}\parley\`
/// - Linux: `$XDG_DATA_HOME/parley/` (fallback `~/.local/share/parley/`)
///
/// Falls back to `~/.parley/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("parley");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

/// Initialize the tracing subscriber, writing to `runtime.log` in `log_dir`.
///
/// Rotates existing logs (runtime.log → .1 → .2 → .3) and opens a fresh file
/// behind a line-flushing writer. Returns the path of the new log file.
/// Installing a second subscriber is an error.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("runtime.log");

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Parley starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `runtime.log` → `runtime.log.1` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Gaps in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// `std::fs::File` writer that flushes after every write, so log lines
/// survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Default location of the memory database inside [`data_dir`].
pub fn default_database_path() -> PathBuf {
    data_dir().join("memory.db")
}

/// Database path from `maintenance.database_path`, else the default.
fn resolve_database_path(config: &RuntimeConfig) -> PathBuf {
    match &config.maintenance.database_path {
        Some(path) => PathBuf::from(config::expand_tilde(path)),
        None => default_database_path(),
    }
}

// ─── Runtime Assembly ────────────────────────────────────────────────────────

/// Everything a host needs to serve turns.
pub struct Runtime {
    pub conversation: ConversationLoop,
    pub scheduler: MaintenanceScheduler,
    pub database: Arc<MemoryDatabase>,
    pub config: Arc<RuntimeConfig>,
}

impl Runtime {
    /// Wire the HTTP model client, the SQLite store, the built-in tools and
    /// the maintenance scheduler from a validated configuration.
    ///
    /// The scheduler is created but not started; call
    /// [`MaintenanceScheduler::start`] from inside a Tokio runtime.
    pub fn from_config(config: RuntimeConfig) -> anyhow::Result<Self> {
        let model: Arc<dyn ModelClient> = Arc::new(InferenceClient::from_config(&config.endpoint)?);

        let db_path = resolve_database_path(&config);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let database = Arc::new(MemoryDatabase::open(&db_path.to_string_lossy())?);

        Self::assemble(config, model, database)
    }

    /// Same as [`Runtime::from_config`] with caller-provided model and store.
    pub fn assemble(
        config: RuntimeConfig,
        model: Arc<dyn ModelClient>,
        database: Arc<MemoryDatabase>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, database.clone())?;
        tracing::info!(tools = ?registry.actions(), "tool registry ready");

        let scheduler = MaintenanceScheduler::new(
            database.clone(),
            database.clone(),
            model.clone(),
            SummarizerSettings::from_config(&config)?,
        );

        let conversation = ConversationLoop::new(model, ToolDispatcher::new(registry), config.clone())
            .with_scheduler(scheduler.clone());

        Ok(Self {
            conversation,
            scheduler,
            database,
            config,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
