pub mod mcp_client;

pub use mcp_client::{McpError, Registry, RegistryOptions};

/// Return the platform-standard data directory for mcphub.
///
/// - macOS: `~/Library/Application Support/mcphub/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcphub\`
/// - Linux: `$XDG_DATA_HOME/mcphub/` (fallback `~/.local/share/mcphub/`)
///
/// Falls back to `~/.mcphub/` only if none of the above can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcphub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcphub")
}

/// Initialize the tracing subscriber.
///
/// By default logs go to `mcphub.log` in the data directory, rotated on each
/// start (`mcphub.log` → `.1` → `.2` → `.3`). With `to_stderr`, logs go to
/// stderr instead and nothing is written to disk. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing(to_stderr: bool) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcphub=info,warn"));

    if to_stderr {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
        return Ok(());
    }

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("mcphub.log");

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcphub starting ==="
    );
    Ok(())
}

/// Rotate log files: `mcphub.log` → `mcphub.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
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

/// A writer that wraps `std::fs::File` and flushes after every write,
/// so log lines survive a crash of the host process.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
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
