use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// Flushes the non-blocking console writer for the lifetime of the process.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Parse a YAML level string. `off`/`none` disable the sink; unknown strings
/// fall back to INFO.
fn parse_level(s: &str) -> LevelFilter {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" | "" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" | "none" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// `target` belongs to `prefix` when equal to it or nested below it (`prefix::...`).
fn target_has_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ---------- rotating file sinks ----------

type SharedRotation = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct FileSink(SharedRotation);

impl FileSink {
    fn open(path: &Path, section: &Section) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let limit = match (section.max_backups, section.max_age_days) {
            (Some(n), _) => FileLimit::MaxFiles(n),
            (None, days) => FileLimit::Age(chrono::Duration::days(i64::from(days.unwrap_or(1)))),
        };
        let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;
        let rotation = FileRotate::new(
            path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        );
        Ok(Self(Arc::new(Mutex::new(rotation))))
    }
}

/// Writer handed to the fmt layer for one event; `None` swallows the record.
struct SinkWriter(Option<SharedRotation>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(rotation) => rotation.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(rotation) => rotation.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Routes each record to the file of the longest matching target section,
/// or to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<FileSink>,
    by_target: Vec<(String, FileSink)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let path = resolve_log_path(&section.file, base_dir);
            let sink = match FileSink::open(&path, section) {
                Ok(sink) => sink,
                Err(e) => {
                    // No subscriber yet, so stderr is the only channel.
                    eprintln!("Failed to open log file '{}' for '{name}': {e}", path.display());
                    continue;
                }
            };
            if name == DEFAULT_SECTION {
                router.default = Some(sink);
            } else {
                router.by_target.push((name.clone(), sink));
            }
        }
        router.by_target.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        router
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_target.is_empty()
    }

    fn route(&self, target: &str) -> Option<&FileSink> {
        self.by_target
            .iter()
            .find(|(prefix, _)| target_has_prefix(target, prefix))
            .map(|(_, sink)| sink)
            .or(self.default.as_ref())
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter(self.default.as_ref().map(|s| s.0.clone()))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        SinkWriter(self.route(meta.target()).map(|s| s.0.clone()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

// ---------- per-sink level targets ----------

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

fn sink_targets(cfg: &LoggingConfig, sink: Sink, has_default_file: bool) -> Targets {
    let level_of = |section: &Section| match sink {
        Sink::Console => parse_level(&section.console_level),
        Sink::File => parse_level(&section.file_level),
    };

    let default_level = match (cfg.get(DEFAULT_SECTION), sink) {
        (Some(section), Sink::Console) => level_of(section),
        (Some(section), Sink::File) if has_default_file => level_of(section),
        (None, Sink::Console) => LevelFilter::INFO,
        _ => LevelFilter::OFF,
    };

    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .filter(|(_, section)| matches!(sink, Sink::Console) || !section.file.trim().is_empty())
        .fold(Targets::new().with_default(default_level), |targets, (name, section)| {
            targets.with_target(name.clone(), level_of(section))
        })
}

// ---------- public entry point ----------

/// Install the global subscriber: console (stderr, human readable) plus JSON
/// files routed per target section. Relative file paths resolve against
/// `base_dir`. `RUST_LOG`, when set, caps both sinks. Calling it twice is a
/// no-op.
pub fn init_logging_unified(cfg: &LoggingConfig, base_dir: &Path) {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env_cap = EnvFilter::try_from_default_env().ok();

    if cfg.is_empty() {
        let _ = tracing_subscriber::registry()
            .with(env_cap)
            .with(fmt::layer().with_target(true).with_timer(fmt::time::UtcTime::rfc_3339()))
            .try_init();
        return;
    }

    let router = FileRouter::build(cfg, base_dir);
    let console_targets = sink_targets(cfg, Sink::Console, router.default.is_some());
    let file_targets = sink_targets(cfg, Sink::File, router.default.is_some());

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = tracing_subscriber::registry()
        .with(env_cap)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.into(),
            file: file.into(),
            file_level: file_level.into(),
            max_age_days: None,
            max_backups: Some(2),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn levels_parse_with_fallback() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(parse_level("off"), LevelFilter::OFF);
        assert_eq!(parse_level("bogus"), LevelFilter::INFO);
    }

    #[test]
    fn prefix_matching_respects_path_boundaries() {
        assert!(target_has_prefix("infergate_orchestrator", "infergate_orchestrator"));
        assert!(target_has_prefix("infergate_orchestrator::registry", "infergate_orchestrator"));
        assert!(!target_has_prefix("infergate_orchestrator_extra", "infergate_orchestrator"));
    }

    #[test]
    fn router_prefers_most_specific_section() {
        let tmp = tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("info", "logs/all.log", "debug"));
        cfg.insert("infergate_orchestrator".into(), section("info", "logs/orch.log", "debug"));
        cfg.insert(
            "infergate_orchestrator::spawner".into(),
            section("info", "logs/spawn.log", "trace"),
        );

        let router = FileRouter::build(&cfg, tmp.path());
        assert_eq!(router.by_target.len(), 2);

        let spawn = router.route("infergate_orchestrator::spawner::local").unwrap();
        let orch = router.route("infergate_orchestrator::registry").unwrap();
        let other = router.route("tonic::transport").unwrap();

        assert!(Arc::ptr_eq(&spawn.0, &router.by_target[0].1 .0));
        assert!(Arc::ptr_eq(&orch.0, &router.by_target[1].1 .0));
        assert!(Arc::ptr_eq(&other.0, &router.default.as_ref().unwrap().0));
        assert!(tmp.path().join("logs").is_dir());
    }

    #[test]
    fn file_sink_without_default_file_is_off_by_default() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("info", "", "debug"));
        let targets = sink_targets(&cfg, Sink::File, false);
        assert_eq!(targets.default_level(), Some(LevelFilter::OFF));

        let console = sink_targets(&cfg, Sink::Console, false);
        assert_eq!(console.default_level(), Some(LevelFilter::INFO));
    }
}
