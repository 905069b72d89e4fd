use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::paths::home_dir::resolve_home_dir;

/// Typed view of one entry in the per-module bag.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleEntry {
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Gateway configuration: typed `server`/`logging` sections plus free-form
/// `modules.<name>` entries that each component deserializes on its own.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` falls back to [`default_logging_config`].
    pub logging: Option<LoggingConfig>,
    /// Extra `<module>.yaml` files merged into `modules`.
    #[serde(default)]
    pub modules_dir: Option<String>,
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Absolute after loading; empty selects `~/.infergate`.
    pub home_dir: String,
    /// Upper bound for the whole shutdown sequence, 0 = wait indefinitely.
    #[serde(default)]
    pub shutdown_timeout_sec: u64,
}

/// Per-target log sinks keyed by tracing target (`infergate_orchestrator`,
/// `tonic`, ...). The `default` entry covers every other target.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    /// Level name or `off`.
    pub console_level: String,
    /// Relative paths land under `server.home_dir`; empty disables the file.
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    pub max_age_days: Option<u32>,
    /// Rotated files kept next to the active one.
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            home_dir: String::new(),
            shutdown_timeout_sec: 30,
        }
    }
}

/// Info on the console, debug into `logs/infergate.log`.
pub fn default_logging_config() -> LoggingConfig {
    let section = Section {
        console_level: "info".into(),
        file: "logs/infergate.log".into(),
        file_level: "debug".into(),
        max_age_days: Some(7),
        max_backups: Some(3),
        max_size_mb: Some(100),
    };
    HashMap::from([("default".to_string(), section)])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: Some(default_logging_config()),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Built-in defaults, then the YAML file, then `APP__*` variables
    /// (`APP__SERVER__SHUTDOWN_TIMEOUT_SEC=10`). The home directory is made
    /// absolute and created.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let mut config: AppConfig = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        normalize_home_dir(&mut config.server)?;

        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// [`Self::load_layered`] when a file is given, built-in defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_layered(path);
        }
        let mut config = Self::default();
        normalize_home_dir(&mut config.server)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Cannot render configuration as YAML")
    }

    /// `-v` raises the default console level to debug, `-vv` to trace.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let level = match args.verbose {
            0 => return,
            1 => "debug",
            _ => "trace",
        };
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(section) = logging.get_mut("default") {
            section.console_level = level.to_string();
        }
    }

    /// Deserialize `modules.<name>.config`, falling back to `T::default()`
    /// when the module has no entry.
    pub fn module_config<T>(&self, module_name: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        module_config_from_value(self.modules.get(module_name), module_name)
    }

    pub fn home_dir(&self) -> &Path {
        Path::new(&self.server.home_dir)
    }
}

pub(crate) fn module_config_from_value<T>(
    raw: Option<&serde_json::Value>,
    module_name: &str,
) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = raw else {
        return Ok(T::default());
    };
    let entry: ModuleEntry = serde_json::from_value(raw.clone())
        .with_context(|| format!("Invalid entry for module '{module_name}'"))?;
    if entry.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(entry.config)
        .with_context(|| format!("Invalid config for module '{module_name}'"))
}

/// Flags shared by the gateway binaries.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

const DEFAULT_HOME_SUBDIR: &str = ".infergate";

fn normalize_home_dir(server: &mut ServerConfig) -> Result<()> {
    let configured = Some(server.home_dir.trim())
        .filter(|dir| !dir.is_empty())
        .map(str::to_string);
    let resolved: PathBuf = resolve_home_dir(configured, DEFAULT_HOME_SUBDIR, true)
        .context("Cannot resolve server.home_dir")?;
    server.home_dir = resolved.to_string_lossy().into_owned();
    Ok(())
}

fn merge_module_files(
    bag: &mut HashMap<String, serde_json::Value>,
    dir: impl AsRef<Path>,
) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot list modules_dir {}", dir.display()))?;
    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        let is_yaml = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yml" | "yaml"));
        let Some(module) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_yaml || !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read module file {}", path.display()))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("Module file {} is not valid YAML", path.display()))?;
        bag.insert(module.to_string(), serde_json::to_value(value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct DemoModuleConfig {
        #[serde(default)]
        max_backends: usize,
        #[serde(default)]
        default_backend: Option<String>,
    }

    #[test]
    fn defaults_before_normalization() {
        let config = AppConfig::default();

        assert_eq!(config.server.home_dir, "");
        assert_eq!(config.server.shutdown_timeout_sec, 30);

        let section = &config.logging.as_ref().unwrap()["default"];
        assert_eq!(section.console_level, "info");
        assert_eq!(section.file, "logs/infergate.log");

        assert!(config.modules.is_empty());
    }

    #[test]
    fn yaml_sections_and_module_bag_are_loaded() {
        let tmp = tempdir().unwrap();
        let cfg_path = tmp.path().join("infergate.yaml");
        let home = tmp.path().join("home");

        let yaml = format!(
            r#"
server:
  home_dir: "{}"
  shutdown_timeout_sec: 5

logging:
  default:
    console_level: debug
    file: "logs/default.log"

modules:
  orchestrator:
    config:
      max_backends: 3
      default_backend: "llama-cpp"
"#,
            home.display()
        );
        fs::write(&cfg_path, &yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();

        assert_eq!(PathBuf::from(&config.server.home_dir), home);
        assert!(home.is_dir(), "home_dir should be created");
        assert_eq!(config.server.shutdown_timeout_sec, 5);
        assert_eq!(config.logging.as_ref().unwrap()["default"].console_level, "debug");

        let module: DemoModuleConfig = config.module_config("orchestrator").unwrap();
        assert_eq!(
            module,
            DemoModuleConfig {
                max_backends: 3,
                default_backend: Some("llama-cpp".to_string()),
            }
        );
    }

    #[test]
    fn modules_dir_files_join_the_bag() {
        let tmp = tempdir().unwrap();
        let modules_dir = tmp.path().join("modules.d");
        fs::create_dir(&modules_dir).unwrap();
        fs::write(
            modules_dir.join("orchestrator.yaml"),
            "config:\n  max_backends: 7\n",
        )
        .unwrap();
        fs::write(modules_dir.join("notes.txt"), "ignored").unwrap();

        let cfg_path = tmp.path().join("gateway.yaml");
        let yaml = format!(
            "server:\n  home_dir: \"{}\"\nmodules_dir: \"{}\"\n",
            tmp.path().join("home").display(),
            modules_dir.display()
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();
        assert_eq!(config.modules.len(), 1);
        let module: DemoModuleConfig = config.module_config("orchestrator").unwrap();
        assert_eq!(module.max_backends, 7);
    }

    #[test]
    fn absent_module_yields_default() {
        let config = AppConfig::default();
        let module: DemoModuleConfig = config.module_config("orchestrator").unwrap();
        assert_eq!(module, DemoModuleConfig::default());
    }

    #[test]
    fn mistyped_module_config_names_the_module() {
        let mut config = AppConfig::default();
        config.modules.insert(
            "orchestrator".to_string(),
            serde_json::json!({ "config": { "max_backends": "many" } }),
        );

        let err = config
            .module_config::<DemoModuleConfig>("orchestrator")
            .unwrap_err();
        assert!(err.to_string().contains("orchestrator"));
    }

    #[test]
    fn verbosity_raises_console_level() {
        for (verbose, expected) in [(0, "info"), (1, "debug"), (2, "trace"), (3, "trace")] {
            let mut config = AppConfig::default();
            config.apply_cli_overrides(&CliArgs {
                verbose,
                ..CliArgs::default()
            });

            let logging = config.logging.as_ref().unwrap();
            assert_eq!(
                logging["default"].console_level, expected,
                "Failed for verbose level {verbose}"
            );
        }
    }

    #[test]
    fn renders_as_yaml() {
        let yaml = AppConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("server:"));
        assert!(yaml.contains("logging:"));
        assert!(yaml.contains("modules:"));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn default_home_dir_lives_under_user_home() {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempdir().unwrap();
        let original = std::env::var_os("HOME");
        std::env::set_var("HOME", tmp.path());

        let config = AppConfig::load_or_default(None::<&str>);

        match original {
            Some(v) => std::env::set_var("HOME", v),
            None => std::env::remove_var("HOME"),
        }
        let config = config.unwrap();
        assert_eq!(
            PathBuf::from(&config.server.home_dir),
            tmp.path().join(".infergate")
        );
    }
}
