use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Errors for resolving the home directory
#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("{0} environment variable is not set")]
    EnvMissing(&'static str),
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(target_os = "windows")]
const USER_HOME_VARS: &[&str] = &["USERPROFILE", "HOME"];
#[cfg(not(target_os = "windows"))]
const USER_HOME_VARS: &[&str] = &["HOME"];

#[cfg(target_os = "windows")]
const DEFAULT_BASE_VAR: &str = "APPDATA";
#[cfg(not(target_os = "windows"))]
const DEFAULT_BASE_VAR: &str = "HOME";

fn user_home() -> Result<PathBuf, HomeDirError> {
    USER_HOME_VARS
        .iter()
        .find_map(|var| env::var_os(var))
        .map(PathBuf::from)
        .ok_or(HomeDirError::EnvMissing(USER_HOME_VARS[0]))
}

/// Expand a leading `~` (alone, `~/rest` or `~\rest`) to the user's home.
/// Anything else is returned unchanged.
pub fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    let rest = raw.strip_prefix("~/").or_else(|| {
        if cfg!(target_os = "windows") {
            raw.strip_prefix("~\\")
        } else {
            None
        }
    });
    match rest {
        Some(rest) => Ok(user_home()?.join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

/// Resolve the application home directory.
///
/// An explicit `config_home` may start with `~` and must be absolute after
/// expansion. Without one, `$HOME/<default_subdir>` is used (`%APPDATA%` on
/// Windows). The directory is created when `create` is set.
pub fn resolve_home_dir(
    config_home: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match config_home {
        Some(raw) => {
            let expanded = expand_tilde(&raw)?;
            if !expanded.is_absolute() {
                return Err(HomeDirError::AbsoluteRequired(
                    expanded.to_string_lossy().into(),
                ));
            }
            expanded
        }
        None => {
            let base = env::var_os(DEFAULT_BASE_VAR)
                .ok_or(HomeDirError::EnvMissing(DEFAULT_BASE_VAR))?;
            Path::new(&base).join(default_subdir)
        }
    };

    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

/// Resolve a configured path against the home directory: `~` is expanded,
/// absolute paths are kept, relative ones are joined onto `home`.
pub fn resolve_under_home(home: &Path, configured: &str) -> Result<PathBuf, HomeDirError> {
    let expanded = expand_tilde(configured)?;
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(home.join(expanded))
    }
}

#[cfg(test)]
#[cfg(not(target_os = "windows"))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn with_home<T>(home: &Path, f: impl FnOnce() -> T) -> T {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let original = env::var_os("HOME");
        env::set_var("HOME", home);
        let out = f();
        match original {
            Some(v) => env::set_var("HOME", v),
            None => env::remove_var("HOME"),
        }
        out
    }

    #[test]
    fn tilde_prefix_is_expanded() {
        let tmp = tempdir().unwrap();
        let result = with_home(tmp.path(), || {
            resolve_home_dir(Some("~/gateway".into()), ".infergate", false)
        })
        .unwrap();

        assert_eq!(result, tmp.path().join("gateway"));
    }

    #[test]
    fn bare_tilde_is_home() {
        let tmp = tempdir().unwrap();
        let result = with_home(tmp.path(), || resolve_home_dir(Some("~".into()), ".infergate", false))
            .unwrap();

        assert_eq!(result, tmp.path());
    }

    #[test]
    fn default_is_created_under_home() {
        let tmp = tempdir().unwrap();
        let result = with_home(tmp.path(), || resolve_home_dir(None, ".infergate", true)).unwrap();

        assert_eq!(result, tmp.path().join(".infergate"));
        assert!(result.is_dir());
    }

    #[test]
    fn relative_home_is_rejected() {
        let err = resolve_home_dir(Some("relative/path".into()), ".infergate", false).unwrap_err();
        assert!(matches!(err, HomeDirError::AbsoluteRequired(_)), "got {err:?}");
    }

    #[test]
    fn missing_home_variable_is_reported() {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let original = env::var_os("HOME");
        env::remove_var("HOME");

        let result = resolve_home_dir(None, ".infergate", false);

        if let Some(home) = original {
            env::set_var("HOME", home);
        }
        assert!(matches!(result, Err(HomeDirError::EnvMissing("HOME"))));
    }

    #[test]
    fn relative_paths_resolve_under_home() {
        let tmp = tempdir().unwrap();
        let resolved = resolve_under_home(tmp.path(), "models").unwrap();
        assert_eq!(resolved, tmp.path().join("models"));

        let absolute = resolve_under_home(tmp.path(), "/srv/models").unwrap();
        assert_eq!(absolute, PathBuf::from("/srv/models"));
    }
}
