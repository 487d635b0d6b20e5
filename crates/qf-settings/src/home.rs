use std::path::{Path, PathBuf};

/// Environment variable overriding the base directory.
pub const HOME_ENV: &str = "QF_HOME";

/// Resolve the base directory holding calculation records and working directories.
///
/// Resolution order:
/// 1. explicit override (command line)
/// 2. `QF_HOME` environment variable
/// 3. `orchestrator.base_directory` from settings
/// 4. `~/.quantics_flow`
///
/// ```text
/// ~/.quantics_flow/
/// ├── settings.yaml
/// ├── records/        # one <name>.json per calculation
/// └── runs/
///     └── <name>/     # working directory owned by that calculation
/// ```
pub fn resolve_base_directory(explicit: Option<&Path>, configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(home) = std::env::var(HOME_ENV)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quantics_flow")
}

pub fn settings_path(base: &Path) -> PathBuf {
    base.join("settings.yaml")
}

pub fn records_dir(base: &Path) -> PathBuf {
    base.join("records")
}

pub fn runs_dir(base: &Path) -> PathBuf {
    base.join("runs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let dir = resolve_base_directory(Some(Path::new("/srv/qf")), Some(Path::new("/ignored")));
        assert_eq!(dir, PathBuf::from("/srv/qf"));
        assert_eq!(records_dir(&dir), PathBuf::from("/srv/qf/records"));
        assert_eq!(runs_dir(&dir), PathBuf::from("/srv/qf/runs"));
    }
}
