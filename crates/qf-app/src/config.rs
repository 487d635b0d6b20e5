//! Runtime configuration of the lifecycle manager.

use std::path::{Path, PathBuf};
use std::time::Duration;

use qf_exec::{LocalConfig, RemoteConfig};
use qf_settings::Settings;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Parent of every calculation's working directory.
    pub runs_root: PathBuf,
    /// Record directory; `None` keeps the registry in memory only.
    pub records_root: Option<PathBuf>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Consecutive non-timeout poll errors tolerated before a remote
    /// calculation is marked failed.
    pub max_poll_failures: u32,
    pub event_capacity: usize,
    pub tool_dir: Option<PathBuf>,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
}

impl ManagerConfig {
    /// In-memory configuration with default timings, for tests and embedding.
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
            records_root: None,
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(2),
            max_poll_failures: 5,
            event_capacity: 256,
            tool_dir: None,
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
        }
    }

    /// Persistent configuration rooted at `base` (see `qf_settings::home`).
    pub fn from_settings(settings: &Settings, base: &Path) -> Self {
        let orch = &settings.orchestrator;
        let poll_timeout = Duration::from_millis(orch.poll_timeout_ms);
        Self {
            runs_root: qf_settings::runs_dir(base),
            records_root: Some(qf_settings::records_dir(base)),
            poll_interval: Duration::from_millis(orch.poll_interval_ms),
            poll_timeout,
            max_poll_failures: orch.max_poll_failures,
            event_capacity: orch.event_capacity,
            tool_dir: settings.solver.tool_dir.clone(),
            local: LocalConfig {
                solver: settings.solver.executable.clone(),
                extra_args: settings.solver.extra_args.clone(),
                log_capacity: orch.log_capacity,
            },
            remote: RemoteConfig {
                code_label: settings.remote.code_label.clone(),
                scheduler: settings.remote.scheduler.clone(),
                num_machines: settings.remote.num_machines,
                mpiprocs: settings.remote.mpiprocs,
                walltime_s: settings.remote.walltime_s,
                queue: settings.remote.queue.clone(),
                call_timeout: poll_timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_map_onto_manager_config() {
        let mut settings = Settings::default();
        settings.solver.executable = "/opt/quantics".to_string();
        settings.orchestrator.poll_interval_ms = 750;
        settings.remote.scheduler = "sge".to_string();

        let config = ManagerConfig::from_settings(&settings, Path::new("/home/u/.quantics_flow"));
        assert_eq!(config.runs_root, PathBuf::from("/home/u/.quantics_flow/runs"));
        assert_eq!(
            config.records_root,
            Some(PathBuf::from("/home/u/.quantics_flow/records"))
        );
        assert_eq!(config.poll_interval, Duration::from_millis(750));
        assert_eq!(config.local.solver, "/opt/quantics");
        assert_eq!(config.remote.scheduler, "sge");
        assert_eq!(config.remote.call_timeout, config.poll_timeout);
    }
}
