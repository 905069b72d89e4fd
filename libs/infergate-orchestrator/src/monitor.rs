//! Point-in-time resource usage of backend processes.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::catalog::BackendConfigLookup;
use crate::error::{OrchestratorError, Result};
use crate::options::BackendKey;
use crate::registry::BackendRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub pid: u32,
    /// Resident set size.
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    /// RSS as a share of total physical memory, 0..=100.
    pub memory_percent: f32,
    /// CPU usage over the sampling window; may exceed 100 on multi-core hosts.
    pub cpu_percent: f32,
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self, pid: u32) -> Result<ResourceSample>;
}

/// Samples through the OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoSampler;

impl SysinfoSampler {
    fn refresh(system: &mut System, pid: u32) -> Result<()> {
        let target = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match system.process(target).map(|p| p.status()) {
            None => Err(unavailable(pid, "no such process")),
            Some(ProcessStatus::Zombie) => Err(unavailable(pid, "process has exited (zombie)")),
            Some(ProcessStatus::Dead) => Err(unavailable(pid, "process is dead")),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(&self, pid: u32) -> Result<ResourceSample> {
        let mut system = System::new();
        system.refresh_memory();

        // CPU usage is the delta between two refreshes.
        Self::refresh(&mut system, pid)?;
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        Self::refresh(&mut system, pid)?;

        let process = system
            .process(Pid::from_u32(pid))
            .ok_or_else(|| unavailable(pid, "no such process"))?;
        let total = system.total_memory();
        let rss = process.memory();

        Ok(ResourceSample {
            pid,
            rss_bytes: rss,
            virtual_bytes: process.virtual_memory(),
            memory_percent: if total == 0 {
                0.0
            } else {
                (rss as f64 / total as f64 * 100.0) as f32
            },
            cpu_percent: process.cpu_usage(),
        })
    }
}

/// Sampler for hosts or backends where per-process sampling is not possible.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

#[async_trait]
impl ResourceSampler for NoopSampler {
    async fn sample(&self, pid: u32) -> Result<ResourceSample> {
        Err(unavailable(pid, "resource sampling is not supported here"))
    }
}

fn unavailable(pid: u32, reason: &str) -> OrchestratorError {
    OrchestratorError::ProcessUnavailable {
        pid,
        reason: reason.to_string(),
    }
}

/// Samples backends by key or model name.
pub struct BackendMonitor {
    registry: BackendRegistry,
    sampler: Arc<dyn ResourceSampler>,
    configs: Option<Arc<dyn BackendConfigLookup>>,
}

impl BackendMonitor {
    pub fn new(registry: BackendRegistry, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            registry,
            sampler,
            configs: None,
        }
    }

    pub fn with_configs(mut self, configs: Arc<dyn BackendConfigLookup>) -> Self {
        self.configs = Some(configs);
        self
    }

    pub async fn sample(&self, key: &BackendKey) -> Result<ResourceSample> {
        let pid = self.registry.pid_of(key)?;
        let sample = self.sampler.sample(pid).await;
        if let Err(e) = &sample {
            tracing::warn!(%key, pid, error = %e, "backend sampling failed");
        }
        sample
    }

    /// Resolve `model` to its backend (config model file, else the raw
    /// name; `<name>.bin` is tried for names without an extension) and
    /// sample it.
    pub async fn sample_model(&self, model: &str) -> Result<ResourceSample> {
        let resolved = self
            .configs
            .as_ref()
            .and_then(|c| c.backend_config(model))
            .map(|c| c.model)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| model.to_string());

        let key = BackendKey::new(&resolved)?;
        match self.registry.pid_of(&key) {
            Err(OrchestratorError::BackendNotFound(_)) if Path::new(&resolved).extension().is_none() => {
                let with_bin = BackendKey::new(format!("{resolved}.bin"))?;
                if self.registry.pid_of(&with_bin).is_ok() {
                    return self.sample(&with_bin).await;
                }
                Err(OrchestratorError::BackendNotFound(model.to_string()))
            }
            Err(e) => Err(e),
            Ok(_) => self.sample(&key).await,
        }
    }
}
