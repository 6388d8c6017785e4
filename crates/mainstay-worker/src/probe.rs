//! Worker capability probing
//!
//! Host inventory is an external collaborator; this module defines the
//! interface the worker uses and a static, configuration-driven default.

use mainstay_core::resources::{InstalledPackage, WorkerResources, WorkerRuntime};
use mainstay_core::worker::WorkerRegistration;

/// Supplies the capability snapshot advertised at registration.
pub trait ResourceProbe: Send + Sync {
    fn runtime(&self) -> WorkerRuntime;
    fn resources(&self) -> WorkerResources;
    fn packages(&self) -> Vec<InstalledPackage>;

    fn registration(&self, name: &str) -> WorkerRegistration {
        WorkerRegistration {
            name: name.to_string(),
            runtime: self.runtime(),
            resources: self.resources(),
            packages: self.packages(),
        }
    }
}

/// Probe with fixed values, optionally overridden by the deployment.
pub struct StaticProbe {
    resources: WorkerResources,
    packages: Vec<InstalledPackage>,
}

impl StaticProbe {
    pub fn new(resources: WorkerResources, packages: Vec<InstalledPackage>) -> Self {
        Self {
            resources,
            packages,
        }
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            resources: WorkerResources {
                cpu_total: std::thread::available_parallelism()
                    .map(|n| n.get() as f64)
                    .unwrap_or(1.0),
                cpu_available: std::thread::available_parallelism()
                    .map(|n| n.get() as f64)
                    .unwrap_or(1.0),
                memory_total: 0,
                memory_available: 0,
                disk_total: 0,
                disk_free: 0,
                gpus: vec![],
            },
            packages: vec![],
        }
    }
}

impl ResourceProbe for StaticProbe {
    fn runtime(&self) -> WorkerRuntime {
        WorkerRuntime {
            os_name: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn resources(&self) -> WorkerResources {
        self.resources.clone()
    }

    fn packages(&self) -> Vec<InstalledPackage> {
        self.packages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_probe_reports_cpus() {
        let probe = StaticProbe::default();
        assert!(probe.resources().cpu_total >= 1.0);
        assert!(!probe.runtime().os_name.is_empty());
    }

    #[test]
    fn test_registration_carries_name() {
        let probe = StaticProbe::default();
        let registration = probe.registration("worker-1");
        assert_eq!(registration.name, "worker-1");
    }
}
