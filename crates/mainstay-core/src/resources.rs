//! Resource requests and worker capacity matching
//!
//! Workflows declare what they need (cores, memory, disk, GPUs, packages);
//! workers advertise what they have. The dispatcher only offers an execution
//! to a worker whose *available* figures satisfy every declared field.

use serde::{Deserialize, Serialize};

use crate::errors::ExecutionError;

const KIB: u64 = 1024;

/// A byte quantity that deserializes from an integer or a string with a
/// binary suffix (`"4Gi"`, `"512M"`, `"2T"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(try_from = "MemoryRepr", into = "u64")]
pub struct ByteSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum MemoryRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<MemoryRepr> for ByteSize {
    type Error = String;

    fn try_from(repr: MemoryRepr) -> Result<Self, Self::Error> {
        match repr {
            MemoryRepr::Bytes(n) => Ok(Self(n)),
            MemoryRepr::Text(s) => parse_bytes(&s).map(Self),
        }
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> u64 {
        size.0
    }
}

impl std::str::FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_bytes(s).map(Self)
    }
}

/// Parse `"123"`, `"4G"`, `"4Gi"` etc. Suffixes are binary: K=Ki=1024,
/// M, G, T, P likewise.
fn parse_bytes(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty memory value".to_string());
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let base: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory value '{input}'"))?;

    let multiplier = match suffix.trim_end_matches('i').trim() {
        "" | "B" => 1,
        "K" | "k" => KIB,
        "M" | "m" => KIB.pow(2),
        "G" | "g" => KIB.pow(3),
        "T" | "t" => KIB.pow(4),
        "P" | "p" => KIB.pow(5),
        other => return Err(format!("unknown memory suffix '{other}'")),
    };

    base.checked_mul(multiplier)
        .ok_or_else(|| format!("memory value '{input}' overflows"))
}

/// Comparison operator of a package requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VersionOp {
    /// Exact match (`==`).
    Eq,
    /// At least (`>=`).
    Ge,
}

/// One `name[op version]` entry of a request's package list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PackageRequirement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<VersionOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PackageRequirement {
    /// Parse `"numpy"`, `"numpy>=1.20.0"` or `"scikit-learn==1.0.0"`.
    pub fn parse(spec: &str) -> Result<Self, ExecutionError> {
        let spec = spec.trim();
        for (token, op) in [("==", VersionOp::Eq), (">=", VersionOp::Ge)] {
            if let Some((name, version)) = spec.split_once(token) {
                let name = name.trim();
                let version = version.trim();
                if name.is_empty() || version.is_empty() {
                    return Err(ExecutionError::Serialization(format!(
                        "invalid package requirement '{spec}'"
                    )));
                }
                return Ok(Self {
                    name: name.to_string(),
                    op: Some(op),
                    version: Some(version.to_string()),
                });
            }
        }
        if spec.is_empty() {
            return Err(ExecutionError::Serialization(
                "empty package requirement".to_string(),
            ));
        }
        Ok(Self {
            name: spec.to_string(),
            op: None,
            version: None,
        })
    }

    /// Whether an installed package satisfies this requirement.
    pub fn satisfied_by(&self, installed: &InstalledPackage) -> bool {
        if installed.name != self.name {
            return false;
        }
        match (self.op, self.version.as_deref()) {
            (None, _) | (_, None) => true,
            (Some(VersionOp::Eq), Some(wanted)) => {
                compare_versions(&installed.version, wanted) == std::cmp::Ordering::Equal
            }
            (Some(VersionOp::Ge), Some(wanted)) => {
                compare_versions(&installed.version, wanted) != std::cmp::Ordering::Less
            }
        }
    }
}

/// Compare dot-separated version strings, numerically when both tokens parse
/// as integers and lexicographically otherwise. Missing tokens count as zero.
pub fn compare_versions(left: &str, right: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let lhs: Vec<&str> = left.split('.').collect();
    let rhs: Vec<&str> = right.split('.').collect();
    let len = lhs.len().max(rhs.len());

    for i in 0..len {
        let a = lhs.get(i).copied().unwrap_or("0");
        let b = rhs.get(i).copied().unwrap_or("0");

        let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Resources a workflow declares it needs to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageRequirement>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpu(mut self, cores: u32) -> Self {
        self.cpu = Some(cores);
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Result<Self, ExecutionError> {
        let text = memory.into();
        let size = parse_bytes(&text).map_err(ExecutionError::Serialization)?;
        self.memory = Some(ByteSize(size));
        Ok(self)
    }

    pub fn with_disk(mut self, disk: impl Into<String>) -> Result<Self, ExecutionError> {
        let text = disk.into();
        let size = parse_bytes(&text).map_err(ExecutionError::Serialization)?;
        self.disk = Some(ByteSize(size));
        Ok(self)
    }

    pub fn with_gpu(mut self, count: u32) -> Self {
        self.gpu = Some(count);
        self
    }

    pub fn with_packages<I, S>(mut self, specs: I) -> Result<Self, ExecutionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for spec in specs {
            self.packages.push(PackageRequirement::parse(spec.as_ref())?);
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.memory.is_none()
            && self.disk.is_none()
            && self.gpu.is_none()
            && self.packages.is_empty()
    }

    /// Whether a worker's available capacity satisfies every declared field.
    pub fn matches_worker(
        &self,
        resources: &WorkerResources,
        packages: &[InstalledPackage],
    ) -> bool {
        if let Some(cpu) = self.cpu {
            if f64::from(cpu) > resources.cpu_available {
                return false;
            }
        }
        if let Some(memory) = self.memory {
            if memory.0 > resources.memory_available {
                return false;
            }
        }
        if let Some(disk) = self.disk {
            if disk.0 > resources.disk_free {
                return false;
            }
        }
        if let Some(gpu) = self.gpu {
            if (resources.gpus.len() as u32) < gpu {
                return false;
            }
        }
        self.packages
            .iter()
            .all(|req| packages.iter().any(|pkg| req.satisfied_by(pkg)))
    }
}

/// Capacity snapshot a worker advertises at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkerResources {
    pub cpu_total: f64,
    pub cpu_available: f64,
    pub memory_total: u64,
    pub memory_available: u64,
    pub disk_total: u64,
    pub disk_free: u64,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct GpuInfo {
    pub name: String,
    pub memory_total: u64,
    pub memory_available: u64,
}

/// Runtime identification a worker reports at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkerRuntime {
    pub os_name: String,
    pub os_version: String,
    pub runtime_version: String,
}

/// A package available in the worker's environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn worker_resources() -> WorkerResources {
        WorkerResources {
            cpu_total: 4.0,
            cpu_available: 3.0,
            memory_total: 8 * GIB,
            memory_available: 6 * GIB,
            disk_total: 100 * GIB,
            disk_free: 80 * GIB,
            gpus: vec![],
        }
    }

    #[test]
    fn test_parse_bytes_suffixes() {
        assert_eq!(parse_bytes("123").unwrap(), 123);
        assert_eq!(parse_bytes("4K").unwrap(), 4 * 1024);
        assert_eq!(parse_bytes("4Ki").unwrap(), 4 * 1024);
        assert_eq!(parse_bytes("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_bytes("4Gi").unwrap(), 4 * GIB);
        assert_eq!(parse_bytes("2T").unwrap(), 2 * 1024 * GIB);
        assert_eq!(parse_bytes("1P").unwrap(), 1024 * 1024 * GIB);
    }

    #[test]
    fn test_parse_bytes_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("4X").is_err());
    }

    #[test]
    fn test_matches_worker_basic() {
        let request = ResourceRequest::new()
            .with_cpu(2)
            .with_memory("4Gi")
            .unwrap();

        assert!(request.matches_worker(&worker_resources(), &[]));

        let mut insufficient = worker_resources();
        insufficient.cpu_available = 1.0;
        assert!(!request.matches_worker(&insufficient, &[]));
    }

    #[test]
    fn test_matches_worker_gpu() {
        let request = ResourceRequest::new().with_gpu(1);

        let mut with_gpu = worker_resources();
        with_gpu.gpus.push(GpuInfo {
            name: "NVIDIA GeForce RTX 3080".into(),
            memory_total: 10 * GIB,
            memory_available: 8 * GIB,
        });
        assert!(request.matches_worker(&with_gpu, &[]));
        assert!(!request.matches_worker(&worker_resources(), &[]));
    }

    #[test]
    fn test_matches_worker_packages() {
        let request = ResourceRequest::new()
            .with_packages(["numpy>=1.20.0", "pandas", "scikit-learn==1.0.0"])
            .unwrap();

        let installed = vec![
            InstalledPackage {
                name: "numpy".into(),
                version: "1.21.0".into(),
            },
            InstalledPackage {
                name: "pandas".into(),
                version: "1.3.0".into(),
            },
            InstalledPackage {
                name: "scikit-learn".into(),
                version: "1.0.0".into(),
            },
        ];
        assert!(request.matches_worker(&worker_resources(), &installed));

        let outdated = vec![
            InstalledPackage {
                name: "numpy".into(),
                version: "1.19.0".into(),
            },
            InstalledPackage {
                name: "pandas".into(),
                version: "1.3.0".into(),
            },
            InstalledPackage {
                name: "scikit-learn".into(),
                version: "1.0.0".into(),
            },
        ];
        assert!(!request.matches_worker(&worker_resources(), &outdated));
    }

    #[test]
    fn test_empty_request_matches_anything() {
        let request = ResourceRequest::new();
        assert!(request.is_empty());
        assert!(request.matches_worker(&WorkerResources::default(), &[]));
    }

    #[test]
    fn test_package_requirement_parsing() {
        let bare = PackageRequirement::parse("pandas").unwrap();
        assert_eq!(bare.name, "pandas");
        assert!(bare.op.is_none());

        let ge = PackageRequirement::parse("numpy>=1.20.0").unwrap();
        assert_eq!(ge.op, Some(VersionOp::Ge));
        assert_eq!(ge.version.as_deref(), Some("1.20.0"));

        let eq = PackageRequirement::parse("scikit-learn==1.0.0").unwrap();
        assert_eq!(eq.op, Some(VersionOp::Eq));

        assert!(PackageRequirement::parse("").is_err());
        assert!(PackageRequirement::parse(">=1.0").is_err());
    }

    #[test]
    fn test_version_comparison() {
        use std::cmp::Ordering;

        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
        // Non-numeric tokens fall back to lexicographic comparison.
        assert_eq!(compare_versions("1.0.beta", "1.0.alpha"), Ordering::Greater);
    }

    #[test]
    fn test_memory_deserializes_from_int_or_string() {
        let from_int: ResourceRequest = serde_json::from_str(r#"{"memory": 1048576}"#).unwrap();
        assert_eq!(from_int.memory, Some(ByteSize(1048576)));

        let from_text: ResourceRequest = serde_json::from_str(r#"{"memory": "1Mi"}"#).unwrap();
        assert_eq!(from_text.memory, Some(ByteSize(1048576)));
    }
}
