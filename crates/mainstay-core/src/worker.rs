//! Worker registry domain types

use serde::{Deserialize, Serialize};

use crate::resources::{InstalledPackage, WorkerResources, WorkerRuntime};

/// A registered worker as known to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker name (primary key).
    pub name: String,

    /// Rotating secret issued at registration; required on every subsequent
    /// control-plane call.
    pub session_token: String,

    pub runtime: WorkerRuntime,
    pub resources: WorkerResources,
    #[serde(default)]
    pub packages: Vec<InstalledPackage>,
}

/// Registration request a worker submits with the bootstrap token.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkerRegistration {
    pub name: String,
    pub runtime: WorkerRuntime,
    pub resources: WorkerResources,
    #[serde(default)]
    pub packages: Vec<InstalledPackage>,
}

/// Generate a fresh session token (32 random bytes, hex).
pub fn generate_session_token() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
