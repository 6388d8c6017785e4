//! Shared test fixtures
//!
//! Serves the control plane's router over a real socket with fully
//! in-memory state, so the client and worker loop are exercised against the
//! same HTTP surface they meet in production.

use mainstay_control_plane::{api, AppState};
use mainstay_core::config::Config;
use mainstay_core::resources::{WorkerResources, WorkerRuntime};
use mainstay_core::worker::WorkerRegistration;

pub(crate) const BOOTSTRAP_TOKEN: &str = "bootstrap-test";

pub(crate) struct TestControlPlane {
    pub state: AppState,
    pub url: String,
}

/// Bind an ephemeral port and serve an in-memory control plane on it. The
/// server task dies with the test runtime.
pub(crate) async fn spawn_control_plane() -> TestControlPlane {
    let mut config = Config::default();
    config.workers.bootstrap_token = BOOTSTRAP_TOKEN.to_string();
    let state = AppState::in_memory(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let router = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    TestControlPlane {
        state,
        url: format!("http://{addr}"),
    }
}

pub(crate) fn registration(name: &str) -> WorkerRegistration {
    const GIB: u64 = 1024 * 1024 * 1024;
    WorkerRegistration {
        name: name.to_string(),
        runtime: WorkerRuntime {
            os_name: "linux".into(),
            os_version: "x86_64".into(),
            runtime_version: "0.2.0".into(),
        },
        resources: WorkerResources {
            cpu_total: 8.0,
            cpu_available: 6.0,
            memory_total: 16 * GIB,
            memory_available: 12 * GIB,
            disk_total: 500 * GIB,
            disk_free: 400 * GIB,
            gpus: vec![],
        },
        packages: vec![],
    }
}
