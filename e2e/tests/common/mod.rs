//! Shared scaffolding for the scenario tests in this crate: a tempdir-backed
//! sled database wired into the real stores, plus a minimal loopback HTTP
//! responder standing in for a workload's health endpoint so readiness can
//! be confirmed without a live SSH server.

use broker_core::config::{DestroyConfig, LifecycleConfig, VerificationConfig};
use broker_core::destroyer::DestructionVerifier;
use broker_core::provisioner::Provisioner;
use broker_core::store::{SledCostStore, SledManifestStore, SledRunStore, SledSessionStore};
use broker_core::testutil::InstantSleep;
use broker_core::util::AsyncSleeping;
use broker_core::verifier::ReadinessVerifier;
use providers::FakeProvider;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

pub struct Harness {
    pub _db_dir: tempfile::TempDir,
    pub sessions: Arc<SledSessionStore>,
    pub manifests: Arc<SledManifestStore>,
    pub runs: Arc<SledRunStore>,
    pub costs: Arc<SledCostStore>,
}

impl Harness {
    pub fn new() -> Self {
        let db_dir = tempfile::tempdir().unwrap();
        let db = sled::open(db_dir.path()).unwrap();
        Harness {
            sessions: Arc::new(SledSessionStore::new(&db).unwrap()),
            manifests: Arc::new(SledManifestStore::new(&db).unwrap()),
            runs: Arc::new(SledRunStore::new(&db).unwrap()),
            costs: Arc::new(SledCostStore::new(&db).unwrap()),
            _db_dir: db_dir,
        }
    }
}

/// A sleeper whose delays resolve instantly, so scenario tests exercise real
/// backoff/retry loop *shapes* without spending real wall-clock time.
pub fn instant_sleeper() -> Arc<dyn AsyncSleeping> {
    Arc::new(InstantSleep::default())
}

pub fn verification_config() -> VerificationConfig {
    VerificationConfig {
        initial_interval: std::time::Duration::from_millis(1),
        max_interval: std::time::Duration::from_millis(5),
        backoff_multiplier: 1.5,
        ssh_timeout: std::time::Duration::from_millis(50),
        api_timeout: std::time::Duration::from_millis(50),
    }
}

pub fn destroy_config() -> DestroyConfig {
    DestroyConfig {
        retry_base: std::time::Duration::from_millis(1),
        retries: 3,
    }
}

pub fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        deployment_id: "e2e".to_string(),
        ..LifecycleConfig::default()
    }
}

pub fn provisioner(
    harness: &Harness,
    providers: std::collections::HashMap<String, Arc<dyn broker_core::provider::Provider>>,
) -> (Arc<Provisioner>, Arc<ReadinessVerifier>) {
    let verifier = Arc::new(
        ReadinessVerifier::new(harness.sessions.clone(), verification_config(), instant_sleeper()),
    );
    let provisioner = Arc::new(Provisioner::new(
        harness.sessions.clone(),
        providers,
        verifier.clone(),
        &lifecycle_config(),
    ));
    (provisioner, verifier)
}

pub fn destroyer(harness: &Harness) -> Arc<DestructionVerifier> {
    Arc::new(DestructionVerifier::new(
        harness.sessions.clone(),
        destroy_config(),
        instant_sleeper(),
    ))
}

/// Spawns a background thread that accepts exactly one TCP connection per
/// accepted loop iteration and answers every request with a bare `200 OK`,
/// standing in for the bare HTTP health endpoint the spec allows as an
/// alternative to SSH-based readiness probing. Returns the bound port.
pub fn spawn_http_ok_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
        }
    });
    port
}

/// Builds a `FakeProvider` whose `create_instance` hands back an
/// `api_endpoint`/`api_port` pointing at a local loopback HTTP responder,
/// so the readiness verifier's HTTP probe path can be exercised end to end
/// without a live SSH daemon.
pub fn fake_provider_with_http_instance(name: &str, port: u16) -> FakeProvider {
    FakeProvider::new(name).with_create_result(Ok(broker_core::provider::InstanceInfo {
        provider_instance_id: String::new(),
        host: None,
        port: None,
        user: None,
        api_endpoint: Some("127.0.0.1".to_string()),
        api_port: Some(port),
        price_per_hour: None,
    }))
}
