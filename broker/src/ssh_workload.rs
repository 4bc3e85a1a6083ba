//! `WorkloadRunner` for the benchmark orchestrator: connects to a
//! provisioned session over SSH, kicks off the `gpu-benchmark-client`
//! binary assumed present on the provider's image, and polls a completion
//! marker file until the workload finishes or `result_timeout` elapses.
//! The SSH handshake and key-based auth mirror the readiness verifier's
//! own `ssh2` probe.

use async_trait::async_trait;
use broker_core::benchmark::{BenchmarkResult, WorkloadError, WorkloadRunner};
use broker_core::models::Session;
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const JOB_FILE: &str = "/tmp/gpu-benchmark-job.json";
const RESULT_FILE: &str = "/tmp/gpu-benchmark-result.json";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct JobResult {
    throughput: Option<f64>,
    error: Option<String>,
}

pub struct SshWorkloadRunner;

#[async_trait]
impl WorkloadRunner for SshWorkloadRunner {
    async fn run(
        &self,
        session: &Session,
        private_key_pem: &str,
        model: &str,
        result_timeout: Duration,
    ) -> Result<BenchmarkResult, WorkloadError> {
        let host = session.ssh_host.clone().ok_or_else(|| WorkloadError {
            stage: "connect",
            message: "session has no ssh_host".to_string(),
        })?;
        let port = session.ssh_port.unwrap_or(22);
        let user = session
            .ssh_user
            .clone()
            .unwrap_or_else(|| "root".to_string());
        let model = model.to_string();
        let private_key_pem = private_key_pem.to_string();

        let deploy_host = host.clone();
        let deploy_user = user.clone();
        let deploy_key = private_key_pem.clone();
        let deploy_model = model.clone();
        tokio::task::spawn_blocking(move || deploy(&deploy_host, port, &deploy_user, &deploy_key, &deploy_model))
            .await
            .map_err(|err| WorkloadError {
                stage: "deploy",
                message: err.to_string(),
            })??;

        let deadline = Instant::now() + result_timeout;
        loop {
            let poll_host = host.clone();
            let poll_user = user.clone();
            let poll_key = private_key_pem.clone();
            let outcome = tokio::task::spawn_blocking(move || poll(&poll_host, port, &poll_user, &poll_key))
                .await
                .map_err(|err| WorkloadError {
                    stage: "result",
                    message: err.to_string(),
                })?;

            match outcome {
                Some(result) => return result,
                None if Instant::now() >= deadline => {
                    return Err(WorkloadError {
                        stage: "result-timeout",
                        message: format!("no result within {:?}", result_timeout),
                    })
                }
                None => sleep(POLL_INTERVAL).await,
            }
        }
    }
}

fn connect(host: &str, port: u16, user: &str, private_key_pem: &str) -> Result<ssh2::Session, String> {
    let tcp = TcpStream::connect((host, port)).map_err(|err| err.to_string())?;
    let mut session = ssh2::Session::new().map_err(|err| err.to_string())?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|err| err.to_string())?;
    session
        .userauth_pubkey_memory(user, None, private_key_pem, None)
        .map_err(|err| err.to_string())?;
    Ok(session)
}

fn exec(session: &ssh2::Session, command: &str) -> Result<String, String> {
    let mut channel = session.channel_session().map_err(|err| err.to_string())?;
    channel.exec(command).map_err(|err| err.to_string())?;
    let mut output = String::new();
    channel
        .read_to_string(&mut output)
        .map_err(|err| err.to_string())?;
    channel.wait_close().map_err(|err| err.to_string())?;
    Ok(output)
}

fn deploy(host: &str, port: u16, user: &str, private_key_pem: &str, model: &str) -> Result<(), WorkloadError> {
    let session = connect(host, port, user, private_key_pem).map_err(|message| WorkloadError {
        stage: "connect",
        message,
    })?;

    let job = serde_json::json!({ "model": model }).to_string();
    let mut channel = session
        .channel_session()
        .map_err(|err| WorkloadError { stage: "deploy", message: err.to_string() })?;
    channel
        .exec(&format!("cat > {} && rm -f {}", JOB_FILE, RESULT_FILE))
        .map_err(|err| WorkloadError { stage: "deploy", message: err.to_string() })?;
    channel
        .write_all(job.as_bytes())
        .map_err(|err| WorkloadError { stage: "deploy", message: err.to_string() })?;
    channel.send_eof().map_err(|err| WorkloadError { stage: "deploy", message: err.to_string() })?;
    channel.wait_close().map_err(|err| WorkloadError { stage: "deploy", message: err.to_string() })?;

    exec(
        &session,
        &format!(
            "nohup gpu-benchmark-client --job {} --out {} >/tmp/gpu-benchmark-client.log 2>&1 &",
            JOB_FILE, RESULT_FILE
        ),
    )
    .map_err(|message| WorkloadError {
        stage: "deploy",
        message,
    })?;
    Ok(())
}

fn poll(host: &str, port: u16, user: &str, private_key_pem: &str) -> Option<Result<BenchmarkResult, WorkloadError>> {
    let session = connect(host, port, user, private_key_pem).ok()?;
    let output = exec(&session, &format!("cat {} 2>/dev/null", RESULT_FILE)).ok()?;
    if output.trim().is_empty() {
        return None;
    }
    let result: JobResult = match serde_json::from_str(&output) {
        Ok(result) => result,
        Err(_) => return None,
    };
    if let Some(error) = result.error {
        return Some(Err(WorkloadError {
            stage: "result",
            message: error,
        }));
    }
    match result.throughput {
        Some(throughput) => Some(Ok(BenchmarkResult { throughput })),
        None => None,
    }
}
