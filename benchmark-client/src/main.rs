//! Runs on a leased instance. Reads a job description written by the
//! broker's SSH deployment step, measures throughput for the requested
//! model and writes a result file the broker polls for. Deliberately
//! small and dependency-light: this binary ships onto provider images,
//! not into the broker's own process.

mod workload;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "gpu-benchmark-client", rename_all = "kebab")]
struct Options {
    /// Path to the job file, written by the broker as `{"model": "..."}`.
    #[structopt(long, parse(from_os_str))]
    job: PathBuf,

    /// Path to the result file this process writes on completion.
    #[structopt(long, parse(from_os_str))]
    out: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Job {
    model: String,
}

#[derive(Debug, Default, Serialize)]
struct JobResult {
    throughput: Option<f64>,
    error: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = Options::from_args();

    let result = match run(&options) {
        Ok(throughput) => JobResult {
            throughput: Some(throughput),
            error: None,
        },
        Err(err) => {
            log::error!("benchmark run failed: {:#}", err);
            JobResult {
                throughput: None,
                error: Some(err.to_string()),
            }
        }
    };

    if let Err(err) = write_result(&options.out, &result) {
        log::error!("failed to write result file {:?}: {:#}", options.out, err);
        std::process::exit(1);
    }
}

fn run(options: &Options) -> anyhow::Result<f64> {
    let raw = fs::read_to_string(&options.job)
        .map_err(|err| anyhow::anyhow!("failed to read job file {:?}: {}", options.job, err))?;
    let job: Job = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("malformed job file {:?}: {}", options.job, err))?;
    log::info!("running benchmark for model '{}'", job.model);
    workload::measure_throughput(&job.model)
}

fn write_result(path: &PathBuf, result: &JobResult) -> anyhow::Result<()> {
    let body = serde_json::to_string(result)?;
    // Write to a sibling temp file and rename, so a poller never observes
    // a partially-written result file.
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
