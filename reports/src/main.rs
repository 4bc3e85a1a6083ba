//! A reporting CLI over the broker's durable store: cost rollups and
//! benchmark run results, rendered as JSON or Markdown. Read-only; never
//! opens the database writable, so it can run alongside a live broker.

mod render;

use broker_core::cost_tracker::rollup;
use broker_core::store::{
    ManifestStore, RunStore, SledCostStore, SledManifestStore, SledRunStore,
};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Markdown,
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            _ if value.eq_ignore_ascii_case("json") => Ok(ReportFormat::Json),
            _ if value.eq_ignore_ascii_case("markdown") => Ok(ReportFormat::Markdown),
            _ => anyhow::bail!("unknown report format '{}', expected json or markdown", value),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "gpu-broker-reports", rename_all = "kebab")]
struct Options {
    /// Path to the broker's sled database.
    #[structopt(long, env = "DATABASE_PATH", default_value = "broker.db", parse(from_os_str))]
    database_path: PathBuf,

    #[structopt(long, default_value = "markdown")]
    format: ReportFormat,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Sums accrued cost over a time range, optionally filtered by
    /// consumer, provider or GPU type.
    Cost {
        #[structopt(long, parse(try_from_str = parse_rfc3339))]
        from: DateTime<Utc>,
        #[structopt(long, parse(try_from_str = parse_rfc3339))]
        to: DateTime<Utc>,
        #[structopt(long)]
        consumer_id: Option<String>,
        #[structopt(long)]
        provider: Option<String>,
        #[structopt(long)]
        gpu_type: Option<String>,
    },
    /// Reports a benchmark run's status and per-entry results.
    Benchmark {
        run_id: String,
    },
}

fn parse_rfc3339(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn main() -> anyhow::Result<()> {
    let options = Options::from_args();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(options))
}

async fn run(options: Options) -> anyhow::Result<()> {
    let db = sled::Config::new()
        .path(&options.database_path)
        .open()
        .map_err(|err| anyhow::anyhow!("failed to open database at {:?}: {}", options.database_path, err))?;

    match options.command {
        Command::Cost {
            from,
            to,
            consumer_id,
            provider,
            gpu_type,
        } => {
            let costs = SledCostStore::new(&db)?;
            let total = rollup(
                &costs,
                from,
                to,
                consumer_id.as_deref(),
                provider.as_deref(),
                gpu_type.as_deref(),
            )
            .await?;
            let report = render::CostReport {
                from,
                to,
                consumer_id,
                provider,
                gpu_type,
                total,
            };
            print!("{}", render::render_cost(&report, options.format)?);
        }
        Command::Benchmark { run_id } => {
            let runs = SledRunStore::new(&db)?;
            let manifests = SledManifestStore::new(&db)?;
            let run = runs
                .get(&run_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such benchmark run: {}", run_id))?;
            let entries = manifests.list_by_run(&run_id).await?;
            print!("{}", render::render_benchmark(&run, &entries, options.format)?);
        }
    }

    Ok(())
}
