use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sortiment_sync::pipeline::output_paths;
use sortiment_sync::{RunConfig, Strategy, SyncPipeline};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sortiment-sync")]
#[command(about = "ソーティメントレポートを取得して出力CSVへ変換する", long_about = None)]
struct Cli {
    /// 設定ファイル (JSON)
    #[arg(long, env = "SORTIMENT_SYNC_CONFIG", default_value = "/data/config.json")]
    config: PathBuf,

    /// 設定ファイルの strategy を上書き
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// 設定ファイルの data_dir を上書き
    #[arg(long, env = "SORTIMENT_SYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match RunConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = ?cli.config, error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(path = ?cli.config, accounts = config.accounts.len(), "Extracted parameters");

    if let Some(strategy) = cli.strategy {
        config = config.with_strategy(strategy);
    }
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    let pipeline = SyncPipeline::new(config);
    let report = pipeline.run().await;

    for path in output_paths(&report) {
        info!(path = ?path, "Output written");
    }

    if report.has_failures() {
        for failure in report.failures() {
            if let Err(e) = &failure.result {
                error!(account = %failure.account, error = %e, "Account failed");
            }
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
