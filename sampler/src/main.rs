use anyhow::Result;
use clap::Parser;

use buildmon_sampler::{default_source, Sampler};
use buildmon_shared::{log_sampler, logging, MonitorConfig};

/// 設定は LOG_FILE / INTERVAL / MEMORY_POLICY 環境変数から読む
#[derive(Parser)]
#[command(name = "buildmon-sampler")]
#[command(about = "Sample CPU and memory usage of a process until stopped")]
struct Cli {
    /// 監視対象のプロセスID
    pid: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init_from_env();
    let cli = Cli::parse();

    let config = MonitorConfig::from_env(Some(&cli.pid))?;
    let source = default_source(config.memory_policy);
    let sampler = Sampler::start(config, source)?;

    // SIGINT / SIGTERM のどちらでも集計を書き出してから終了
    #[cfg(unix)]
    let shutdown = {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        async move {
            tokio::select! {
                _ = sigint.recv() => {
                    log_sampler!(debug, "Received SIGINT");
                }
                _ = sigterm.recv() => {
                    log_sampler!(debug, "Received SIGTERM");
                }
            }
        }
    };

    #[cfg(not(unix))]
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    sampler.run(shutdown).await?;
    Ok(())
}
