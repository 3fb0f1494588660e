use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use buildmon_shared::logging::{self, LogLevel};
use buildmon_shared::{Config, MemoryPolicy, MonitorConfig};
use buildmon_supervisor::{
    drive_build, prepare_log_path, resolve_interval, resolve_sampler_path, BuildMode,
    ProcessLauncher, Supervisor,
};

/// サマリーの書き出しを待つ上限
const SAMPLER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "buildmon")]
#[command(version)]
#[command(about = "Run a build command and record its CPU and memory usage")]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Watch mode - keep sampling across rebuilds until the command exits
    #[arg(long)]
    watch: bool,

    /// Sampling interval in milliseconds
    #[arg(long, value_name = "MS")]
    interval: Option<u64>,

    /// Time-series log file (default: <log_dir>/<prefix>_<timestamp>.log)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Memory figure to record: "private" (anonymous pages + swap) or "total" (resident set)
    #[arg(long, value_name = "POLICY")]
    memory_policy: Option<MemoryPolicy>,

    /// Path to the buildmon-sampler executable
    #[arg(long, value_name = "PATH")]
    sampler: Option<PathBuf>,

    /// Config file path (default: auto-detect .buildmon/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print a sample config file and exit
    #[arg(long)]
    print_sample_config: bool,

    /// Build command and arguments (e.g. 'npm run build')
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_sample_config {
        print!("{}", Config::sample().to_toml_string()?);
        return Ok(());
    }

    let config = load_config(&cli)?;
    setup_logging(&cli, &config);

    let Some((program, args)) = cli.command.split_first() else {
        bail!("No build command given (usage: buildmon [OPTIONS] -- <command>...)");
    };

    let interval = resolve_interval(cli.interval, &config)?;
    let current_dir = std::env::current_dir().context("Failed to get current directory")?;
    let log_path = prepare_log_path(
        cli.log_file.as_deref(),
        &config,
        &current_dir,
        chrono::Utc::now(),
    )?;
    let memory_policy = cli.memory_policy.unwrap_or(config.sampler.memory_policy);
    let sampler_path = resolve_sampler_path(
        cli.sampler
            .as_deref()
            .or(config.sampler.sampler_path.as_deref()),
    );
    let mode = if cli.watch {
        BuildMode::Watch
    } else {
        BuildMode::Build
    };

    let mut build = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("Failed to start build command: {program}"))?;
    let build_pid = build
        .id()
        .context("Build process exited before it could be monitored")?;

    let monitor_config =
        MonitorConfig::new(build_pid, interval, log_path).with_memory_policy(memory_policy);
    let mut supervisor =
        Supervisor::new(ProcessLauncher::new(sampler_path), monitor_config).with_mode(mode);

    match mode {
        BuildMode::Watch => supervisor.on_watch_start(),
        BuildMode::Build => supervisor.on_build_start(),
    }

    let exit_code = drive_build(&mut build, &mut supervisor).await;

    supervisor.on_process_exit();
    supervisor.launcher().wait_for_exit(SAMPLER_EXIT_TIMEOUT).await;
    drop(supervisor);

    std::process::exit(exit_code);
}

/// 設定ファイル → 環境変数の順で読み込む（CLI 引数は呼び出し側で上書き）
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_auto()?.map(|(config, _)| config).unwrap_or_default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn setup_logging(cli: &Cli, config: &Config) {
    if let Some(level) = &config.logging.level {
        logging::set_log_level(LogLevel::from(level.as_str()));
    }
    logging::init_from_env();
    if cli.verbose || config.logging.verbose {
        logging::set_log_level(LogLevel::Debug);
    }
}
