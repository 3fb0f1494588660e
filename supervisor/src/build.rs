use anyhow::{bail, Context, Result};
use buildmon_shared::{log_supervisor, Config};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

use crate::launcher::{terminate, SamplerLauncher};
use crate::supervisor::Supervisor;

/// SIGINT（Ctrl-C）で中断したときの終了コード
pub const EXIT_INTERRUPTED: i32 = 130;
/// SIGTERM で中断したときの終了コード
pub const EXIT_TERMINATED: i32 = 143;

/// サンプリング間隔を決める（CLI 指定 → 設定ファイル）
pub fn resolve_interval(cli_ms: Option<u64>, config: &Config) -> Result<Duration> {
    match cli_ms {
        Some(0) => bail!("--interval must be a positive number of milliseconds"),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => config.interval(),
    }
}

/// ログファイルの絶対パスを決め、置き場所のディレクトリを作る
///
/// 相対パスは base_dir（通常はカレントディレクトリ）を起点に解決する。
/// サンプラーは作業ディレクトリに依存せずにこのパスを開ける。
pub fn prepare_log_path(
    explicit: Option<&Path>,
    config: &Config,
    base_dir: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let path = match explicit {
        Some(path) => base_dir.join(path),
        None => config.log_path_at(base_dir, now),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create log directory: {}", parent.display())
        })?;
    }
    Ok(path)
}

/// ビルドプロセスの終了やシグナルをライフサイクルイベントに変換し、終了コードを返す
pub async fn drive_build<L: SamplerLauncher>(
    build: &mut Child,
    supervisor: &mut Supervisor<L>,
) -> i32 {
    #[cfg(unix)]
    let (mut sigint, mut sigterm) = {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                log_supervisor!(warn, "Failed to install signal handlers: {e}");
                let status = build.wait().await;
                return finish_build(status, supervisor);
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            status = build.wait() => finish_build(status, supervisor),
            _ = sigint.recv() => interrupt_build(build, supervisor, EXIT_INTERRUPTED).await,
            _ = sigterm.recv() => interrupt_build(build, supervisor, EXIT_TERMINATED).await,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            status = build.wait() => finish_build(status, supervisor),
            _ = tokio::signal::ctrl_c() => {
                interrupt_build(build, supervisor, EXIT_INTERRUPTED).await
            }
        }
    }
}

/// ビルドの終了状態を done / failed に振り分け、終了コードを返す
///
/// シグナルで終了した場合など終了コードが無ければ 1。
pub fn finish_build<L: SamplerLauncher>(
    status: io::Result<ExitStatus>,
    supervisor: &mut Supervisor<L>,
) -> i32 {
    match status {
        Ok(status) if status.success() => {
            supervisor.on_build_done();
            0
        }
        Ok(status) => {
            supervisor.on_build_failed(&format!("build command exited with {status}"));
            status.code().unwrap_or(1)
        }
        Err(e) => {
            supervisor.on_build_failed(&format!("failed to wait for build command: {e}"));
            1
        }
    }
}

/// 割り込みを受けたビルドを止め、指定の終了コードを返す
pub async fn interrupt_build<L: SamplerLauncher>(
    build: &mut Child,
    supervisor: &mut Supervisor<L>,
    exit_code: i32,
) -> i32 {
    supervisor.on_process_interrupt();

    // 端末からの Ctrl-C ならビルドにも届いているが、単独で送られた場合に備えて転送する
    if let Err(e) = terminate(build) {
        log_supervisor!(debug, "Failed to forward termination to build: {e:#}");
    }
    let _ = build.wait().await;
    exit_code
}
