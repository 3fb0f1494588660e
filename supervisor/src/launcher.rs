use anyhow::{Context, Result};
use buildmon_shared::logging::{get_log_level, log_message, LogCategory, LogLevel, LOG_LEVEL_ENV};
use buildmon_shared::{log_debug, log_error, log_warn, MonitorConfig};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// サンプラー実行ファイル名
pub const SAMPLER_BIN: &str = "buildmon-sampler";

/// 起動済みサンプラーへのハンドル
pub trait SamplerHandle: Send {
    /// サンプラーがまだ動いているか（自発的に終了した場合は false）
    fn is_running(&self) -> bool;

    /// 停止を要求してハンドルを手放す。停止済みなら何もしない
    fn stop(&mut self) -> Result<()>;
}

/// サンプラーを起動する手段
pub trait SamplerLauncher {
    fn launch(&self, config: &MonitorConfig) -> Result<Box<dyn SamplerHandle>>;
}

/// サンプラーを別プロセスとして起動するランチャー
pub struct ProcessLauncher {
    program: PathBuf,
    watchers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 起動したサンプラーがすべて終了するまで待つ（最大 timeout）
    ///
    /// サマリーの書き出しを待ってから supervisor を終了させるために使う。
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let watchers: Vec<JoinHandle<()>> = match self.watchers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_exited = true;
        for watcher in watchers {
            if tokio::time::timeout_at(deadline, watcher).await.is_err() {
                all_exited = false;
            }
        }

        if !all_exited {
            log_warn!(
                LogCategory::Supervisor,
                "Sampler did not exit within {} ms",
                timeout.as_millis()
            );
        }
        all_exited
    }
}

impl SamplerLauncher for ProcessLauncher {
    fn launch(&self, config: &MonitorConfig) -> Result<Box<dyn SamplerHandle>> {
        let mut child = Command::new(&self.program)
            .arg(config.target_pid.to_string())
            .envs(config.to_env())
            .env(LOG_LEVEL_ENV, get_log_level().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn sampler: {}", self.program.display()))?;

        let pid = child.id();
        log_debug!(
            LogCategory::Supervisor,
            "Sampler started (pid {:?}) for PID {}",
            pid,
            config.target_pid
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, |_| LogLevel::Info));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, stderr_line_level));
        }

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_child(child, stop_rx, running.clone()));

        match self.watchers.lock() {
            Ok(mut guard) => guard.push(watcher),
            Err(poisoned) => poisoned.into_inner().push(watcher),
        }

        Ok(Box::new(ProcessSamplerHandle {
            running,
            stop_tx: Some(stop_tx),
        }))
    }
}

/// 別プロセスのサンプラーへのハンドル
pub struct ProcessSamplerHandle {
    running: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl SamplerHandle for ProcessSamplerHandle {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // watcher が先に終わっていれば受信側はもうない
            let _ = stop_tx.send(());
        }
        Ok(())
    }
}

impl Drop for ProcessSamplerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// 子プロセスの終了を監視し、停止要求が来たら終了シグナルを送る
async fn watch_child(mut child: Child, stop_rx: oneshot::Receiver<()>, running: Arc<AtomicBool>) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = stop_rx => {
            if request.is_ok() {
                if let Err(e) = terminate(&mut child) {
                    log_warn!(LogCategory::Supervisor, "Failed to stop sampler: {e:#}");
                }
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() => {
            log_debug!(LogCategory::Supervisor, "Sampler exited");
        }
        Ok(status) => {
            log_error!(LogCategory::Supervisor, "Sampler exited with {status}");
        }
        Err(e) => {
            log_error!(LogCategory::Supervisor, "Failed to wait for sampler: {e}");
        }
    }
    running.store(false, Ordering::SeqCst);
}

/// 子プロセスに終了を要求（unix では SIGTERM、それ以外は強制終了）
pub fn terminate(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return Ok(()); // 既に終了している
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .with_context(|| format!("Failed to send SIGTERM to {pid}"))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        child.start_kill().context("Failed to kill child process")
    }
}

/// サンプラーの stderr 1 行のログレベル
///
/// サンプラー自身のログ（`[時刻] [LEVEL] [カテゴリ] ...`）はそのレベルのまま、
/// それ以外（起動失敗時のエラーチェーンなど）は Error として扱う。
pub fn stderr_line_level(line: &str) -> LogLevel {
    match line.split("] [").nth(1) {
        Some("WARN") => LogLevel::Warn,
        Some("INFO") => LogLevel::Info,
        Some("DEBUG") => LogLevel::Debug,
        _ => LogLevel::Error,
    }
}

/// 子プロセスの出力を 1 行ずつログに転送
async fn forward_lines<R, F>(stream: R, level_of: F)
where
    R: AsyncRead + Unpin,
    F: Fn(&str) -> LogLevel,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    log_message(level_of(line), LogCategory::Child, line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log_debug!(LogCategory::Child, "Stopped forwarding sampler output: {e}");
                break;
            }
        }
    }
}

/// サンプラー実行ファイルの場所を決める
///
/// 明示指定 → supervisor と同じディレクトリ → PATH の順。
pub fn resolve_sampler_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    let file_name = format!("{SAMPLER_BIN}{}", std::env::consts::EXE_SUFFIX);
    if let Some(sibling) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
    {
        if sibling.exists() {
            return sibling;
        }
    }

    PathBuf::from(file_name)
}
