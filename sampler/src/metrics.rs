use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use buildmon_shared::{log_metrics, MemoryPolicy};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::memory::{parse_memory_string, ProcStatusMemory};

/// 1 回の読み取り結果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// 対象プロセスが存在しない（終了済み）
///
/// 一時的な読み取り失敗とは区別し、サンプラーはこれを受けて計測を終える。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetExited {
    pub pid: u32,
}

impl fmt::Display for TargetExited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process {} not found", self.pid)
    }
}

impl std::error::Error for TargetExited {}

/// プロセスの CPU・メモリを読み取るプラットフォーム別の実装
#[async_trait]
pub trait MetricsSource: Send {
    /// 実装名（ログ用）
    fn name(&self) -> &'static str;

    /// 前回の読み取りからの CPU 使用率と現在のメモリ使用量を取得
    async fn read(&mut self, pid: u32) -> Result<Reading>;
}

/// 実行中のプラットフォームに合ったソースを選択
pub fn default_source(policy: MemoryPolicy) -> Box<dyn MetricsSource> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Box::new(SysinfoSource::new(policy))
    } else {
        Box::new(NoopSource::new())
    }
}

/// sysinfo によるプロセス単位の読み取り
///
/// CPU と常駐メモリ（`Total`）は sysinfo から取る。`Private` は sysinfo に
/// 無いので、Linux では /proc/<pid>/status、macOS では top から読む。
/// それ以外の OS では常駐メモリで代用する。
pub struct SysinfoSource {
    system: System,
    policy: MemoryPolicy,
    proc_root: PathBuf,
    primed: bool,
}

impl SysinfoSource {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self::with_proc_root(policy, "/proc")
    }

    /// 任意の proc ルートを指定（テスト用）
    pub fn with_proc_root(policy: MemoryPolicy, proc_root: impl Into<PathBuf>) -> Self {
        if policy == MemoryPolicy::Private && !private_memory_supported() {
            log_metrics!(
                warn,
                "Private memory is not available on {}; recording resident memory",
                std::env::consts::OS
            );
        }

        Self {
            system: System::new(),
            policy,
            proc_root: proc_root.into(),
            primed: false,
        }
    }

    fn refresh(&mut self, pid: Pid) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
    }

    async fn private_memory_mb(&self, pid: u32, resident_mb: f64) -> Result<f64> {
        if cfg!(target_os = "linux") {
            read_proc_status_memory(&self.proc_root, pid).await
        } else if cfg!(target_os = "macos") {
            let output = run_command("top", &["-l", "1", "-stats", "pid,command,mem"]).await?;
            parse_top_memory(&output, pid)
        } else {
            Ok(resident_mb)
        }
    }
}

fn private_memory_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos"))
}

#[async_trait]
impl MetricsSource for SysinfoSource {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    async fn read(&mut self, pid: u32) -> Result<Reading> {
        let sys_pid = Pid::from_u32(pid);
        self.refresh(sys_pid);

        if !self.primed {
            // CPU 使用率は 2 回の更新の差分からしか求まらない
            self.primed = true;
            tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
            self.refresh(sys_pid);
        }

        let (cpu_percent, resident_mb) = {
            let process = self.system.process(sys_pid).ok_or(TargetExited { pid })?;
            (
                f64::from(process.cpu_usage()),
                process.memory() as f64 / (1024.0 * 1024.0),
            )
        };

        let memory_mb = match self.policy {
            MemoryPolicy::Total => resident_mb,
            MemoryPolicy::Private => self.private_memory_mb(pid, resident_mb).await?,
        };

        Ok(Reading {
            cpu_percent,
            memory_mb,
        })
    }
}

/// /proc/<pid>/status から実メモリ（MB）を読む
pub async fn read_proc_status_memory(proc_root: &Path, pid: u32) -> Result<f64> {
    let status_path = proc_root.join(pid.to_string()).join("status");
    match tokio::fs::read_to_string(&status_path).await {
        Ok(content) => Ok(ProcStatusMemory::parse(&content).private_mb()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TargetExited { pid }.into()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", status_path.display())),
    }
}

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {program}"))?;
    if !output.status.success() {
        bail!("{program} exited with status: {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `top -l 1 -stats pid,command,mem` の出力から対象 PID の MEM 列を取得
pub fn parse_top_memory(output: &str, pid: u32) -> Result<f64> {
    let pid_str = pid.to_string();
    let line = output
        .lines()
        .find(|line| line.split_whitespace().next() == Some(pid_str.as_str()))
        .ok_or(TargetExited { pid })?;

    // command に空白が含まれることがあるので MEM は最後の列から取る
    let mem = line
        .split_whitespace()
        .last()
        .context("Malformed top output")?;
    Ok(parse_memory_string(mem))
}

/// 未対応プラットフォーム用。常にゼロを返す
pub struct NoopSource {
    warned: bool,
}

impl NoopSource {
    pub fn new() -> Self {
        Self { warned: false }
    }
}

impl Default for NoopSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSource for NoopSource {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn read(&mut self, _pid: u32) -> Result<Reading> {
        if !self.warned {
            self.warned = true;
            log_metrics!(
                warn,
                "Process metrics are not supported on {}; recording zeros",
                std::env::consts::OS
            );
        }
        Ok(Reading::default())
    }
}
