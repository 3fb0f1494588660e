use anyhow::{Context, Result};
use buildmon_shared::{
    log_metrics, log_sampler, summary_path, MonitorConfig, LOG_HEADER, SUMMARY_HEADER,
};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregate::{AggregateStats, Sample};
use crate::metrics::{MetricsSource, Reading, TargetExited};

/// サンプラーの状態
///
/// 起動前（Idle）は `Sampler` がまだ存在しない状態として表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Running,
    Finalizing,
    Terminated,
}

/// 追記専用の時系列ログ
struct SampleLog {
    path: PathBuf,
    file: File,
}

impl SampleLog {
    /// ログを作成（既存なら切り詰め）してヘッダーを書く
    fn create(path: &Path) -> Result<Self> {
        let mut file = File::create(path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        writeln!(file, "{LOG_HEADER}")
            .with_context(|| format!("Failed to write log header: {}", path.display()))?;

        // 以降は追記のみ
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append(&mut self, sample: &Sample) -> Result<()> {
        writeln!(self.file, "{}", sample.to_csv_row())
            .with_context(|| format!("Failed to append to log file: {}", self.path.display()))
    }
}

/// 対象プロセスを定期的に計測し、ログとサマリーを書き出す
pub struct Sampler {
    config: MonitorConfig,
    source: Box<dyn MetricsSource>,
    log: SampleLog,
    stats: AggregateStats,
    elapsed_ticks: u64,
    started_at: Instant,
    state: SamplerState,
}

impl Sampler {
    /// ログファイルを開いて Running に遷移
    ///
    /// ログを作成できない場合はエラーを返し、Running には入らない。
    pub fn start(config: MonitorConfig, source: Box<dyn MetricsSource>) -> Result<Self> {
        let log = SampleLog::create(&config.log_path)?;

        log_sampler!(
            info,
            "Monitoring PID {} every {} ms (memory={}, source={}) -> {}",
            config.target_pid,
            config.interval.as_millis(),
            config.memory_policy,
            source.name(),
            config.log_path.display()
        );

        Ok(Self {
            config,
            source,
            log,
            stats: AggregateStats::new(),
            elapsed_ticks: 0,
            started_at: Instant::now(),
            state: SamplerState::Running,
        })
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn stats(&self) -> &AggregateStats {
        &self.stats
    }

    /// 1 tick 分の計測・記録・集計
    ///
    /// 読み取りに失敗してもゼロとして記録し、サンプリングは止めない。
    /// 対象プロセスが終了していた場合は何も記録せず None を返す。
    pub async fn tick(&mut self) -> Option<Sample> {
        let reading = match self.source.read(self.config.target_pid).await {
            Ok(reading) => reading,
            Err(e) if e.downcast_ref::<TargetExited>().is_some() => {
                log_sampler!(
                    info,
                    "Target process {} exited, stopping sampler",
                    self.config.target_pid
                );
                return None;
            }
            Err(e) => {
                log_metrics!(
                    warn,
                    "Fetching metrics for PID {} failed: {e:#}",
                    self.config.target_pid
                );
                Reading::default()
            }
        };

        self.elapsed_ticks += 1;
        let sample = Sample::new(self.elapsed_ticks, reading.cpu_percent, reading.memory_mb);

        if let Err(e) = self.log.append(&sample) {
            log_sampler!(error, "{e:#}");
        }
        self.stats.record(&sample);

        Some(sample)
    }

    /// 集計を書き出して終了する（何度呼ばれても実行は一度だけ）
    ///
    /// 書き出したサマリーのパスを返す。二度目以降やサンプル 0 件の場合は None。
    pub fn finalize(&mut self) -> Result<Option<PathBuf>> {
        if matches!(
            self.state,
            SamplerState::Finalizing | SamplerState::Terminated
        ) {
            return Ok(None);
        }
        self.state = SamplerState::Finalizing;

        let result = self.write_summary();
        self.state = SamplerState::Terminated;
        result
    }

    fn write_summary(&self) -> Result<Option<PathBuf>> {
        let Some(summary) = self.stats.summarize(self.started_at.elapsed()) else {
            log_sampler!(info, "No data collected, skipping final stats.");
            return Ok(None);
        };

        let path = summary_path(&self.config.log_path);
        let content = format!("{SUMMARY_HEADER}\n{}\n", summary.to_csv_row());
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write summary file: {}", path.display()))?;

        log_sampler!(
            info,
            "Wrote summary of {} samples to {}",
            self.stats.sample_count,
            path.display()
        );
        Ok(Some(path))
    }

    /// 停止要求が来るか対象プロセスが終了するまで tick を回し、最後に finalize する
    ///
    /// 最初の tick は開始から 1 interval 後。計測が interval より長引いた場合は
    /// tick を重ねずに後ろへずらす。
    pub async fn run<F>(mut self, shutdown: F) -> Result<Option<PathBuf>>
    where
        F: Future<Output = ()>,
    {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(self.started_at + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    log_sampler!(debug, "Stop requested after {} ticks", self.elapsed_ticks);
                    break;
                }
                _ = ticker.tick() => {
                    if self.tick().await.is_none() {
                        break;
                    }
                }
            }
        }

        self.finalize()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log_sampler!(error, "{e:#}");
        }
    }
}
