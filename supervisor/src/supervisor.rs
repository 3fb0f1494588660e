use buildmon_shared::{log_supervisor, MonitorConfig};
use std::fmt::Display;
use std::time::Duration;

use crate::launcher::{SamplerHandle, SamplerLauncher};

/// ビルドの実行モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// 1 回きりのビルド
    #[default]
    Build,
    /// 変更監視による再ビルドの繰り返し
    Watch,
}

/// ビルドのライフサイクルイベントに合わせてサンプラーを起動・停止する
///
/// サンプラーは常に高々 1 つ。起動中の start と停止中の stop は何もしない。
pub struct Supervisor<L: SamplerLauncher> {
    launcher: L,
    config: MonitorConfig,
    mode: BuildMode,
    watch_started: bool,
    sampler: Option<Box<dyn SamplerHandle>>,
}

impl<L: SamplerLauncher> Supervisor<L> {
    pub fn new(launcher: L, config: MonitorConfig) -> Self {
        Self {
            launcher,
            config,
            mode: BuildMode::default(),
            watch_started: false,
            sampler: None,
        }
    }

    /// 自分自身のプロセスを監視対象にする（ビルドツールに組み込む場合）
    pub fn for_current_process(
        launcher: L,
        interval: Duration,
        log_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self::new(
            launcher,
            MonitorConfig::new(std::process::id(), interval, log_path),
        )
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// サンプラーが動作中か
    pub fn is_monitoring(&self) -> bool {
        self.sampler
            .as_ref()
            .is_some_and(|sampler| sampler.is_running())
    }

    /// ビルド開始
    pub fn on_build_start(&mut self) {
        log_supervisor!(
            info,
            "Build started... Logging to {}",
            self.config.log_path.display()
        );
        self.start_sampler();
    }

    /// watch 開始（再ビルドのたびに呼ばれても起動は最初の 1 回だけ）
    pub fn on_watch_start(&mut self) {
        self.mode = BuildMode::Watch;
        if self.watch_started {
            return;
        }
        self.watch_started = true;

        log_supervisor!(
            info,
            "Watching for changes... Logging to {}",
            self.config.log_path.display()
        );
        self.start_sampler();
    }

    /// ビルド完了（watch モードでは再ビルドをまたいで計測を続ける）
    pub fn on_build_done(&mut self) {
        if self.mode == BuildMode::Watch {
            log_supervisor!(debug, "Build finished in watch mode, monitor keeps running");
            return;
        }

        log_supervisor!(info, "Build finished, stopping monitor.");
        self.stop_sampler();
    }

    /// ビルド失敗（モードに関係なく停止）
    pub fn on_build_failed(&mut self, error: &dyn Display) {
        log_supervisor!(error, "Build failed! {error}");
        self.stop_sampler();
    }

    /// 割り込み（SIGINT など）
    pub fn on_process_interrupt(&mut self) {
        log_supervisor!(info, "Build process interrupted.");
        self.stop_sampler();
    }

    /// プロセス終了
    pub fn on_process_exit(&mut self) {
        self.stop_sampler();
    }

    fn start_sampler(&mut self) {
        if self.is_monitoring() {
            return;
        }

        match self.launcher.launch(&self.config) {
            Ok(handle) => self.sampler = Some(handle),
            Err(e) => {
                // 監視の失敗でビルドを止めない
                log_supervisor!(error, "Failed to start monitor: {e:#}");
            }
        }
    }

    fn stop_sampler(&mut self) {
        let Some(mut sampler) = self.sampler.take() else {
            return;
        };
        if let Err(e) = sampler.stop() {
            log_supervisor!(warn, "Failed to stop monitor: {e:#}");
        }
    }
}

impl<L: SamplerLauncher> Drop for Supervisor<L> {
    fn drop(&mut self) {
        self.on_process_exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeLauncher;

    fn supervisor(launcher: &FakeLauncher) -> Supervisor<FakeLauncher> {
        launcher.supervisor()
    }

    #[test]
    fn test_targets_current_process() {
        let launcher = FakeLauncher::default();
        let supervisor = supervisor(&launcher);
        assert_eq!(supervisor.config().target_pid, std::process::id());
        assert_eq!(supervisor.mode(), BuildMode::Build);
    }

    #[test]
    fn test_build_start_is_idempotent() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher);

        supervisor.on_build_start();
        supervisor.on_build_start();

        assert!(supervisor.is_monitoring());
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn test_build_done_stops_sampler() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher);

        supervisor.on_build_start();
        supervisor.on_build_done();

        assert!(!supervisor.is_monitoring());
        assert_eq!(launcher.stops(), 1);

        // 停止中の停止は何もしない
        supervisor.on_build_done();
        supervisor.on_process_exit();
        assert_eq!(launcher.stops(), 1);
    }

    #[test]
    fn test_watch_start_only_once() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher);

        supervisor.on_watch_start();
        for _ in 0..5 {
            supervisor.on_watch_start();
            supervisor.on_build_done();
        }

        assert_eq!(supervisor.mode(), BuildMode::Watch);
        assert!(supervisor.is_monitoring());
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.stops(), 0);
    }

    #[test]
    fn test_watch_flag_survives_sampler_exit() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher);

        supervisor.on_watch_start();
        launcher.simulate_exit();
        supervisor.on_watch_start();

        // 2 回目以降の watch 開始では再起動しない
        assert!(!supervisor.is_monitoring());
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn test_build_failure_stops_even_in_watch_mode() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher).with_mode(BuildMode::Watch);

        supervisor.on_watch_start();
        supervisor.on_build_failed(&"Module not found: ./missing");

        assert!(!supervisor.is_monitoring());
        assert_eq!(launcher.stops(), 1);
    }

    #[test]
    fn test_interrupt_and_exit_always_stop() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher).with_mode(BuildMode::Watch);

        supervisor.on_watch_start();
        supervisor.on_process_interrupt();
        assert_eq!(launcher.stops(), 1);

        supervisor.on_build_start();
        supervisor.on_process_exit();
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.stops(), 2);
    }

    #[test]
    fn test_restart_after_sampler_exits_on_its_own() {
        let launcher = FakeLauncher::default();
        let mut supervisor = supervisor(&launcher);

        supervisor.on_build_start();
        launcher.simulate_exit();
        assert!(!supervisor.is_monitoring());

        supervisor.on_build_start();
        assert!(supervisor.is_monitoring());
        assert_eq!(launcher.launches(), 2);
    }

    #[test]
    fn test_launch_failure_is_not_fatal() {
        let launcher = FakeLauncher::failing();
        let mut supervisor = supervisor(&launcher);

        supervisor.on_build_start();
        assert!(!supervisor.is_monitoring());

        supervisor.on_build_done();
        assert_eq!(launcher.stops(), 0);
    }

    #[test]
    fn test_drop_stops_sampler() {
        let launcher = FakeLauncher::default();
        {
            let mut supervisor = supervisor(&launcher);
            supervisor.on_build_start();
        }
        assert_eq!(launcher.stops(), 1);
    }
}
