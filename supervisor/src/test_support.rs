// ユニットテスト用のランチャー

use anyhow::{bail, Result};
use buildmon_shared::MonitorConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::launcher::{SamplerHandle, SamplerLauncher};
use crate::supervisor::Supervisor;

/// 起動・停止の回数を数えるだけのランチャー
#[derive(Default, Clone)]
pub struct FakeLauncher {
    launches: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    last_running: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    fail: bool,
}

struct FakeHandle {
    running: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
}

impl SamplerHandle for FakeHandle {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&mut self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl SamplerLauncher for FakeLauncher {
    fn launch(&self, _config: &MonitorConfig) -> Result<Box<dyn SamplerHandle>> {
        if self.fail {
            bail!("sampler binary not found");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let running = Arc::new(AtomicBool::new(true));
        *self.last_running.lock().unwrap() = Some(running.clone());
        Ok(Box::new(FakeHandle {
            running,
            stops: self.stops.clone(),
        }))
    }
}

impl FakeLauncher {
    /// 常に起動に失敗するランチャー
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// サンプラーが自発的に終了したことにする
    pub fn simulate_exit(&self) {
        if let Some(running) = self.last_running.lock().unwrap().as_ref() {
            running.store(false, Ordering::SeqCst);
        }
    }

    /// このランチャーを使う、自プロセス監視の supervisor
    pub fn supervisor(&self) -> Supervisor<FakeLauncher> {
        Supervisor::for_current_process(self.clone(), Duration::from_millis(1000), "/tmp/build.log")
    }
}
