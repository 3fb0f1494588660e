// テスト用の計測ソース
// Note: 各統合テストは独立してコンパイルされるため、未使用の関数で dead_code 警告が出る

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use buildmon_sampler::{MetricsSource, Reading};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// 決められた (cpu, mem) を順に返し、読み取りごとに回数を通知するソース
pub struct ScriptedSource {
    readings: VecDeque<Result<Reading>>,
    reads: usize,
    notify: Option<mpsc::UnboundedSender<usize>>,
}

impl ScriptedSource {
    pub fn new(readings: Vec<Result<Reading>>) -> Self {
        Self {
            readings: readings.into(),
            reads: 0,
            notify: None,
        }
    }

    pub fn from_pairs(pairs: &[(f64, f64)]) -> Self {
        Self::new(pairs.iter().map(|&(cpu, mem)| Ok(reading(cpu, mem))).collect())
    }

    /// 読み取り回数を受け取るチャネルを返す
    pub fn with_notifier(mut self) -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notify = Some(tx);
        (self, rx)
    }
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn read(&mut self, _pid: u32) -> Result<Reading> {
        self.reads += 1;
        let result = self
            .readings
            .pop_front()
            .unwrap_or_else(|| Ok(Reading::default()));
        if let Some(notify) = &self.notify {
            let _ = notify.send(self.reads);
        }
        result
    }
}

pub fn reading(cpu_percent: f64, memory_mb: f64) -> Reading {
    Reading {
        cpu_percent,
        memory_mb,
    }
}

/// ログのデータ行（ヘッダーを除く）
pub fn data_rows(content: &str) -> Vec<String> {
    content.lines().skip(1).map(str::to_string).collect()
}
