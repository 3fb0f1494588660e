use std::time::Duration;

/// 1 tick 分の計測値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// tick のカウンタ（壁時計ではない）
    pub elapsed_seconds: u64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl Sample {
    /// CPU は小数 2 桁に丸める。負値や NaN は 0 として扱う
    pub fn new(elapsed_seconds: u64, cpu_percent: f64, memory_mb: f64) -> Self {
        Self {
            elapsed_seconds,
            cpu_percent: round2(sanitize(cpu_percent)),
            memory_mb: sanitize(memory_mb),
        }
    }

    /// ログの 1 行（`elapsed,cpu,mem`）
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{:.2}",
            self.elapsed_seconds, self.cpu_percent, self.memory_mb
        )
    }
}

/// 全 tick にわたる累積統計
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateStats {
    pub sample_count: u64,
    pub cpu_sum: f64,
    pub mem_sum: f64,
    pub cpu_max: f64,
    pub mem_max: f64,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: &Sample) {
        self.sample_count += 1;
        self.cpu_sum += sample.cpu_percent;
        self.mem_sum += sample.memory_mb;
        if sample.cpu_percent > self.cpu_max {
            self.cpu_max = sample.cpu_percent;
        }
        if sample.memory_mb > self.mem_max {
            self.mem_max = sample.memory_mb;
        }
    }

    /// サマリーに縮約。サンプルが 1 件もなければ None
    pub fn summarize(&self, total_time: Duration) -> Option<Summary> {
        if self.sample_count == 0 {
            return None;
        }

        let count = self.sample_count as f64;
        Some(Summary {
            total_seconds: total_time.as_secs_f64(),
            avg_cpu: self.cpu_sum / count,
            avg_mem: self.mem_sum / count,
            max_cpu: self.cpu_max,
            max_mem: self.mem_max,
        })
    }
}

/// 終了時に一度だけ書き出す集計結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub total_seconds: f64,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub max_cpu: f64,
    pub max_mem: f64,
}

impl Summary {
    /// 時間と平均は小数 2 桁、最大値は記録されたまま
    pub fn to_csv_row(&self) -> String {
        format!(
            "{:.2},{:.2},{:.2},{},{}",
            self.total_seconds, self.avg_cpu, self.avg_mem, self.max_cpu, self.max_mem
        )
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
