use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

/// ログレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" | "trace" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

/// ログカテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    /// サンプラー本体（tick・集計・終了処理）
    Sampler,
    /// ビルドライフサイクル側
    Supervisor,
    /// OS からのメトリクス読み取り
    Metrics,
    /// 子プロセス（サンプラー）の出力転送
    Child,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCategory::Sampler => write!(f, "SAMPLER"),
            LogCategory::Supervisor => write!(f, "SUPERVISOR"),
            LogCategory::Metrics => write!(f, "METRICS"),
            LogCategory::Child => write!(f, "CHILD"),
        }
    }
}

/// ログレベルを指定する環境変数
pub const LOG_LEVEL_ENV: &str = "BUILDMON_LOG_LEVEL";

/// グローバルログレベル
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// ログメッセージの出力先
static LOG_OUTPUT: OnceLock<Box<dyn Fn(&str) + Send + Sync>> = OnceLock::new();

/// ログレベルを設定
pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// 現在のログレベルを取得
pub fn get_log_level() -> LogLevel {
    match GLOBAL_LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

/// 環境変数 BUILDMON_LOG_LEVEL からログレベルを設定（未設定なら何もしない）
pub fn init_from_env() {
    if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        set_log_level(LogLevel::from(level.as_str()));
    }
}

/// ログ出力先を設定
pub fn set_log_output<F>(output: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let _ = LOG_OUTPUT.set(Box::new(output));
}

/// ログメッセージの出力
pub fn log_message(level: LogLevel, category: LogCategory, message: &str) {
    if level > get_log_level() {
        return;
    }

    let timestamp = chrono::Utc::now().format("%H:%M:%S%.3f");
    let formatted = format!("[{timestamp}] [{level}] [{category}] {message}");

    if let Some(output) = LOG_OUTPUT.get() {
        output(&formatted);
    } else {
        // デフォルトはeprintln!
        eprintln!("{formatted}");
    }
}

#[doc(hidden)]
pub use paste;

/// ログマクロ
#[macro_export]
macro_rules! log_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Debug,
            $category,
            &format!($($arg)*)
        );
    };
}

/// 便利なマクロ - よく使うカテゴリ別
#[macro_export]
macro_rules! log_sampler {
    ($level:ident, $($arg:tt)*) => {
        $crate::logging::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Sampler, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_supervisor {
    ($level:ident, $($arg:tt)*) => {
        $crate::logging::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Supervisor, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_metrics {
    ($level:ident, $($arg:tt)*) => {
        $crate::logging::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Metrics, $($arg)*);
        }
    };
}
