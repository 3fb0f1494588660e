//! supervisor と sampler の間のプロセス境界の取り決めと、出力ファイル形式

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// 時系列ログのパス（絶対パス）
pub const ENV_LOG_FILE: &str = "LOG_FILE";
/// サンプリング間隔（ミリ秒、正の整数）
pub const ENV_INTERVAL: &str = "INTERVAL";
/// メモリ計測ポリシー（"private" または "total"）
pub const ENV_MEMORY_POLICY: &str = "MEMORY_POLICY";

/// 時系列ログのヘッダー行
pub const LOG_HEADER: &str = "Elapsed Time (s),CPU (%),Total Mem (MB)";

/// サマリーファイルのヘッダー行
pub const SUMMARY_HEADER: &str =
    "Total Time (s),Avg CPU (%),Avg Mem (MB),Max CPU (%),Max Mem (MB)";

const SUMMARY_SUFFIX: &str = "_summary";

/// ログのパスからサマリーファイルのパスを導出
///
/// `build.log` → `build_summary.log`。拡張子がなければ `.log` を付ける。
pub fn summary_path(log_path: &Path) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = log_path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());

    log_path.with_file_name(format!("{stem}{SUMMARY_SUFFIX}.{ext}"))
}

/// タイムスタンプ付きのデフォルトログファイル名
///
/// ISO-8601 の `:` と `.` はファイル名に使えない環境があるため `-` に置換する。
pub fn default_log_file_name(prefix: &str, now: DateTime<Utc>) -> String {
    let timestamp = now
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace([':', '.'], "-");
    format!("{prefix}_{timestamp}.log")
}
