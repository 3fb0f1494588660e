use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::{default_log_file_name, ENV_INTERVAL, ENV_LOG_FILE, ENV_MEMORY_POLICY};

/// メモリ使用量の計測ポリシー
///
/// - `Private`: 実メモリ（RssAnon + VmSwap）。アクティビティモニタの表示に近い
/// - `Total`: 共有ページも含む常駐メモリ（OS が報告する RSS）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPolicy {
    #[default]
    Private,
    Total,
}

impl MemoryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPolicy::Private => "private",
            MemoryPolicy::Total => "total",
        }
    }
}

impl fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "private" | "real" => Ok(MemoryPolicy::Private),
            "total" => Ok(MemoryPolicy::Total),
            other => bail!("Unknown memory policy: {other} (expected \"private\" or \"total\")"),
        }
    }
}

/// サンプラーの起動設定（起動後は変更しない）
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub target_pid: u32,
    pub interval: Duration,
    pub log_path: PathBuf,
    pub memory_policy: MemoryPolicy,
}

impl MonitorConfig {
    pub fn new(target_pid: u32, interval: Duration, log_path: impl Into<PathBuf>) -> Self {
        Self {
            target_pid,
            interval,
            log_path: log_path.into(),
            memory_policy: MemoryPolicy::default(),
        }
    }

    pub fn with_memory_policy(mut self, memory_policy: MemoryPolicy) -> Self {
        self.memory_policy = memory_policy;
        self
    }

    /// 位置引数の PID とプロセス環境変数から生成
    pub fn from_env(pid_arg: Option<&str>) -> Result<Self> {
        Self::from_lookup(pid_arg, |key| std::env::var(key).ok())
    }

    /// 位置引数の PID と任意の環境変数ルックアップから生成
    pub fn from_lookup<F>(pid_arg: Option<&str>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pid_str = pid_arg.context("Missing target process id argument")?;
        let target_pid: u32 = pid_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid target process id: {pid_str}"))?;

        let log_path = lookup(ENV_LOG_FILE)
            .filter(|s| !s.trim().is_empty())
            .with_context(|| format!("{ENV_LOG_FILE} is not set"))?;

        let interval_str =
            lookup(ENV_INTERVAL).with_context(|| format!("{ENV_INTERVAL} is not set"))?;
        let interval = parse_interval_ms(&interval_str)?;

        let memory_policy = match lookup(ENV_MEMORY_POLICY) {
            Some(value) => value.parse()?,
            None => MemoryPolicy::default(),
        };

        Ok(Self {
            target_pid,
            interval,
            log_path: PathBuf::from(log_path),
            memory_policy,
        })
    }

    /// 子プロセスに渡す環境変数
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_LOG_FILE, self.log_path.to_string_lossy().into_owned()),
            (ENV_INTERVAL, self.interval.as_millis().to_string()),
            (ENV_MEMORY_POLICY, self.memory_policy.to_string()),
        ]
    }
}

/// ミリ秒の文字列を間隔に変換（0 や数値以外はエラー）
pub fn parse_interval_ms(value: &str) -> Result<Duration> {
    let millis: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {ENV_INTERVAL} value: {value}"))?;
    if millis == 0 {
        bail!("{ENV_INTERVAL} must be a positive number of milliseconds");
    }
    Ok(Duration::from_millis(millis))
}

/// メインの設定構造体（supervisor 用）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// サンプラー設定
    #[serde(default)]
    pub sampler: SamplerSettings,

    /// ログ設定
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// サンプラー関連の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSettings {
    /// サンプリング間隔（ミリ秒）
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// メモリ計測ポリシー
    #[serde(default)]
    pub memory_policy: MemoryPolicy,

    /// ログの出力ディレクトリ（未指定ならカレントディレクトリ）
    pub log_dir: Option<PathBuf>,

    /// ログファイル名の接頭辞
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// サンプラー実行ファイルのパス（未指定なら supervisor と同じディレクトリを探す）
    pub sampler_path: Option<PathBuf>,
}

/// ログ関連の設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    /// 詳細ログを有効にするか
    #[serde(default)]
    pub verbose: bool,

    /// ログレベル（"error" 〜 "trace"）
    pub level: Option<String>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            memory_policy: MemoryPolicy::default(),
            log_dir: None,
            log_prefix: default_log_prefix(),
            sampler_path: None,
        }
    }
}

// デフォルト値関数
fn default_interval_ms() -> u64 {
    1000
}

fn default_log_prefix() -> String {
    "build".to_string()
}

impl Config {
    /// 設定ファイルから読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// 設定ファイルに保存
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// TOML 文字列に変換
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    /// 設定ファイルパスの候補を取得（優先順位順）
    pub fn config_path_candidates() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. カレントディレクトリの .buildmon/config.toml
        if let Ok(current_dir) = std::env::current_dir() {
            paths.push(current_dir.join(".buildmon").join("config.toml"));
        }

        // 2. ホームディレクトリの .buildmon/config.toml
        if let Some(home_dir) = home::home_dir() {
            paths.push(home_dir.join(".buildmon").join("config.toml"));
        }

        // 3. XDG規格に従った設定ディレクトリ
        if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(
                PathBuf::from(xdg_config_home)
                    .join("buildmon")
                    .join("config.toml"),
            );
        } else if let Some(home_dir) = home::home_dir() {
            paths.push(home_dir.join(".config").join("buildmon").join("config.toml"));
        }

        paths
    }

    /// 設定ファイルを自動検出して読み込み
    pub fn load_auto() -> Result<Option<(Self, PathBuf)>> {
        for path in Self::config_path_candidates() {
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }
        Ok(None)
    }

    /// 環境変数で設定を上書き
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// 任意のルックアップで設定を上書き
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(interval) = lookup("BUILDMON_INTERVAL") {
            self.sampler.interval_ms = parse_interval_ms(&interval)?.as_millis() as u64;
        }

        if let Some(policy) = lookup("BUILDMON_MEMORY_POLICY") {
            self.sampler.memory_policy = policy.parse()?;
        }

        if let Some(log_dir) = lookup("BUILDMON_LOG_DIR") {
            self.sampler.log_dir = Some(PathBuf::from(log_dir));
        }

        if let Some(verbose) = lookup("BUILDMON_VERBOSE") {
            self.logging.verbose = verbose == "1" || verbose.to_lowercase() == "true";
        }

        Ok(())
    }

    /// サンプリング間隔
    pub fn interval(&self) -> Result<Duration> {
        if self.sampler.interval_ms == 0 {
            bail!("interval_ms must be a positive number of milliseconds");
        }
        Ok(Duration::from_millis(self.sampler.interval_ms))
    }

    /// タイムスタンプ付きのログファイルパスを生成
    ///
    /// 相対の log_dir（未指定なら base_dir 自体）は base_dir を起点に解決する。
    pub fn log_path_at(&self, base_dir: &Path, now: DateTime<Utc>) -> PathBuf {
        let dir = match &self.sampler.log_dir {
            Some(dir) => base_dir.join(dir),
            None => base_dir.to_path_buf(),
        };
        dir.join(default_log_file_name(&self.sampler.log_prefix, now))
    }

    /// 設定のサンプルを生成
    pub fn sample() -> Self {
        let mut config = Self::default();

        config.sampler.interval_ms = 1000;
        config.sampler.memory_policy = MemoryPolicy::Private;
        config.sampler.log_dir = Some(PathBuf::from("logs"));
        config.sampler.log_prefix = "web-app".to_string();

        config.logging.verbose = false;
        config.logging.level = Some("info".to_string());

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_monitor_config_from_lookup() {
        let lookup = lookup_from(&[("LOG_FILE", "/tmp/build.log"), ("INTERVAL", "250")]);
        let config = MonitorConfig::from_lookup(Some("4242"), lookup).unwrap();

        assert_eq!(config.target_pid, 4242);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.log_path, PathBuf::from("/tmp/build.log"));
        assert_eq!(config.memory_policy, MemoryPolicy::Private);
    }

    #[test]
    fn test_monitor_config_memory_policy() {
        let lookup = lookup_from(&[
            ("LOG_FILE", "/tmp/build.log"),
            ("INTERVAL", "1000"),
            ("MEMORY_POLICY", "Total"),
        ]);
        let config = MonitorConfig::from_lookup(Some("1"), lookup).unwrap();
        assert_eq!(config.memory_policy, MemoryPolicy::Total);
    }

    #[test]
    fn test_monitor_config_rejects_bad_input() {
        // PID なし
        let lookup = lookup_from(&[("LOG_FILE", "/tmp/a.log"), ("INTERVAL", "1000")]);
        assert!(MonitorConfig::from_lookup(None, lookup).is_err());

        // PID が数値でない
        let lookup = lookup_from(&[("LOG_FILE", "/tmp/a.log"), ("INTERVAL", "1000")]);
        assert!(MonitorConfig::from_lookup(Some("webpack"), lookup).is_err());

        // LOG_FILE なし
        let lookup = lookup_from(&[("INTERVAL", "1000")]);
        assert!(MonitorConfig::from_lookup(Some("1"), lookup).is_err());

        // INTERVAL が 0
        let lookup = lookup_from(&[("LOG_FILE", "/tmp/a.log"), ("INTERVAL", "0")]);
        assert!(MonitorConfig::from_lookup(Some("1"), lookup).is_err());

        // INTERVAL が数値でない
        let lookup = lookup_from(&[("LOG_FILE", "/tmp/a.log"), ("INTERVAL", "fast")]);
        assert!(MonitorConfig::from_lookup(Some("1"), lookup).is_err());

        // 不明なポリシー
        let lookup = lookup_from(&[
            ("LOG_FILE", "/tmp/a.log"),
            ("INTERVAL", "1000"),
            ("MEMORY_POLICY", "virtual"),
        ]);
        assert!(MonitorConfig::from_lookup(Some("1"), lookup).is_err());
    }

    #[test]
    fn test_monitor_config_env_round_trip() {
        let config = MonitorConfig::new(77, Duration::from_millis(1500), "/tmp/x.log")
            .with_memory_policy(MemoryPolicy::Total);
        let env: HashMap<String, String> = config
            .to_env()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(env.get("INTERVAL").map(String::as_str), Some("1500"));
        let parsed =
            MonitorConfig::from_lookup(Some("77"), |key| env.get(key).cloned()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.sampler.interval_ms, 1000);
        assert_eq!(config.sampler.memory_policy, MemoryPolicy::Private);
        assert_eq!(config.sampler.log_prefix, "build");
        assert!(config.sampler.log_dir.is_none());
        assert!(!config.logging.verbose);
    }

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
[sampler]
interval_ms = 500
memory_policy = "total"
log_prefix = "web-app"

[logging]
verbose = true
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.sampler.interval_ms, 500);
        assert_eq!(config.sampler.memory_policy, MemoryPolicy::Total);
        assert_eq!(config.sampler.log_prefix, "web-app");
        assert!(config.logging.verbose);
        assert!(config.logging.level.is_none());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(".buildmon").join("config.toml");

        let config = Config::sample();
        config.save_to_file(&config_path).unwrap();

        let loaded = Config::from_file(&config_path).unwrap();
        assert_eq!(loaded.sampler.log_prefix, "web-app");
        assert_eq!(loaded.sampler.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(loaded.logging.level.as_deref(), Some("info"));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        let lookup = lookup_from(&[
            ("BUILDMON_INTERVAL", "2000"),
            ("BUILDMON_MEMORY_POLICY", "total"),
            ("BUILDMON_LOG_DIR", "/tmp/buildmon"),
            ("BUILDMON_VERBOSE", "true"),
        ]);

        config.apply_overrides_from(lookup).unwrap();

        assert_eq!(config.sampler.interval_ms, 2000);
        assert_eq!(config.sampler.memory_policy, MemoryPolicy::Total);
        assert_eq!(config.sampler.log_dir, Some(PathBuf::from("/tmp/buildmon")));
        assert!(config.logging.verbose);

        let mut config = Config::default();
        assert!(config
            .apply_overrides_from(lookup_from(&[("BUILDMON_INTERVAL", "0")]))
            .is_err());
    }

    #[test]
    fn test_log_path_at() {
        use chrono::TimeZone;

        let mut config = Config::default();
        config.sampler.log_dir = Some(PathBuf::from("/tmp/logs"));
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let path = config.log_path_at(Path::new("/work"), now);
        assert_eq!(
            path,
            PathBuf::from("/tmp/logs/build_2025-01-02T03-04-05-000Z.log")
        );

        // 相対ディレクトリは base_dir から
        config.sampler.log_dir = Some(PathBuf::from("logs"));
        let path = config.log_path_at(Path::new("/work"), now);
        assert_eq!(
            path,
            PathBuf::from("/work/logs/build_2025-01-02T03-04-05-000Z.log")
        );

        config.sampler.log_dir = None;
        let path = config.log_path_at(Path::new("/work"), now);
        assert_eq!(path, PathBuf::from("/work/build_2025-01-02T03-04-05-000Z.log"));
    }
}
