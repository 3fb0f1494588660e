/// 単位付きのメモリ表記を MB に正規化
///
/// `K` は /1024、`G` は *1024、`M` または単位なしはそのまま MB として扱う。
/// 数値として読めない場合は 0。
pub fn parse_memory_string(value: &str) -> f64 {
    let trimmed = value.trim();

    // 先頭の数値部分だけを取り出す（"123M+" のような top の表記に対応）
    let numeric_len = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    let number: f64 = match trimmed[..numeric_len].parse() {
        Ok(n) => n,
        Err(_) => return 0.0,
    };
    if !number.is_finite() {
        return 0.0;
    }

    let unit = trimmed[numeric_len..]
        .chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase());

    match unit {
        Some('K') => number / 1024.0,
        Some('G') => number * 1024.0,
        _ => number,
    }
}

/// /proc/<pid>/status のプライベートメモリ関連フィールド（すべて kB）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcStatusMemory {
    /// 常駐メモリのうち匿名（プライベート）部分
    pub rss_anon_kb: f64,
    /// スワップアウトされた量
    pub vm_swap_kb: f64,
}

impl ProcStatusMemory {
    pub fn parse(status: &str) -> Self {
        let mut memory = Self::default();

        for line in status.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value: f64 = value.parse().unwrap_or(0.0);

            match key {
                "RssAnon:" => memory.rss_anon_kb = value,
                "VmSwap:" => memory.vm_swap_kb = value,
                _ => {}
            }
        }

        memory
    }

    /// 実メモリ（RssAnon + VmSwap、MB）
    pub fn private_mb(&self) -> f64 {
        (self.rss_anon_kb + self.vm_swap_kb) / 1024.0
    }
}
