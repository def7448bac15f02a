use anyhow::{Context, Result};
use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// IPv4 地址段（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Range {
    pub start: u32,
    pub end: u32,
}

/// IPv6 地址段（闭区间，128 位无符号比较）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Range {
    pub start: u128,
    pub end: u128,
}

/// 国内 IP 段存储，加载 CIDR 列表后只读
///
/// IPv4 段按起始地址升序排列，查询使用二分查找；
/// IPv6 段数量较少，同样排序后二分查找。
#[derive(Debug, Clone)]
pub struct IpRangeStore {
    v4_ranges: Vec<Ipv4Range>,
    v6_ranges: Vec<Ipv6Range>,
    /// 主数据源加载失败、退化到内置默认段时为 true
    degraded: bool,
}

/// 内置默认 IP 段（主数据源不可用时的降级数据）
const BUILTIN_RANGES: &str = "\
# 内置默认国内段（降级用，覆盖面有限）
1.0.1.0/24
36.0.0.0/10
39.96.0.0/13
42.0.0.0/8
58.14.0.0/15
59.32.0.0/13
101.0.0.0/22
106.0.0.0/7
110.0.0.0/7
114.28.0.0/14
116.0.0.0/8
119.0.0.0/8
120.0.0.0/6
124.0.0.0/8
180.76.0.0/16
182.0.0.0/8
202.96.0.0/12
218.0.0.0/7
220.160.0.0/11
221.0.0.0/8
222.0.0.0/8
223.4.0.0/14
240e::/20
2408:8000::/20
2409:8000::/20
";

impl IpRangeStore {
    /// 从 CIDR 文本加载（每行 `ip/prefix`，支持空行和 # 注释）
    ///
    /// 无效行跳过并告警，不影响其他行。
    pub fn from_cidr_list(text: &str) -> Self {
        let mut v4_ranges = Vec::new();
        let mut v6_ranges = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_cidr(line) {
                Some(ParsedRange::V4(range)) => v4_ranges.push(range),
                Some(ParsedRange::V6(range)) => v6_ranges.push(range),
                None => {
                    warn!("无效的 CIDR 行: {}", line);
                }
            }
        }

        // 按起始地址排序，之后只读
        v4_ranges.sort_by_key(|r| r.start);
        v6_ranges.sort_by_key(|r| r.start);

        info!(
            "IP 段加载完成: IPv4 {} 段, IPv6 {} 段",
            v4_ranges.len(),
            v6_ranges.len()
        );

        Self {
            v4_ranges,
            v6_ranges,
            degraded: false,
        }
    }

    /// 从文件加载 CIDR 列表
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取 CIDR 列表: {}", path.display()))?;
        let store = Self::from_cidr_list(&text);
        if store.is_empty() {
            anyhow::bail!("CIDR 列表为空: {}", path.display());
        }
        Ok(store)
    }

    /// 加载主数据源，失败时降级到内置默认段
    ///
    /// 永不阻塞、永不失败：降级状态下查询仍然可用，只是精度下降。
    pub fn load_or_default(path: Option<&Path>) -> Self {
        if let Some(path) = path {
            match Self::load_from_file(path) {
                Ok(store) => return store,
                Err(e) => {
                    warn!("加载 CIDR 列表失败，使用内置默认段: {}", e);
                }
            }
        }
        Self::builtin_default()
    }

    /// 内置默认段（降级状态）
    pub fn builtin_default() -> Self {
        let mut store = Self::from_cidr_list(BUILTIN_RANGES);
        store.degraded = true;
        store
    }

    /// IPv4 地址是否落在已加载段内（二分查找）
    #[inline]
    pub fn contains_v4(&self, ip: u32) -> bool {
        // 最后一个 start <= ip 的段
        let idx = self.v4_ranges.partition_point(|r| r.start <= ip);
        if idx == 0 {
            return false;
        }
        self.v4_ranges[idx - 1].end >= ip
    }

    /// IPv6 地址是否落在已加载段内（二分查找）
    #[inline]
    pub fn contains_v6(&self, ip: u128) -> bool {
        let idx = self.v6_ranges.partition_point(|r| r.start <= ip);
        if idx == 0 {
            return false;
        }
        self.v6_ranges[idx - 1].end >= ip
    }

    /// 通用查询入口；IPv4 映射的 IPv6 地址按 IPv4 处理
    #[inline]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.contains_v4(u32::from(v4)),
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    self.contains_v4(u32::from(v4))
                } else {
                    self.contains_v6(u128::from(v6))
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4_ranges.is_empty() && self.v6_ranges.is_empty()
    }

    /// 是否处于降级状态（使用内置默认段）
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn v4_count(&self) -> usize {
        self.v4_ranges.len()
    }

    pub fn v6_count(&self) -> usize {
        self.v6_ranges.len()
    }
}

enum ParsedRange {
    V4(Ipv4Range),
    V6(Ipv6Range),
}

/// 解析单行 CIDR：`start = ip & mask`，`end = start | !mask`
fn parse_cidr(cidr: &str) -> Option<ParsedRange> {
    let (ip_str, prefix_str) = cidr.split_once('/')?;
    let prefix_len = prefix_str.trim().parse::<u8>().ok()?;
    let ip_str = ip_str.trim();

    if let Ok(ip) = ip_str.parse::<Ipv4Addr>() {
        if prefix_len > 32 {
            return None;
        }
        let ip_u32 = u32::from(ip);
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };
        let start = ip_u32 & mask;
        let end = start | !mask;
        return Some(ParsedRange::V4(Ipv4Range { start, end }));
    }

    if let Ok(ip) = ip_str.parse::<Ipv6Addr>() {
        if prefix_len > 128 {
            return None;
        }
        let ip_u128 = u128::from(ip);
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u128 << (128 - prefix_len)
        };
        let start = ip_u128 & mask;
        let end = start | !mask;
        return Some(ParsedRange::V6(Ipv6Range { start, end }));
    }

    None
}
