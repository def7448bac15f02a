use anyhow::Result;
use futures::future::BoxFuture;
use log::{debug, warn};
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::ip_range::IpRangeStore;

/// 分流模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// 全部走中转
    Global,
    /// 国内直连，其余走中转
    BypassDomestic,
    /// 全部直连
    None,
}

impl RoutingMode {
    /// 从配置字符串解析
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "global" => Some(RoutingMode::Global),
            "bypass_domestic" | "bypass-domestic" | "bypass" => Some(RoutingMode::BypassDomestic),
            "none" | "direct" => Some(RoutingMode::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Global => "global",
            RoutingMode::BypassDomestic => "bypass_domestic",
            RoutingMode::None => "none",
        }
    }
}

/// 单条连接的路径决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDecision {
    /// 直连目标
    Direct,
    /// 经远端中转
    Relay,
}

/// 主机名解析器，可注入（测试时替换为计数 mock）
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>>;
}

/// 系统解析器，走 tokio 的 lookup_host
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 443u16))
                .await?
                .map(|addr| addr.ip())
                .collect();
            if addrs.is_empty() {
                anyhow::bail!("DNS 查询返回空列表: {}", host);
            }
            Ok(addrs)
        })
    }
}

/// 无法解析时按域名后缀判定国内的兜底列表
const DOMESTIC_SUFFIXES: &[&str] = &[".cn", ".com.cn", ".net.cn", ".org.cn", ".gov.cn", ".edu.cn"];

/// 缓存 TTL：30 分钟
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

struct CacheEntry {
    result: bool,
    expires_at: Instant,
}

/// 分流决策引擎
///
/// 以 IP 段存储为底座，带按主机名和按 IP 两级结果缓存（30 分钟 TTL）。
/// 判定策略：解析出的地址中只要有一个国内地址、或者没有任何国外地址，
/// 即视为国内（CDN 混合应答偏向直连，减少不必要的中转跳数）。
pub struct RouteEngine {
    store: Arc<IpRangeStore>,
    resolver: Arc<dyn HostResolver>,
    host_cache: Mutex<LruCache<String, CacheEntry>>,
    ip_cache: Mutex<LruCache<IpAddr, CacheEntry>>,
    ttl: Duration,
}

impl RouteEngine {
    pub fn new(store: Arc<IpRangeStore>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            store,
            resolver,
            host_cache: Mutex::new(LruCache::new(NonZeroUsize::new(4096).unwrap())),
            ip_cache: Mutex::new(LruCache::new(NonZeroUsize::new(8192).unwrap())),
            ttl: CACHE_TTL,
        }
    }

    /// 覆盖缓存 TTL（测试用）
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// 决定目标主机的连接路径
    pub async fn decide(&self, host: &str, mode: RoutingMode) -> PathDecision {
        match mode {
            RoutingMode::None => return PathDecision::Direct,
            RoutingMode::Global => return PathDecision::Relay,
            RoutingMode::BypassDomestic => {}
        }

        let domestic = self.is_domestic(host).await;
        if domestic {
            PathDecision::Direct
        } else {
            PathDecision::Relay
        }
    }

    /// 判定主机是否国内（带缓存）
    async fn is_domestic(&self, host: &str) -> bool {
        // 1. 主机名缓存
        {
            let mut cache = self.host_cache.lock().await;
            if let Some(entry) = cache.get(host) {
                if entry.expires_at > Instant::now() {
                    debug!("分流缓存命中: {} -> 国内={}", host, entry.result);
                    return entry.result;
                }
            }
        }

        // 2. 字面 IP 直接分类
        let result = if let Ok(ip) = host.parse::<IpAddr>() {
            self.classify_ip(ip).await
        } else {
            // 3. 解析全部地址后分类，失败走后缀兜底
            match self.resolver.resolve(host).await {
                Ok(addrs) => {
                    let mut any_domestic = false;
                    for addr in &addrs {
                        if self.classify_ip(*addr).await {
                            any_domestic = true;
                        }
                    }
                    // 空地址集或全国内 => 国内；混合应答偏向国内
                    any_domestic || addrs.is_empty()
                }
                Err(e) => {
                    warn!("解析 {} 失败，使用域名后缀兜底: {}", host, e);
                    suffix_is_domestic(host)
                }
            }
        };

        let mut cache = self.host_cache.lock().await;
        cache.put(
            host.to_string(),
            CacheEntry {
                result,
                expires_at: Instant::now() + self.ttl,
            },
        );
        result
    }

    /// 单个 IP 的国内判定（带缓存）
    async fn classify_ip(&self, ip: IpAddr) -> bool {
        {
            let mut cache = self.ip_cache.lock().await;
            if let Some(entry) = cache.get(&ip) {
                if entry.expires_at > Instant::now() {
                    return entry.result;
                }
            }
        }

        let result = self.store.contains(ip);

        let mut cache = self.ip_cache.lock().await;
        cache.put(
            ip,
            CacheEntry {
                result,
                expires_at: Instant::now() + self.ttl,
            },
        );
        result
    }
}

/// 域名后缀兜底判定
fn suffix_is_domestic(host: &str) -> bool {
    let host = host.to_lowercase();
    DOMESTIC_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定结果的解析器 mock，记录调用次数
    struct MockResolver {
        addrs: Option<Vec<IpAddr>>,
        calls: AtomicUsize,
    }

    impl MockResolver {
        fn with_addrs(addrs: Vec<IpAddr>) -> Self {
            Self {
                addrs: Some(addrs),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                addrs: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl HostResolver for MockResolver {
        fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match &self.addrs {
                Some(addrs) => Ok(addrs.clone()),
                None => Err(anyhow::anyhow!("解析失败: {}", host)),
            };
            Box::pin(async move { result })
        }
    }

    fn store() -> Arc<IpRangeStore> {
        Arc::new(IpRangeStore::from_cidr_list(
            "202.96.0.0/12\n114.28.0.0/14\n240e::/20",
        ))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_mode_none_always_direct() {
        let engine = RouteEngine::new(store(), Arc::new(MockResolver::failing()));
        assert_eq!(
            engine.decide("93.184.216.34", RoutingMode::None).await,
            PathDecision::Direct
        );
        assert_eq!(
            engine.decide("foreign.example", RoutingMode::None).await,
            PathDecision::Direct
        );
    }

    #[tokio::test]
    async fn test_mode_global_always_relay() {
        let engine = RouteEngine::new(store(), Arc::new(MockResolver::failing()));
        assert_eq!(
            engine.decide("202.96.128.86", RoutingMode::Global).await,
            PathDecision::Relay
        );
        assert_eq!(
            engine.decide("domestic.cn", RoutingMode::Global).await,
            PathDecision::Relay
        );
    }

    #[tokio::test]
    async fn test_literal_ip_classification() {
        let engine = RouteEngine::new(store(), Arc::new(MockResolver::failing()));

        assert_eq!(
            engine
                .decide("202.96.128.86", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Direct
        );
        assert_eq!(
            engine
                .decide("93.184.216.34", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Relay
        );
        // 字面 IPv6
        assert_eq!(
            engine.decide("240e::1", RoutingMode::BypassDomestic).await,
            PathDecision::Direct
        );
        assert_eq!(
            engine
                .decide("2001:db8::1", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Relay
        );
    }

    #[tokio::test]
    async fn test_all_domestic_addrs_direct() {
        let resolver = Arc::new(MockResolver::with_addrs(vec![
            ip("202.96.1.1"),
            ip("114.28.0.1"),
        ]));
        let engine = RouteEngine::new(store(), resolver);
        assert_eq!(
            engine
                .decide("cdn.domestic.test", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Direct
        );
    }

    #[tokio::test]
    async fn test_all_foreign_addrs_relay() {
        let resolver = Arc::new(MockResolver::with_addrs(vec![
            ip("93.184.216.34"),
            ip("151.101.1.140"),
        ]));
        let engine = RouteEngine::new(store(), resolver);
        assert_eq!(
            engine
                .decide("foreign.test", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Relay
        );
    }

    #[tokio::test]
    async fn test_mixed_addrs_biased_domestic() {
        // 一个国内一个国外：偏向国内，直连
        let resolver = Arc::new(MockResolver::with_addrs(vec![
            ip("202.96.1.1"),
            ip("93.184.216.34"),
        ]));
        let engine = RouteEngine::new(store(), resolver);
        assert_eq!(
            engine
                .decide("mixed.cdn.test", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Direct
        );
    }

    #[tokio::test]
    async fn test_empty_addr_set_counts_domestic() {
        let resolver = Arc::new(MockResolver::with_addrs(vec![]));
        let engine = RouteEngine::new(store(), resolver);
        assert_eq!(
            engine
                .decide("empty.test", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Direct
        );
    }

    #[tokio::test]
    async fn test_unresolvable_suffix_fallback() {
        let engine = RouteEngine::new(store(), Arc::new(MockResolver::failing()));

        assert_eq!(
            engine
                .decide("site.gov.cn", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Direct
        );
        assert_eq!(
            engine
                .decide("example.org", RoutingMode::BypassDomestic)
                .await,
            PathDecision::Relay
        );
    }

    #[tokio::test]
    async fn test_decision_cached_within_ttl() {
        let resolver = Arc::new(MockResolver::with_addrs(vec![ip("202.96.1.1")]));
        let engine = RouteEngine::new(store(), resolver.clone());

        engine
            .decide("cached.test", RoutingMode::BypassDomestic)
            .await;
        engine
            .decide("cached.test", RoutingMode::BypassDomestic)
            .await;
        engine
            .decide("cached.test", RoutingMode::BypassDomestic)
            .await;

        // TTL 内不重复解析
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_decision_recomputed_after_ttl() {
        let resolver = Arc::new(MockResolver::with_addrs(vec![ip("202.96.1.1")]));
        let engine = RouteEngine::new(store(), resolver.clone())
            .with_ttl(Duration::from_millis(30));

        engine
            .decide("expiry.test", RoutingMode::BypassDomestic)
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine
            .decide("expiry.test", RoutingMode::BypassDomestic)
            .await;

        assert_eq!(resolver.calls(), 2);
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!(RoutingMode::from_str("global"), Some(RoutingMode::Global));
        assert_eq!(
            RoutingMode::from_str("bypass_domestic"),
            Some(RoutingMode::BypassDomestic)
        );
        assert_eq!(RoutingMode::from_str("NONE"), Some(RoutingMode::None));
        assert_eq!(RoutingMode::from_str("unknown"), None);
    }
}
