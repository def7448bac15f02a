use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 代理引擎运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 分流统计
    direct_connections: AtomicU64,
    relay_connections: AtomicU64,

    // 流量统计（上行 = 客户端到目标，下行 = 目标到客户端）
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,

    // 错误统计
    protocol_errors: AtomicU64,
    dial_errors: AtomicU64,
    connection_timeouts: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                direct_connections: AtomicU64::new(0),
                relay_connections: AtomicU64::new(0),
                bytes_uploaded: AtomicU64::new(0),
                bytes_downloaded: AtomicU64::new(0),
                protocol_errors: AtomicU64::new(0),
                dial_errors: AtomicU64::new(0),
                connection_timeouts: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn inc_total_connections(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_direct_connections(&self) {
        self.inner.direct_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_relay_connections(&self) {
        self.inner.relay_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, bytes: u64) {
        self.inner.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.inner
            .bytes_downloaded
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_protocol_errors(&self) {
        self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dial_errors(&self) {
        self.inner.dial_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_timeouts(&self) {
        self.inner
            .connection_timeouts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            failed_connections: self.inner.failed_connections.load(Ordering::Relaxed),
            direct_connections: self.inner.direct_connections.load(Ordering::Relaxed),
            relay_connections: self.inner.relay_connections.load(Ordering::Relaxed),
            bytes_uploaded: self.inner.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.inner.bytes_downloaded.load(Ordering::Relaxed),
            protocol_errors: self.inner.protocol_errors.load(Ordering::Relaxed),
            dial_errors: self.inner.dial_errors.load(Ordering::Relaxed),
            connection_timeouts: self.inner.connection_timeouts.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印运行指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 代理运行指标 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("总连接数: {}", snapshot.total_connections);
        log::info!("活跃连接: {}", snapshot.active_connections);
        log::info!("失败连接: {}", snapshot.failed_connections);
        log::info!("直连: {}", snapshot.direct_connections);
        log::info!("中转: {}", snapshot.relay_connections);
        log::info!("上行流量: {} KB", snapshot.bytes_uploaded / 1024);
        log::info!("下行流量: {} KB", snapshot.bytes_downloaded / 1024);
        log::info!("协议错误: {}", snapshot.protocol_errors);
        log::info!("拨号失败: {}", snapshot.dial_errors);
        log::info!("连接超时: {}", snapshot.connection_timeouts);
    }
}

/// 指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub direct_connections: u64,
    pub relay_connections: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub protocol_errors: u64,
    pub dial_errors: u64,
    pub connection_timeouts: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        metrics.inc_active_connections();
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();
    }
}
