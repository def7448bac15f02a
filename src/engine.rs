use anyhow::Result;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::ech::EchResolver;
use crate::ip_range::IpRangeStore;
use crate::metrics::Metrics;
use crate::route::{RouteEngine, RoutingMode, SystemResolver};
use crate::server::{RelayTarget, Socks5Server};

/// DoH 请求超时
const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// 引擎当前状态
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub is_running: bool,
    pub server_address: String,
    pub port: u16,
    pub routing_mode: String,
    pub range_store_ready: bool,
}

/// 每秒推送一次的统计快照
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// stopped / running / error
    pub status: String,
    /// status 为 error 时的可读错误信息
    pub message: Option<String>,
    pub total_connections: u64,
    pub active_connections: usize,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub duration_seconds: u64,
    pub routing_mode: String,
}

impl StatsSnapshot {
    fn stopped(routing_mode: RoutingMode) -> Self {
        Self {
            status: "stopped".to_string(),
            message: None,
            total_connections: 0,
            active_connections: 0,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            duration_seconds: 0,
            routing_mode: routing_mode.as_str().to_string(),
        }
    }
}

/// 正在运行的服务器句柄
struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
    stats_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// 代理引擎：组装各组件并管理服务器生命周期
pub struct ProxyEngine {
    listen_addr: SocketAddr,
    relay: RelayTarget,
    routing_mode: RoutingMode,
    ech_domain: Option<String>,
    max_connections: Option<usize>,
    range_store: Arc<IpRangeStore>,
    route_engine: Arc<RouteEngine>,
    ech_resolver: Option<Arc<EchResolver>>,
    metrics: Metrics,
    state: Mutex<Option<RunningState>>,
    stats_tx: watch::Sender<StatsSnapshot>,
    stats_rx: watch::Receiver<StatsSnapshot>,
}

impl ProxyEngine {
    /// 根据配置组装引擎，所有组件在这里显式构造
    pub fn new(config: &Config) -> Result<Self> {
        let listen_addr = config.listen_socket_addr()?;
        let routing_mode = config.parsed_routing_mode();

        let cidr_path = config.cidr_file.as_ref().map(PathBuf::from);
        let range_store = Arc::new(IpRangeStore::load_or_default(cidr_path.as_deref()));
        if range_store.is_degraded() {
            warn!("CIDR 列表加载失败，使用内置兜底列表");
        }
        info!(
            "IP 范围库就绪: {} 个 IPv4 段, {} 个 IPv6 段",
            range_store.v4_count(),
            range_store.v6_count()
        );

        let route_engine = Arc::new(RouteEngine::new(
            Arc::clone(&range_store),
            Arc::new(SystemResolver),
        ));

        let ech_resolver = match EchResolver::new(&config.dns_server, DOH_TIMEOUT) {
            Ok(resolver) => Some(Arc::new(resolver)),
            Err(e) => {
                warn!("创建 ECH 解析器失败: {}，ECH 预取已禁用", e);
                None
            }
        };

        let relay = RelayTarget {
            address: config.server_address.clone(),
            port: config.port,
            preferred_ip: config.parsed_preferred_ip(),
        };

        let (stats_tx, stats_rx) = watch::channel(StatsSnapshot::stopped(routing_mode));

        Ok(Self {
            listen_addr,
            relay,
            routing_mode,
            ech_domain: config.ech_domain.clone(),
            max_connections: config.max_connections,
            range_store,
            route_engine,
            ech_resolver,
            metrics: Metrics::new(),
            state: Mutex::new(None),
            stats_tx,
            stats_rx,
        })
    }

    /// 获取监控指标
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 实际绑定的监听地址（运行中才有值）
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|s| s.local_addr))
    }

    /// 当前状态
    pub fn status(&self) -> EngineStatus {
        let is_running = self
            .state
            .lock()
            .map(|state| state.is_some())
            .unwrap_or(false);
        EngineStatus {
            is_running,
            server_address: self.relay.address.clone(),
            port: self.relay.port,
            routing_mode: self.routing_mode.as_str().to_string(),
            range_store_ready: !self.range_store.is_empty(),
        }
    }

    /// 订阅统计快照流（每秒更新）
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.stats_rx.clone()
    }

    /// 启动代理服务器
    ///
    /// 监听地址无法绑定时返回 false，错误通过 status 为 "error" 的
    /// 快照对外暴露。重复启动是幂等的。
    pub async fn start(&self) -> bool {
        {
            let state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return false,
            };
            if state.is_some() {
                warn!("引擎已在运行");
                return true;
            }
        }

        let mut server = Socks5Server::new(
            self.listen_addr,
            self.relay.clone(),
            self.routing_mode,
            Arc::clone(&self.route_engine),
            self.ech_resolver.clone(),
            self.metrics.clone(),
        );
        if let Some(max) = self.max_connections {
            server = server.with_max_connections(max);
        }

        let listener = match server.bind() {
            Ok(l) => l,
            Err(e) => {
                error!("启动失败: {}", e);
                let mut snapshot = StatsSnapshot::stopped(self.routing_mode);
                snapshot.status = "error".to_string();
                snapshot.message = Some(format!("{:#}", e));
                let _ = self.stats_tx.send(snapshot);
                return false;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("读取监听地址失败: {}", e);
                return false;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener, Some(shutdown_rx)).await {
                error!("服务器异常退出: {}", e);
            }
        });

        // 预取配置域名的 ECH
        if let (Some(resolver), Some(domain)) =
            (self.ech_resolver.clone(), self.ech_domain.clone())
        {
            tokio::spawn(async move {
                match resolver.fetch_ech_config(&domain).await {
                    Some(config) => info!("已预取 {} 的 ECH 配置 ({} 字节)", domain, config.len()),
                    None => info!("{} 暂无可用的 ECH 配置", domain),
                }
            });
        }

        // 每秒推送统计快照
        let stats_tx = self.stats_tx.clone();
        let metrics = self.metrics.clone();
        let routing_mode = self.routing_mode;
        let started_at = Instant::now();
        let stats_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let m = metrics.snapshot();
                let snapshot = StatsSnapshot {
                    status: "running".to_string(),
                    message: None,
                    total_connections: m.total_connections,
                    active_connections: m.active_connections,
                    bytes_uploaded: m.bytes_uploaded,
                    bytes_downloaded: m.bytes_downloaded,
                    duration_seconds: started_at.elapsed().as_secs(),
                    routing_mode: routing_mode.as_str().to_string(),
                };
                if stats_tx.send(snapshot).is_err() {
                    return;
                }
            }
        });

        if let Ok(mut state) = self.state.lock() {
            *state = Some(RunningState {
                shutdown_tx,
                server_task,
                stats_task,
                local_addr,
            });
        }

        info!("代理引擎已启动: {}", local_addr);
        true
    }

    /// 停止代理服务器，等待服务器任务退出
    pub async fn stop(&self) {
        let running = match self.state.lock() {
            Ok(mut state) => state.take(),
            Err(_) => None,
        };

        let Some(running) = running else {
            warn!("引擎未在运行");
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.server_task.await {
            error!("等待服务器任务退出失败: {}", e);
        }
        running.stats_task.abort();

        let _ = self.stats_tx.send(StatsSnapshot::stopped(self.routing_mode));
        info!("代理引擎已停止");
    }
}
