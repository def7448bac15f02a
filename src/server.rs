use anyhow::{Context, Result};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::ech::EchResolver;
use crate::metrics::{ConnectionGuard, Metrics};
use crate::relay::{relay_data, wait_for_shutdown};
use crate::route::{PathDecision, RouteEngine, RoutingMode};
use crate::socks5::{
    handle_greeting, read_connect_request, send_failure_reply, send_success_reply,
};

/// 握手阶段超时（问候 + CONNECT 请求）
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// 出站拨号超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 中转出口配置
#[derive(Debug, Clone)]
pub struct RelayTarget {
    /// 中转服务器地址（域名或 IP）
    pub address: String,
    /// 中转服务器端口
    pub port: u16,
    /// 优先使用的出口 IP，设置后跳过对中转地址的解析
    pub preferred_ip: Option<IpAddr>,
}

/// SOCKS5 分流代理服务器
pub struct Socks5Server {
    /// 监听地址
    listen_addr: SocketAddr,
    /// 中转出口
    relay: RelayTarget,
    /// 分流模式
    routing_mode: RoutingMode,
    /// 分流决策引擎
    route_engine: Arc<RouteEngine>,
    /// ECH 配置解析器（可选）
    ech_resolver: Option<Arc<EchResolver>>,
    /// 性能监控指标
    metrics: Metrics,
    /// 最大并发连接数
    max_connections: usize,
}

impl Socks5Server {
    pub fn new(
        listen_addr: SocketAddr,
        relay: RelayTarget,
        routing_mode: RoutingMode,
        route_engine: Arc<RouteEngine>,
        ech_resolver: Option<Arc<EchResolver>>,
        metrics: Metrics,
    ) -> Self {
        // 自适应最大连接数：每核心 500 个并发，上限 10000
        let num_cpus = num_cpus::get();
        let max_connections = std::cmp::min(10000, std::cmp::max(500, num_cpus * 500));

        Self {
            listen_addr,
            relay,
            routing_mode,
            route_engine,
            ech_resolver,
            metrics,
            max_connections,
        }
    }

    /// 设置最大并发连接数
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// 获取监控指标
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 创建监听 socket 并设置选项
    ///
    /// 绑定失败在这里返回错误，以便上层区分"无法启动"和连接级错误。
    pub fn bind(&self) -> Result<TcpListener> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.listen_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("创建监听 socket 失败")?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        // SO_REUSEPORT - 允许端口重用（Linux/macOS）
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                let fd = socket.as_raw_fd();
                let reuse_port: libc::c_int = 1;
                let _ = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEPORT,
                    &reuse_port as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&reuse_port) as libc::socklen_t,
                );
            }
        }

        socket
            .bind(&self.listen_addr.into())
            .with_context(|| format!("绑定 {} 失败", self.listen_addr))?;

        // 更大的 backlog 让更多连接在队列中等待
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        Ok(listener)
    }

    /// 启动代理服务器
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, None).await
    }

    /// 在给定的监听器上运行（支持优雅关闭）
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        info!("SOCKS5 代理服务器启动在 {}", listener.local_addr()?);
        info!("分流模式: {}", self.routing_mode.as_str());
        info!("中转出口: {}:{}", self.relay.address, self.relay.port);
        if let Some(ip) = self.relay.preferred_ip {
            info!("优先出口 IP: {}", ip);
        }
        info!("最大并发连接数: {}", self.max_connections);

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_connections));

        // 后台任务：每分钟打印监控指标，随关闭信号退出
        let summary_task = spawn_summary_task(self.metrics.clone(), shutdown_rx.clone());

        // 转发阶段的会话通过这份副本感知关闭信号
        let session_shutdown = shutdown_rx.clone();

        loop {
            if let Some(ref mut rx) = shutdown_rx {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("收到关闭信号，停止接受新连接");
                            self.drain_connections().await;
                            summary_task.abort();
                            return Ok(());
                        }
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((client_stream, client_addr)) => {
                                self.dispatch(
                                    client_stream,
                                    client_addr,
                                    &semaphore,
                                    session_shutdown.clone(),
                                )
                                .await;
                            }
                            Err(e) => {
                                error!("接受连接失败: {}", e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            } else {
                match listener.accept().await {
                    Ok((client_stream, client_addr)) => {
                        self.dispatch(client_stream, client_addr, &semaphore, None)
                            .await;
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// 等待活跃连接完成（最多 30 秒）
    async fn drain_connections(&self) {
        info!("等待活跃连接完成...");
        for _ in 0..30 {
            let active = self.metrics.get_active_connections();
            if active == 0 {
                info!("所有连接已关闭");
                break;
            }
            debug!("等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let final_active = self.metrics.get_active_connections();
        if final_active > 0 {
            warn!("超时：仍有 {} 个连接未关闭，强制退出", final_active);
        }

        info!("最终统计:");
        self.metrics.print_summary();
    }

    /// 分发新连接到独立任务
    async fn dispatch(
        &self,
        client_stream: TcpStream,
        client_addr: SocketAddr,
        semaphore: &Arc<tokio::sync::Semaphore>,
        shutdown_rx: Option<watch::Receiver<bool>>,
    ) {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                error!("获取连接许可失败: {}", e);
                return;
            }
        };

        debug!("接受来自 {} 的新连接", client_addr);

        let session = SessionContext {
            relay: self.relay.clone(),
            routing_mode: self.routing_mode,
            route_engine: Arc::clone(&self.route_engine),
            ech_resolver: self.ech_resolver.clone(),
            metrics: self.metrics.clone(),
            shutdown_rx,
        };

        tokio::spawn(async move {
            let _permit = permit;

            // 捕获 panic 以防止任务崩溃
            let metrics = session.metrics.clone();
            let result = std::panic::AssertUnwindSafe(handle_connection(
                client_stream,
                client_addr,
                session,
            ))
            .catch_unwind()
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("处理连接时出错: {}", e);
                }
                Err(panic_err) => {
                    error!("连接处理任务 panic: {:?}", panic_err);
                    metrics.inc_failed_connections();
                }
            }
        });
    }
}

/// 单个会话需要的共享组件
struct SessionContext {
    relay: RelayTarget,
    routing_mode: RoutingMode,
    route_engine: Arc<RouteEngine>,
    ech_resolver: Option<Arc<EchResolver>>,
    metrics: Metrics,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

/// 启动每分钟打印监控指标的后台任务
///
/// 任务在收到关闭信号后自行退出，避免跨多次启动累积。
fn spawn_summary_task(
    metrics: Metrics,
    shutdown_rx: Option<watch::Receiver<bool>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        let shutdown = wait_for_shutdown(shutdown_rx);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = interval.tick() => metrics.print_summary(),
                _ = &mut shutdown => return,
            }
        }
    })
}

/// 处理单个客户端连接：握手、分流决策、拨号、双向转发
async fn handle_connection(
    mut client_stream: TcpStream,
    client_addr: SocketAddr,
    ctx: SessionContext,
) -> Result<()> {
    let _guard = ConnectionGuard::new(ctx.metrics.clone());
    let _ = client_stream.set_nodelay(true);

    // 问候阶段：格式错误或超时直接断开，不发应答
    match timeout(HANDSHAKE_TIMEOUT, handle_greeting(&mut client_stream)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("来自 {} 的问候无效: {}", client_addr, e);
            ctx.metrics.inc_protocol_errors();
            ctx.metrics.inc_failed_connections();
            return Ok(());
        }
        Err(_) => {
            debug!("来自 {} 的问候超时", client_addr);
            ctx.metrics.inc_connection_timeouts();
            ctx.metrics.inc_failed_connections();
            return Ok(());
        }
    }

    // 请求阶段：同样只接受格式正确的 CONNECT
    let request = match timeout(HANDSHAKE_TIMEOUT, read_connect_request(&mut client_stream)).await
    {
        Ok(Ok(req)) => req,
        Ok(Err(e)) => {
            debug!("来自 {} 的请求无效: {}", client_addr, e);
            ctx.metrics.inc_protocol_errors();
            ctx.metrics.inc_failed_connections();
            return Ok(());
        }
        Err(_) => {
            debug!("来自 {} 的请求超时", client_addr);
            ctx.metrics.inc_connection_timeouts();
            ctx.metrics.inc_failed_connections();
            return Ok(());
        }
    };

    let target_host = request.target.host();
    let decision = ctx
        .route_engine
        .decide(&target_host, ctx.routing_mode)
        .await;

    let upstream = match decision {
        PathDecision::Direct => {
            debug!("{}:{} 直连", target_host, request.port);
            ctx.metrics.inc_direct_connections();
            dial(&target_host, request.port).await
        }
        PathDecision::Relay => {
            debug!(
                "{}:{} 走中转 {}:{}",
                target_host, request.port, ctx.relay.address, ctx.relay.port
            );
            ctx.metrics.inc_relay_connections();

            // 预热目标域名的 ECH 配置，拿不到也不影响转发
            if let Some(resolver) = ctx.ech_resolver.clone() {
                let domain = target_host.clone();
                tokio::spawn(async move {
                    if resolver.fetch_ech_config(&domain).await.is_some() {
                        debug!("已缓存 {} 的 ECH 配置", domain);
                    }
                });
            }

            match ctx.relay.preferred_ip {
                Some(ip) => dial(&ip.to_string(), ctx.relay.port).await,
                None => dial(&ctx.relay.address, ctx.relay.port).await,
            }
        }
    };

    let upstream = match upstream {
        Ok(stream) => stream,
        Err(DialError::Timeout) => {
            warn!("连接 {}:{} 超时", target_host, request.port);
            ctx.metrics.inc_connection_timeouts();
            ctx.metrics.inc_failed_connections();
            let _ = send_failure_reply(&mut client_stream).await;
            return Ok(());
        }
        Err(DialError::Io(e)) => {
            warn!("连接 {}:{} 失败: {}", target_host, request.port, e);
            ctx.metrics.inc_dial_errors();
            ctx.metrics.inc_failed_connections();
            let _ = send_failure_reply(&mut client_stream).await;
            return Ok(());
        }
    };

    let _ = upstream.set_nodelay(true);
    send_success_reply(&mut client_stream).await?;

    let stats = relay_data(client_stream, upstream, ctx.metrics.clone(), ctx.shutdown_rx).await?;
    debug!(
        "{} 会话结束: 上行 {} 字节, 下行 {} 字节",
        target_host, stats.bytes_uploaded, stats.bytes_downloaded
    );

    Ok(())
}

enum DialError {
    Timeout,
    Io(std::io::Error),
}

/// 带超时的出站拨号，主机可以是域名或 IP 字面量
async fn dial(host: &str, port: u16) -> std::result::Result<TcpStream, DialError> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(DialError::Io(e)),
        Err(_) => Err(DialError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_range::IpRangeStore;
    use crate::route::SystemResolver;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_server(routing_mode: RoutingMode, relay: RelayTarget) -> Socks5Server {
        let store = Arc::new(IpRangeStore::from_cidr_list("127.0.0.0/8\n"));
        let engine = Arc::new(RouteEngine::new(store, Arc::new(SystemResolver)));
        Socks5Server::new(
            "127.0.0.1:0".parse().unwrap(),
            relay,
            routing_mode,
            engine,
            None,
            Metrics::new(),
        )
    }

    fn loopback_relay(port: u16) -> RelayTarget {
        RelayTarget {
            address: "127.0.0.1".to_string(),
            port,
            preferred_ip: None,
        }
    }

    /// 起一个回显服务器，返回端口
    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    /// 完成 SOCKS5 握手并发出到 127.0.0.1:port 的 CONNECT
    async fn socks5_connect(proxy_port: u16, target_port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&target_port.to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);

        stream
    }

    #[tokio::test]
    async fn test_direct_path_end_to_end() {
        let echo_port = spawn_echo().await;

        // 127.0.0.0/8 在范围内，BypassDomestic 下走直连
        let server = test_server(RoutingMode::BypassDomestic, loopback_relay(1));
        let metrics = server.metrics().clone();
        let listener = server.bind().unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { server.serve(listener, None).await });

        let mut stream = socks5_connect(proxy_port, echo_port).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(stream);

        // 等待会话结束后再检查计数
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.direct_connections, 1);
        assert_eq!(snapshot.relay_connections, 0);
        assert_eq!(snapshot.bytes_uploaded, 4);
        assert_eq!(snapshot.bytes_downloaded, 4);
    }

    #[tokio::test]
    async fn test_relay_path_uses_configured_relay() {
        let relay_port = spawn_echo().await;

        // Global 模式下所有流量走中转，CONNECT 的目标端口被忽略
        let server = test_server(RoutingMode::Global, loopback_relay(relay_port));
        let metrics = server.metrics().clone();
        let listener = server.bind().unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { server.serve(listener, None).await });

        let mut stream = socks5_connect(proxy_port, 9).await;
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.relay_connections, 1);
        assert_eq!(snapshot.direct_connections, 0);
    }

    #[tokio::test]
    async fn test_malformed_greeting_closed_without_reply() {
        let echo_port = spawn_echo().await;

        let server = test_server(RoutingMode::None, loopback_relay(1));
        let metrics = server.metrics().clone();
        let listener = server.bind().unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { server.serve(listener, None).await });

        // 坏连接：首字节不是 0x05
        let mut bad = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        // 服务器应直接断开（EOF 或 RST），而不是发送任何应答
        match bad.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("收到了意外的应答: {:?}", &buf[..n]),
        }

        // 坏连接不影响后续的正常连接
        let mut good = socks5_connect(proxy_port, echo_port).await;
        good.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        good.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics.snapshot().protocol_errors, 1);
    }

    #[tokio::test]
    async fn test_dial_failure_replies_error() {
        let server = test_server(RoutingMode::None, loopback_relay(1));
        let listener = server.bind().unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { server.serve(listener, None).await });

        let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();

        // 端口 1 上没有服务，拨号会被拒绝
        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&1u16.to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x01);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let server = test_server(RoutingMode::None, loopback_relay(1));
        let listener = server.bind().unwrap();
        let proxy_port = listener.local_addr().unwrap().port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            tokio::spawn(async move { server.serve(listener, Some(shutdown_rx)).await });

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // 监听器已关闭，新连接应失败
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", proxy_port)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_sessions() {
        let echo_port = spawn_echo().await;

        let server = test_server(RoutingMode::None, loopback_relay(1));
        let listener = server.bind().unwrap();
        let proxy_port = listener.local_addr().unwrap().port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            tokio::spawn(async move { server.serve(listener, Some(shutdown_rx)).await });

        // 建立一个转发中的会话
        let mut stream = socks5_connect(proxy_port, echo_port).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // 关闭信号应终止会话，serve 在排空后迅速返回
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // 会话连接已被关闭，不能继续转发
        let mut buf = [0u8; 4];
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            other => panic!("会话在关闭后仍然存活: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_summary_task_exits_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_summary_task(Metrics::new(), Some(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
