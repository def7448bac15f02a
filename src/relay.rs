use anyhow::Result;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::metrics::Metrics;

/// 会话最长存活时间，超时后强制关闭双向通道
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// 单次会话的流量统计
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// 客户端到上游的字节数
    pub bytes_uploaded: u64,
    /// 上游到客户端的字节数
    pub bytes_downloaded: u64,
}

/// 等待关闭信号变为 true
///
/// 没有关闭通道或发送端已丢弃时永远挂起，会话仍受超时约束。
pub(crate) async fn wait_for_shutdown(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// 双向转发数据
///
/// 任一方向出现 EOF 或错误即结束整个会话，会话超时或收到
/// 关闭信号同样强制结束。每个方向的字节数同时计入全局指标
/// 和本次会话统计。
pub async fn relay_data(
    client_stream: TcpStream,
    upstream_stream: TcpStream,
    metrics: Metrics,
    shutdown_rx: Option<watch::Receiver<bool>>,
) -> Result<SessionStats> {
    let (mut client_read, mut client_write) = client_stream.into_split();
    let (mut upstream_read, mut upstream_write) = upstream_stream.into_split();

    let session_up = Arc::new(AtomicU64::new(0));
    let session_down = Arc::new(AtomicU64::new(0));

    // 64KB 缓冲区提高吞吐量
    let metrics_up = metrics.clone();
    let session_up_w = session_up.clone();
    let client_to_upstream = async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => return Ok::<(), std::io::Error>(()),
                Ok(n) => n,
                Err(e) => return Err(e),
            };
            upstream_write.write_all(&buf[..n]).await?;
            metrics_up.add_bytes_uploaded(n as u64);
            session_up_w.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    let metrics_down = metrics.clone();
    let session_down_w = session_down.clone();
    let upstream_to_client = async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) => return Ok::<(), std::io::Error>(()),
                Ok(n) => n,
                Err(e) => return Err(e),
            };
            client_write.write_all(&buf[..n]).await?;
            metrics_down.add_bytes_downloaded(n as u64);
            session_down_w.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("客户端到上游的数据传输结束: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("上游到客户端的数据传输结束: {}", e);
            }
        }
        _ = tokio::time::sleep(SESSION_TIMEOUT) => {
            debug!("会话超时，强制关闭");
            metrics.inc_connection_timeouts();
        }
        _ = wait_for_shutdown(shutdown_rx) => {
            debug!("收到关闭信号，结束会话");
        }
    }

    Ok(SessionStats {
        bytes_uploaded: session_up.load(Ordering::Relaxed),
        bytes_downloaded: session_down.load(Ordering::Relaxed),
    })
}
