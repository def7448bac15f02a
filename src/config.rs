use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::route::RoutingMode;

/// 代理引擎配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// 本地 SOCKS5 监听地址
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 中转服务器地址（域名或 IP）
    pub server_address: String,
    /// 中转服务器端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 接入令牌（可选，由中转协议层使用）
    pub token: Option<String>,
    /// 优先使用的中转出口 IP（可选）
    pub preferred_ip: Option<String>,
    /// DoH 端点，用于查询 HTTPS 记录和 ECH 配置
    #[serde(default = "default_dns_server")]
    pub dns_server: String,
    /// 预取 ECH 配置的域名（可选）
    pub ech_domain: Option<String>,
    /// 分流模式: global, bypass_domestic, none
    #[serde(default = "default_routing_mode")]
    pub routing_mode: String,
    /// 国内 CIDR 列表文件路径（可选，缺省使用内置列表）
    pub cidr_file: Option<String>,
    /// 最大并发连接数（可选，缺省按 CPU 核心数自适应）
    pub max_connections: Option<usize>,
    /// 日志配置（可选）
    pub log: Option<LogConfigFile>,
}

/// 日志配置段
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfigFile {
    /// 日志级别: off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志输出目标: stdout, file, both
    #[serde(default = "default_log_output")]
    pub output: String,
    /// 日志文件路径（当 output 为 file 或 both 时需要）
    pub file_path: Option<String>,
    /// 是否显示时间戳
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    /// 是否显示模块路径
    #[serde(default = "default_true")]
    pub show_module: bool,
    /// 是否使用颜色输出
    #[serde(default = "default_true")]
    pub use_color: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_dns_server() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_routing_mode() -> String {
    "bypass_domestic".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfigFile {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

impl Config {
    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&content).context("解析配置文件失败")?;
        Ok(config)
    }

    /// 解析监听地址
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("无效的监听地址: {}", self.listen_addr))
    }

    /// 解析分流模式，无法识别时退回 bypass_domestic
    pub fn parsed_routing_mode(&self) -> RoutingMode {
        match RoutingMode::from_str(&self.routing_mode) {
            Some(mode) => mode,
            None => {
                warn!("无法识别的分流模式 '{}'，使用 bypass_domestic", self.routing_mode);
                RoutingMode::BypassDomestic
            }
        }
    }

    /// 解析优先出口 IP，格式错误时忽略
    pub fn parsed_preferred_ip(&self) -> Option<IpAddr> {
        let raw = self.preferred_ip.as_deref()?;
        match raw.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("无效的优先出口 IP '{}'，已忽略", raw);
                None
            }
        }
    }
}
