use anyhow::Result;
use ech_proxy::config::{Config, LogConfigFile};
use ech_proxy::logger::{init_logger, LogConfig, LogLevel};
use ech_proxy::ProxyEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // 读取配置文件路径（命令行参数或默认值）
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = Config::load(&config_path)?;

    // 初始化日志系统
    let log_config_file = config.log.clone().unwrap_or_default();
    init_logger(build_log_config(&log_config_file))
        .map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== ECH 代理引擎启动 ===");
    log::info!("配置文件: {}", config_path);
    log::info!("监听地址: {}", config.listen_addr);
    log::info!("中转服务器: {}:{}", config.server_address, config.port);
    log::info!("分流模式: {}", config.parsed_routing_mode().as_str());
    log::info!("DoH 端点: {}", config.dns_server);
    if let Some(domain) = &config.ech_domain {
        log::info!("ECH 预取域名: {}", domain);
    }

    let engine = ProxyEngine::new(&config)?;
    if !engine.start().await {
        anyhow::bail!("代理引擎启动失败");
    }

    // 等待 Ctrl-C 后优雅关闭
    tokio::signal::ctrl_c().await?;
    log::info!("收到退出信号");
    engine.stop().await;

    Ok(())
}

fn build_log_config(file: &LogConfigFile) -> LogConfig {
    let level = LogLevel::from_str(&file.level).unwrap_or(LogLevel::Info);
    let mut log_config = LogConfig::new(level)
        .with_timestamp(file.show_timestamp)
        .with_module(file.show_module)
        .with_color(file.use_color);

    match file.output.as_str() {
        "file" => {
            let path = file
                .file_path
                .clone()
                .unwrap_or_else(|| "logs/ech-proxy.log".to_string());
            log_config = log_config.with_file(&path);
        }
        "both" => {
            let path = file
                .file_path
                .clone()
                .unwrap_or_else(|| "logs/ech-proxy.log".to_string());
            log_config = log_config.with_both(&path);
        }
        _ => {}
    }

    log_config
}
