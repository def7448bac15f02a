use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否显示时间戳
    pub show_timestamp: bool,
    /// 是否显示模块路径
    pub show_module: bool,
    /// 是否使用颜色输出（仅终端）
    pub use_color: bool,
    /// 日志输出目标
    pub output: LogOutput,
}

/// 日志输出目标
#[derive(Debug, Clone)]
pub enum LogOutput {
    /// 仅输出到标准输出
    Stdout,
    /// 仅输出到文件
    File(PathBuf),
    /// 同时输出到标准输出和文件
    Both(PathBuf),
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// 关闭所有日志
    Off,
    /// 错误日志
    Error,
    /// 警告日志
    Warn,
    /// 信息日志
    Info,
    /// 调试日志
    Debug,
    /// 追踪日志
    Trace,
}

impl LogLevel {
    /// 转换为 log::LevelFilter
    pub fn to_level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }

    /// 从字符串解析日志级别
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    /// 创建新的日志配置
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// 设置是否显示时间戳
    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    /// 设置是否显示模块路径
    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    /// 设置是否使用颜色
    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    /// 设置输出到文件
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.as_ref().to_path_buf());
        self
    }

    /// 设置同时输出到标准输出和文件
    pub fn with_both<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.as_ref().to_path_buf());
        self
    }
}

/// 自定义日志器
struct CustomLogger {
    config: LogConfig,
    file_writer: Option<Arc<Mutex<FileWriter>>>,
}

/// 文件写入器
struct FileWriter {
    file: File,
}

impl FileWriter {
    fn new(path: PathBuf) -> io::Result<Self> {
        // 创建目录（如果不存在）
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file })
    }

    fn write(&mut self, data: &str) -> io::Result<()> {
        self.file.write_all(data.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level.to_level_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let formatted = self.format_log(record, false);
        let formatted_color = self.format_log(record, true);

        // 输出到标准输出
        match &self.config.output {
            LogOutput::Stdout | LogOutput::Both(_) => {
                if self.config.use_color {
                    println!("{}", formatted_color);
                } else {
                    println!("{}", formatted);
                }
            }
            _ => {}
        }

        // 输出到文件（文件中不使用颜色）
        if let Some(writer) = &self.file_writer {
            if let Ok(mut w) = writer.lock() {
                let _ = w.write(&format!("{}\n", formatted));
            }
        }
    }

    fn flush(&self) {
        if let Some(writer) = &self.file_writer {
            if let Ok(mut w) = writer.lock() {
                let _ = w.file.flush();
            }
        }
    }
}

impl CustomLogger {
    fn format_log(&self, record: &Record, use_color: bool) -> String {
        // 时间戳
        let timestamp = if self.config.show_timestamp {
            format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        // 日志级别
        let level = if use_color && self.config.use_color {
            match record.level() {
                log::Level::Error => "\x1b[31mERROR\x1b[0m", // 红色
                log::Level::Warn => "\x1b[33mWARN \x1b[0m",  // 黄色
                log::Level::Info => "\x1b[32mINFO \x1b[0m",  // 绿色
                log::Level::Debug => "\x1b[36mDEBUG\x1b[0m", // 青色
                log::Level::Trace => "\x1b[35mTRACE\x1b[0m", // 紫色
            }
        } else {
            match record.level() {
                log::Level::Error => "ERROR",
                log::Level::Warn => "WARN ",
                log::Level::Info => "INFO ",
                log::Level::Debug => "DEBUG",
                log::Level::Trace => "TRACE",
            }
        };

        // 模块路径
        let module = if self.config.show_module {
            if let Some(module_path) = record.module_path() {
                format!("[{}] ", module_path)
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        format!("{}{} {} {}", timestamp, level, module, record.args())
    }
}

/// 初始化日志系统
///
/// # 示例
///
/// ```no_run
/// use ech_proxy::logger::{init_logger, LogConfig, LogLevel};
///
/// // 使用默认配置（输出到标准输出）
/// init_logger(LogConfig::default()).unwrap();
///
/// // 输出到文件
/// let config = LogConfig::new(LogLevel::Info)
///     .with_file("logs/app.log");
/// init_logger(config).unwrap();
/// ```
pub fn init_logger(config: LogConfig) -> Result<(), String> {
    let file_writer = match &config.output {
        LogOutput::File(path) | LogOutput::Both(path) => {
            let writer = FileWriter::new(path.clone())
                .map_err(|e| format!("无法创建日志文件: {}", e))?;
            Some(Arc::new(Mutex::new(writer)))
        }
        LogOutput::Stdout => None,
    };

    let logger = CustomLogger {
        config,
        file_writer,
    };

    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| format!("设置日志器失败: {}", e))?;
    log::set_max_level(LevelFilter::Trace);

    Ok(())
}

/// 使用默认配置初始化日志系统
pub fn init_default_logger() -> Result<(), String> {
    init_logger(LogConfig::default())
}
