pub mod config;
pub mod dns_message;
pub mod ech;
pub mod engine;
pub mod ip_range;
pub mod logger;
pub mod metrics;
pub mod relay;
pub mod route;
pub mod server;
pub mod socks5;

pub use config::Config;
pub use ech::EchResolver;
pub use engine::{EngineStatus, ProxyEngine, StatsSnapshot};
pub use ip_range::IpRangeStore;
pub use metrics::{Metrics, MetricsSnapshot};
pub use route::{PathDecision, RouteEngine, RoutingMode};
pub use server::{RelayTarget, Socks5Server};
