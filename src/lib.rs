/// Relay Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod acceptor;
pub mod buffer_pool;
pub mod cli;
pub mod config;
pub mod error;
pub mod headers;
pub mod redirect;
pub mod relay;
pub mod server;
pub mod session;
pub mod socks5;

// 重新导出常用类型
pub use buffer_pool::{BufferPool, PooledBuf, BUFFER_SIZE};
pub use config::{LineConfig, ServeMode, TunnelConfig};
pub use error::{Result, TunnelError};
pub use headers::{FixedHeaders, HeaderProvider, HostRewriteHeaders};
pub use redirect::{OriginalDstResolver, SystemResolver};
pub use relay::{RelayDetector, RelayScan};
pub use server::TunnelClient;
