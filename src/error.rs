/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 这样可以让调用者进行更精确的错误处理和恢复
use std::io;
use thiserror::Error;

/// Relay Tunnel 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 握手失败（CONNECT 首行、SOCKS5 协商等）
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 协议错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 中继端点返回非 2xx 状态
    #[error("Relay endpoint rejected tunnel: {status_line}")]
    RelayRejected { status_line: String },

    /// 不支持的 SOCKS5 命令（BIND、UDP ASSOCIATE）
    #[error("Unsupported SOCKS5 command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// 当前平台不支持透明重定向
    #[error("Transparent redirect is not supported: {0}")]
    RedirectUnsupported(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建握手失败错误
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建中继拒绝错误
    pub fn relay_rejected(status_line: impl Into<String>) -> Self {
        Self::RelayRejected {
            status_line: status_line.into(),
        }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为握手失败
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    /// 检查是否为中继拒绝
    pub fn is_relay_rejected(&self) -> bool {
        matches!(self, Self::RelayRejected { .. })
    }
}
