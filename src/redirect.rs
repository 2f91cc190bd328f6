/// 透明重定向模块
///
/// 通过操作系统能力恢复被防火墙重定向连接的原始目标地址
/// 仅 Linux 提供该原语（SO_ORIGINAL_DST），其余平台统一快速失败，
/// 保证 ServeMode 枚举在所有平台上形态一致
use crate::error::{Result, TunnelError};
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// 原始目标地址解析能力
pub trait OriginalDstResolver: Send + Sync {
    /// 恢复连接在重定向前的目标地址
    fn original_dst(&self, stream: &TcpStream) -> Result<SocketAddr>;
}

/// 系统解析器：Linux 上查询 SO_ORIGINAL_DST，其余平台返回错误
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

impl OriginalDstResolver for SystemResolver {
    #[cfg(target_os = "linux")]
    fn original_dst(&self, stream: &TcpStream) -> Result<SocketAddr> {
        // 仅支持 IPv4 的重定向恢复
        if !stream.local_addr()?.is_ipv4() {
            return Err(TunnelError::RedirectUnsupported(
                "original destination recovery is IPv4 only".to_string(),
            ));
        }
        linux::original_dst_v4(stream)
    }

    #[cfg(not(target_os = "linux"))]
    fn original_dst(&self, _stream: &TcpStream) -> Result<SocketAddr> {
        Err(TunnelError::RedirectUnsupported(
            "SO_ORIGINAL_DST is only available on Linux".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::io::Error;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;

    /// 查询 iptables REDIRECT 保存的原始 IPv4 目标地址
    pub fn original_dst_v4(stream: &TcpStream) -> Result<SocketAddr> {
        let fd = stream.as_raw_fd();

        unsafe {
            let mut target_addr: libc::sockaddr_in = mem::zeroed();
            let mut target_addr_len = mem::size_of_val(&target_addr) as libc::socklen_t;

            let ret = libc::getsockopt(
                fd,
                libc::SOL_IP,
                libc::SO_ORIGINAL_DST,
                &mut target_addr as *mut _ as *mut _,
                &mut target_addr_len,
            );
            if ret != 0 {
                return Err(TunnelError::Io(Error::last_os_error()));
            }

            // sockaddr_in 字段为网络字节序
            let ip = Ipv4Addr::from(u32::from_be(target_addr.sin_addr.s_addr));
            let port = u16::from_be(target_addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn test_unsupported_platform_fails_fast() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(client);

        let err = SystemResolver::new().original_dst(&server).unwrap_err();
        assert!(matches!(err, TunnelError::RedirectUnsupported(_)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_plain_connection_resolution() {
        // 未经过 REDIRECT 规则的连接：conntrack 可用时返回连接自身的目标地址，
        // conntrack 不可用时 getsockopt 报错，两者都是合法结果
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        match SystemResolver::new().original_dst(&server) {
            Ok(dst) => assert_eq!(dst, addr),
            Err(e) => assert!(matches!(e, TunnelError::Io(_))),
        }
    }
}
