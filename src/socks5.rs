/// SOCKS5 协议原语模块
///
/// 提供方法协商、请求解析与应答编码；核心只消费
/// “解析一个客户端请求；写回一个应答”这两个能力
use crate::error::{Result, TunnelError};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 协议版本
pub const SOCKS_VERSION: u8 = 0x05;

/// 无认证方法
pub const METHOD_NO_AUTH: u8 = 0x00;
/// 无可接受方法
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 应答：成功
pub const REPLY_SUCCEEDED: u8 = 0x00;
/// 应答：命令不支持
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 命令
///
/// 显式变体，未知命令字节在解析时即报错，不存在可误入的默认分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Socks5Command {
    /// 从命令字节解析
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Socks5Command::Connect),
            0x02 => Ok(Socks5Command::Bind),
            0x03 => Ok(Socks5Command::UdpAssociate),
            other => Err(TunnelError::UnsupportedCommand(other)),
        }
    }
}

/// 已解析的 SOCKS5 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    /// 请求命令
    pub command: Socks5Command,
    /// 目标地址 host:port
    pub target: String,
}

/// 方法协商：只接受版本 5，始终选择无认证
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(TunnelError::handshake(format!(
            "unsupported SOCKS version: {}",
            header[0]
        )));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(TunnelError::handshake("empty SOCKS5 method list"));
    }

    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(TunnelError::handshake(
            "client does not offer the no-authentication method",
        ));
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// 读取一个 SOCKS5 请求
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(TunnelError::handshake(format!(
            "invalid SOCKS5 request version: {}",
            head[0]
        )));
    }

    let command = Socks5Command::from_byte(head[1])?;

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let len = len[0] as usize;
            if len == 0 {
                return Err(TunnelError::handshake("empty SOCKS5 domain name"));
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| TunnelError::handshake("SOCKS5 domain name is not valid UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            // IPv6 字面量带端口时需要方括号
            format!("[{}]", Ipv6Addr::from(addr))
        }
        other => {
            return Err(TunnelError::handshake(format!(
                "unsupported SOCKS5 address type: {}",
                other
            )))
        }
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(Socks5Request {
        command,
        target: format!("{}:{}", host, port),
    })
}

/// 写回应答，绑定地址固定为 0.0.0.0:0
pub async fn write_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = [
        SOCKS_VERSION,
        reply,
        0x00,      // RSV
        ATYP_IPV4, // BND.ADDR 类型
        0,
        0,
        0,
        0, // BND.ADDR = 0.0.0.0
        0,
        0, // BND.PORT = 0
    ];
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiate_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_wrong_version() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = negotiate(&mut server).await.unwrap_err();
        assert!(err.is_handshake());
    }

    #[tokio::test]
    async fn test_negotiate_no_acceptable_method() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // 客户端只提供用户名/密码认证
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let err = negotiate(&mut server).await.unwrap_err();
        assert!(err.is_handshake());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_read_request_ipv4_connect() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50])
            .await
            .unwrap();
        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.command, Socks5Command::Connect);
        assert_eq!(req.target, "93.184.216.34:80");
    }

    #[tokio::test]
    async fn test_read_request_domain() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut msg = vec![0x05, 0x01, 0x00, 0x03, 11];
        msg.extend_from_slice(b"example.com");
        msg.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&msg).await.unwrap();

        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.target, "example.com:443");
    }

    #[tokio::test]
    async fn test_read_request_ipv6() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut msg = vec![0x05, 0x01, 0x00, 0x04];
        msg.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        msg.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&msg).await.unwrap();

        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.target, "[::1]:8080");
    }

    #[tokio::test]
    async fn test_read_request_bind_parsed_as_bind() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();
        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.command, Socks5Command::Bind);
    }

    #[tokio::test]
    async fn test_unknown_command_rejected_at_parse() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client
            .write_all(&[0x05, 0x09, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let err = read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedCommand(0x09)));
    }

    #[tokio::test]
    async fn test_write_reply() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_reply(&mut server, REPLY_SUCCEEDED).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
