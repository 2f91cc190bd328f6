/// 前端接入模块
///
/// 把一条刚接受的连接按配置的服务模式协商成
/// （目标地址，握手残留字节，可交给会话泵的连接）
use crate::error::{Result, TunnelError};
use crate::redirect::OriginalDstResolver;
use crate::socks5::{self, Socks5Command};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// 协议解析超时时间（防止慢速攻击）
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP 握手缓冲区大小
const CONNECT_PARSE_BUFFER_SIZE: usize = 16 * 1024;

/// 握手结果
#[derive(Debug)]
pub struct Accepted {
    /// 目标地址 host:port
    pub target: String,
    /// 握手缓冲中多读到的字节，会话泵必须先处理它们再读套接字
    pub leftover: Vec<u8>,
}

/// HTTP CONNECT 前端
///
/// 读取首行并要求恰好 3 个字段且方法为 CONNECT，
/// 成功后写回 200 应答并丢弃其余头部行直到空行
pub async fn accept_http_connect<S>(stream: &mut S) -> Result<Accepted>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, handshake_http_connect(stream))
        .await
        .map_err(|_| TunnelError::timeout(HANDSHAKE_TIMEOUT))?
}

async fn handshake_http_connect<S>(stream: &mut S) -> Result<Accepted>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CONNECT_PARSE_BUFFER_SIZE];
    let mut pos = 0;

    // 读取请求行
    let line_end = loop {
        if let Some(i) = find(&buffer[..pos], b"\r\n") {
            break i;
        }
        if pos >= buffer.len() {
            return Err(TunnelError::handshake("CONNECT request line too long"));
        }
        let n = stream.read(&mut buffer[pos..]).await?;
        if n == 0 {
            return Err(TunnelError::handshake(
                "unexpected EOF while reading CONNECT request",
            ));
        }
        pos += n;
    };

    // 解析首行：恰好 3 个字段
    let (target, version) = {
        let first_line = &buffer[..line_end];
        let fields: Vec<&[u8]> = first_line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() != 3 {
            return Err(TunnelError::handshake(format!(
                "unknown first line: {}",
                String::from_utf8_lossy(first_line)
            )));
        }
        if fields[0] != b"CONNECT" {
            return Err(TunnelError::handshake(format!(
                "unknown method: {}",
                String::from_utf8_lossy(fields[0])
            )));
        }
        (
            String::from_utf8_lossy(fields[1]).into_owned(),
            String::from_utf8_lossy(fields[2]).into_owned(),
        )
    };

    // 请求行校验通过即应答，其余头部行随后排空
    let response = format!(
        "{} 200 Connection established\r\nConnection: keep-alive\r\n\r\n",
        version
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    // 排空头部直到空行
    let header_end = loop {
        if let Some(i) = find(&buffer[..pos], b"\r\n\r\n") {
            break i;
        }
        if pos >= buffer.len() {
            return Err(TunnelError::handshake("CONNECT request too long"));
        }
        let n = stream.read(&mut buffer[pos..]).await?;
        if n == 0 {
            return Err(TunnelError::handshake(
                "unexpected EOF while reading CONNECT headers",
            ));
        }
        pos += n;
    };

    // 空行之后多读到的字节是客户端流水线数据，原样交给会话泵
    let leftover = buffer[header_end + 4..pos].to_vec();

    Ok(Accepted { target, leftover })
}

/// SOCKS5 前端
///
/// 仅接受 CONNECT 命令；BIND、UDP ASSOCIATE 与未知命令字节
/// 都写回“命令不支持”后关闭，绝不转发任何字节
pub async fn accept_socks5<S>(stream: &mut S) -> Result<Accepted>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, handshake_socks5(stream))
        .await
        .map_err(|_| TunnelError::timeout(HANDSHAKE_TIMEOUT))?
}

async fn handshake_socks5<S>(stream: &mut S) -> Result<Accepted>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    socks5::negotiate(stream).await?;
    let request = match socks5::read_request(stream).await {
        Ok(request) => request,
        Err(e @ TunnelError::UnsupportedCommand(_)) => {
            // 未知命令字节同样先写回拒绝应答再关闭
            socks5::write_reply(stream, socks5::REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match request.command {
        Socks5Command::Connect => {
            socks5::write_reply(stream, socks5::REPLY_SUCCEEDED).await?;
            Ok(Accepted {
                target: request.target,
                leftover: Vec::new(),
            })
        }
        Socks5Command::Bind => {
            socks5::write_reply(stream, socks5::REPLY_COMMAND_NOT_SUPPORTED).await?;
            Err(TunnelError::UnsupportedCommand(0x02))
        }
        Socks5Command::UdpAssociate => {
            socks5::write_reply(stream, socks5::REPLY_COMMAND_NOT_SUPPORTED).await?;
            Err(TunnelError::UnsupportedCommand(0x03))
        }
    }
}

/// 透明重定向前端
///
/// 通过系统能力恢复原始目标地址，之后复用会话泵统一的
/// （连接，目标地址）契约
pub fn accept_redirect(
    stream: &TcpStream,
    resolver: &dyn OriginalDstResolver,
) -> Result<Accepted> {
    let dst = resolver.original_dst(stream)?;
    Ok(Accepted {
        target: dst.to_string(),
        leftover: Vec::new(),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
