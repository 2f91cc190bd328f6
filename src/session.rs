/// 会话泵模块
///
/// 接管握手完成的客户端连接，负责一个会话从交接到终止的完整生命周期：
/// 懒建立 direct 与 relay 两条上游连接，逐块探测中继请求，
/// 并在任一条腿失败或关闭时整体拆除会话，不泄漏套接字与缓冲区
use crate::buffer_pool::{BufferPool, BUFFER_SIZE};
use crate::error::{Result, TunnelError};
use crate::headers::HeaderProvider;
use crate::relay::{RelayDetector, RelayScan, MAX_HEADER_SIZE};
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// 上游拨号超时
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
/// Keepalive 探测间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// 会话共享的只读配置
pub struct SessionContext {
    /// 中继端点地址
    pub dest_addr: String,
    /// 中继协议探测器
    pub detector: Arc<RelayDetector>,
    /// 注入头部提供者
    pub provider: Arc<dyn HeaderProvider>,
    /// 缓冲区池
    pub pool: Arc<BufferPool>,
}

/// 运行一个会话直到终止
///
/// leftover 为前端握手多读到的字节，会先于套接字数据被处理
pub async fn run_session(
    client: TcpStream,
    target: String,
    leftover: Vec<u8>,
    ctx: Arc<SessionContext>,
) -> Result<()> {
    let (client_read, client_write) = client.into_split();
    let client_write = Arc::new(Mutex::new(client_write));
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(4);

    let mut session = Session {
        ctx,
        target,
        client_write: Arc::clone(&client_write),
        tasks: JoinSet::new(),
        shutdown_tx,
        direct: None,
        relay: None,
    };

    let result = session.pump(client_read, leftover, shutdown_rx).await;

    // 收尾：先半关闭上游写端，复制任务会观察到上游关闭而退出
    if let Some(mut direct) = session.direct.take() {
        let _ = direct.shutdown().await;
    }
    if let Some(mut relay) = session.relay.take() {
        let _ = relay.shutdown().await;
    }

    if result.is_ok() {
        // 客户端正常半关闭：等复制任务排空在途的响应字节后才关客户端写端
        while session.tasks.join_next().await.is_some() {}
    } else {
        // 出错拆除：直接中止任务组
        session.tasks.shutdown().await;
    }

    {
        let mut writer = client_write.lock().await;
        let _ = writer.shutdown().await;
    }

    result
}

struct Session {
    ctx: Arc<SessionContext>,
    target: String,
    client_write: Arc<Mutex<OwnedWriteHalf>>,
    tasks: JoinSet<()>,
    shutdown_tx: broadcast::Sender<()>,
    direct: Option<OwnedWriteHalf>,
    relay: Option<OwnedWriteHalf>,
}

impl Session {
    /// 客户端读循环：探测、分发、计数转发
    async fn pump(
        &mut self,
        mut client_read: OwnedReadHalf,
        leftover: Vec<u8>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let detector = Arc::clone(&self.ctx.detector);
        let mut read_buf = self.ctx.pool.acquire();
        read_buf.resize(BUFFER_SIZE, 0);

        // 探测缓冲：握手残留以及探测器要求累积的数据
        let mut pending = BytesMut::from(&leftover[..]);

        loop {
            // 先处理已累积的数据
            while !pending.is_empty() {
                let scan = detector.scan(&pending);
                match scan {
                    RelayScan::NeedMore => {
                        if pending.len() <= MAX_HEADER_SIZE {
                            // 头部未完整，读到更多数据后重新探测
                            break;
                        }
                        // 累积超限仍无头部结束标记，降级为普通转发
                        debug!(
                            "relay detection buffer exceeded {} bytes, falling back to passthrough",
                            MAX_HEADER_SIZE
                        );
                        let chunk = pending.split();
                        self.forward_direct(&chunk).await?;
                    }
                    RelayScan::Passthrough => {
                        let chunk = pending.split();
                        self.forward_direct(&chunk).await?;
                    }
                    RelayScan::Relay {
                        remaining,
                        rewritten,
                    } => {
                        pending.clear();
                        self.ensure_relay().await?;
                        let relay = self.relay.as_mut().expect("relay leg just created");
                        relay.write_all(&rewritten).await?;

                        // 按 Content-Length 精确转发剩余主体，
                        // 主体字节绝不再进入头部探测
                        let mut remaining = remaining;
                        while remaining > 0 {
                            let n = client_read.read(&mut read_buf[..]).await?;
                            if n == 0 {
                                return Err(TunnelError::protocol(
                                    "client closed before relay body was complete",
                                ));
                            }
                            relay.write_all(&read_buf[..n]).await?;
                            remaining -= n as i64;
                        }
                    }
                }
            }

            // 读下一块，或响应后台复制任务的关闭信号
            let n = tokio::select! {
                read = client_read.read(&mut read_buf[..]) => read?,
                _ = shutdown_rx.recv() => {
                    debug!("session shutdown signalled by copy task");
                    return Ok(());
                }
            };

            if n == 0 {
                // 客户端 EOF；残留的未完整头部按普通数据冲刷
                if !pending.is_empty() {
                    let chunk = pending.split();
                    self.forward_direct(&chunk).await?;
                }
                return Ok(());
            }

            pending.extend_from_slice(&read_buf[..n]);
        }
    }

    /// 普通数据：确保 direct 腿存在后原样写出
    async fn forward_direct(&mut self, chunk: &[u8]) -> Result<()> {
        self.ensure_direct().await?;
        let direct = self.direct.as_mut().expect("direct leg just created");
        direct.write_all(chunk).await?;
        Ok(())
    }

    /// 懒建立 direct 腿：拨号并完成到中继端点的 CONNECT 式握手
    async fn ensure_direct(&mut self) -> Result<()> {
        if self.direct.is_some() {
            return Ok(());
        }

        let stream = dial_upstream(&self.ctx.dest_addr).await?;
        let (stream, residual) = self.connect_handshake(stream).await?;

        let (upstream_read, upstream_write) = stream.into_split();
        self.spawn_copy(upstream_read, residual, "direct");
        self.direct = Some(upstream_write);

        info!("direct leg established to {}", self.ctx.dest_addr);
        Ok(())
    }

    /// 懒建立 relay 腿：中继端点对白名单方法直接说 HTTP，无 CONNECT 前导
    async fn ensure_relay(&mut self) -> Result<()> {
        if self.relay.is_some() {
            return Ok(());
        }

        let stream = dial_upstream(&self.ctx.dest_addr).await?;
        let (upstream_read, upstream_write) = stream.into_split();
        self.spawn_copy(upstream_read, Vec::new(), "relay");
        self.relay = Some(upstream_write);

        info!("relay leg established to {}", self.ctx.dest_addr);
        Ok(())
    }

    /// 到中继端点的 CONNECT 式握手
    ///
    /// 发送合成的 `CONNECT <target> HTTP/1.0` 请求与注入头部，
    /// 校验状态码以 2 开头；非 2xx 时把状态行原样转回客户端后终止会话。
    /// 返回握手后多读到的响应字节（属于隧道数据，须转给客户端）
    async fn connect_handshake(&self, mut stream: TcpStream) -> Result<(TcpStream, Vec<u8>)> {
        let headers = self.ctx.provider.headers_for(None);
        let request = format!("CONNECT {} HTTP/1.0\r\n{}\r\n", self.target, headers);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        // 读取响应直到头部结束标记
        let mut buffer = vec![0u8; MAX_HEADER_SIZE];
        let mut pos = 0;
        let header_end = loop {
            if pos >= buffer.len() {
                return Err(TunnelError::protocol("relay CONNECT response too long"));
            }
            let n = stream.read(&mut buffer[pos..]).await?;
            if n == 0 {
                return Err(TunnelError::protocol(
                    "relay endpoint closed during CONNECT handshake",
                ));
            }
            pos += n;
            if let Some(i) = find(&buffer[..pos], b"\r\n\r\n") {
                break i;
            }
        };

        let line_end = find(&buffer[..pos], b"\r\n").unwrap_or(header_end);
        let status_line = String::from_utf8_lossy(&buffer[..line_end]).into_owned();

        let code = status_line
            .split_ascii_whitespace()
            .nth(1)
            .ok_or_else(|| {
                TunnelError::protocol(format!("malformed relay status line: {}", status_line))
            })?;

        if !code.starts_with('2') {
            // 透明转发失败：状态行原样交给客户端，然后终止
            warn!("relay endpoint rejected CONNECT: {}", status_line);
            let mut writer = self.client_write.lock().await;
            let _ = writer
                .write_all(format!("{}\r\n\r\n", status_line).as_bytes())
                .await;
            return Err(TunnelError::relay_rejected(status_line));
        }

        let residual = buffer[header_end + 4..pos].to_vec();
        Ok((stream, residual))
    }

    /// 启动一条上游到客户端的后台复制任务
    ///
    /// 任务持有自己的池化缓冲区，退出时发出关闭信号；
    /// 会话终止路径会等待任务组排空，任务绝不比其套接字活得更久
    fn spawn_copy(&mut self, mut upstream_read: OwnedReadHalf, initial: Vec<u8>, leg: &'static str) {
        let client_write = Arc::clone(&self.client_write);
        let pool = Arc::clone(&self.ctx.pool);
        let shutdown_tx = self.shutdown_tx.clone();

        self.tasks.spawn(async move {
            let mut buf = pool.acquire();
            buf.resize(BUFFER_SIZE, 0);

            if !initial.is_empty() {
                let mut writer = client_write.lock().await;
                if writer.write_all(&initial).await.is_err() {
                    let _ = shutdown_tx.send(());
                    return;
                }
            }

            loop {
                match upstream_read.read(&mut buf[..]).await {
                    Ok(0) => {
                        debug!("{} upstream closed", leg);
                        break;
                    }
                    Ok(n) => {
                        let mut writer = client_write.lock().await;
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            debug!("{} to client write error: {}", leg, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("{} upstream read error: {}", leg, e);
                        break;
                    }
                }
            }

            let _ = shutdown_tx.send(());
        });
    }
}

/// 拨号上游并应用 TCP 选项
async fn dial_upstream(addr: &str) -> Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::timeout(DIAL_TIMEOUT))?
        .map_err(|e| TunnelError::connection_failed(addr, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on upstream: {}", e);
    }
    apply_keepalive(&stream);

    Ok(stream)
}

fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive on upstream: {}", e);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
