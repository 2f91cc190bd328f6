/// 隧道客户端（监听服务）模块
///
/// 持有进程级只读配置与注入的池、探测器、解析器，
/// 接受循环里按服务模式显式分发到对应前端，再交给会话泵
use crate::acceptor::{self, Accepted};
use crate::buffer_pool::BufferPool;
use crate::config::{ServeMode, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::headers::{self, HeaderProvider};
use crate::redirect::{OriginalDstResolver, SystemResolver};
use crate::relay::RelayDetector;
use crate::session::{run_session, SessionContext};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 隧道客户端：启动后只读，会话工厂
pub struct TunnelClient {
    config: TunnelConfig,
    ctx: Arc<SessionContext>,
    resolver: Arc<dyn OriginalDstResolver>,
}

impl TunnelClient {
    /// 按配置创建，使用默认缓冲区池与系统重定向解析器
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_pool(config, BufferPool::with_defaults())
    }

    /// 注入缓冲区池创建（测试可换成确定性实现）
    pub fn with_pool(config: TunnelConfig, pool: Arc<BufferPool>) -> Self {
        let provider: Arc<dyn HeaderProvider> = headers::provider_for(&config.headers);
        let detector = Arc::new(RelayDetector::from_method_list(
            &config.relay_methods,
            Arc::clone(&provider),
        ));
        let ctx = Arc::new(SessionContext {
            dest_addr: config.dest_addr.clone(),
            detector,
            provider,
            pool,
        });

        Self {
            config,
            ctx,
            resolver: Arc::new(SystemResolver::new()),
        }
    }

    /// 替换重定向解析器（测试注入用）
    pub fn with_resolver(mut self, resolver: Arc<dyn OriginalDstResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// 当前缓冲区池（测试断言基线用）
    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.ctx.pool)
    }

    /// 监听并服务，直到监听器失效
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.local_addr)
            .await
            .map_err(|e| TunnelError::connection_failed(&self.config.local_addr, e))?;

        info!(
            "Listening on {} (mode: {}, relay endpoint: {})",
            self.config.local_addr, self.config.mode, self.config.dest_addr
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }

                    let mode = self.config.mode;
                    let ctx = Arc::clone(&self.ctx);
                    let resolver = Arc::clone(&self.resolver);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, mode, ctx, resolver).await {
                            error!("Connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// 处理一条接受的连接：前端握手，然后交给会话泵
async fn handle_connection(
    mut stream: TcpStream,
    mode: ServeMode,
    ctx: Arc<SessionContext>,
    resolver: Arc<dyn OriginalDstResolver>,
) -> Result<()> {
    // 显式分发，不存在可误入的默认分支
    let Accepted { target, leftover } = match mode {
        ServeMode::HttpProxy => acceptor::accept_http_connect(&mut stream).await?,
        ServeMode::Socks5 => acceptor::accept_socks5(&mut stream).await?,
        ServeMode::Redirect => acceptor::accept_redirect(&stream, resolver.as_ref())?,
    };

    info!("Session opened for target {}", target);
    run_session(stream, target, leftover, ctx).await
}
