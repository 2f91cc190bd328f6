/// 缓冲区池模块
///
/// 会话转发时复用固定大小的读缓冲区，避免高连接churn下的频繁分配
/// 池由顶层 TunnelClient 持有并注入，不是进程级隐藏状态
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;

/// 单个缓冲区大小（8KB）
pub const BUFFER_SIZE: usize = 8 * 1024;

/// 默认保留的空闲缓冲区上限
pub const DEFAULT_MAX_IDLE: usize = 64;

/// 可复用缓冲区池
///
/// acquire 返回的缓冲区在归还前由调用方独占；归还后内容不作任何保证
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    max_idle: usize,
}

impl BufferPool {
    /// 创建缓冲区池，空闲列表最多保留 max_idle 个缓冲区
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    /// 使用默认上限创建
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_MAX_IDLE)
    }

    /// 取出一个缓冲区（池空时新分配）
    ///
    /// 返回的 PooledBuf 在 drop 时自动归还缓冲区
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_SIZE));
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// 当前空闲缓冲区数量（测试断言池无泄漏用）
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
        // 池已满则直接丢弃
    }
}

/// 已借出的缓冲区（RAII 模式）
///
/// drop 时自动清空并归还到池，覆盖所有退出路径
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// 获取内部缓冲区的可变引用
    pub fn as_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer already released")
    }

    /// 获取内部缓冲区的引用
    pub fn as_ref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer already released")
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
