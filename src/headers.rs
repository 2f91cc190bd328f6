/// 注入头部生成模块
///
/// 中继请求改写时注入的头部块由该能力接口提供
/// 两种实现：固定头部块、按 Host 改写的模板
use std::sync::Arc;

/// Host 占位符，出现在模板中时选用按 Host 改写的实现
pub const HOST_PLACEHOLDER: &str = "%H";

/// 头部提供者能力接口
///
/// host 为探测到的原始 Host 头部值（可能缺失）
pub trait HeaderProvider: Send + Sync {
    /// 生成注入的头部块（以 \r\n 结尾，可为空字符串）
    fn headers_for(&self, host: Option<&[u8]>) -> String;
}

/// 固定头部块
pub struct FixedHeaders {
    block: String,
}

impl FixedHeaders {
    /// 创建固定头部提供者，自动补齐末尾 CRLF
    pub fn new(block: impl Into<String>) -> Self {
        Self {
            block: normalize_block(block.into()),
        }
    }
}

impl HeaderProvider for FixedHeaders {
    fn headers_for(&self, _host: Option<&[u8]>) -> String {
        self.block.clone()
    }
}

/// 按 Host 改写的头部模板
///
/// 模板中每个 %H 替换为探测到的 Host 值；未探测到时替换为空串
pub struct HostRewriteHeaders {
    template: String,
}

impl HostRewriteHeaders {
    /// 创建模板提供者，自动补齐末尾 CRLF
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: normalize_block(template.into()),
        }
    }
}

impl HeaderProvider for HostRewriteHeaders {
    fn headers_for(&self, host: Option<&[u8]>) -> String {
        let host = host
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .unwrap_or_default();
        self.template.replace(HOST_PLACEHOLDER, &host)
    }
}

/// 按配置的头部块选择提供者实现
pub fn provider_for(block: &str) -> Arc<dyn HeaderProvider> {
    if block.contains(HOST_PLACEHOLDER) {
        Arc::new(HostRewriteHeaders::new(block))
    } else {
        Arc::new(FixedHeaders::new(block))
    }
}

/// 非空头部块必须以 CRLF 结尾，否则拼接进请求时会破坏下一行
fn normalize_block(mut block: String) -> String {
    if !block.is_empty() && !block.ends_with("\r\n") {
        block.push_str("\r\n");
    }
    block
}
