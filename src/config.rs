/// 配置管理模块
///
/// 配置文件为行式键值格式：`KEY="quoted value";`
/// 条目以分号结尾，`#` 开头的条目为注释，值支持引号与反斜杠转义
use crate::error::{Result, TunnelError};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// 服务模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeMode {
    /// HTTP CONNECT 代理
    #[default]
    HttpProxy,
    /// SOCKS5 代理
    Socks5,
    /// 透明重定向（依赖操作系统原始目标地址恢复）
    Redirect,
}

impl FromStr for ServeMode {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ServeMode::HttpProxy),
            "socks5" => Ok(ServeMode::Socks5),
            "redirect" => Ok(ServeMode::Redirect),
            other => Err(TunnelError::config_error(format!(
                "unknown serve mode '{}' (expected http, socks5 or redirect)",
                other
            ))),
        }
    }
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeMode::HttpProxy => write!(f, "http"),
            ServeMode::Socks5 => write!(f, "socks5"),
            ServeMode::Redirect => write!(f, "redirect"),
        }
    }
}

/// 行式配置：字符串键到字符串值的映射
#[derive(Debug, Default, Clone)]
pub struct LineConfig {
    entries: HashMap<String, String>,
}

impl LineConfig {
    /// 从文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::config_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// 从字符串解析
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();

        for raw in text.split(';') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.starts_with('#') {
                // 注释
                continue;
            }

            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| TunnelError::config_error(format!("syntax error: '{}'", entry)))?;

            let key = key.trim();
            if key.is_empty() {
                return Err(TunnelError::config_error(format!(
                    "empty key in entry '{}'",
                    entry
                )));
            }

            entries.insert(key.to_string(), unquote(value.trim())?);
        }

        Ok(Self { entries })
    }

    /// 取值
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    /// 取值，缺失时返回空串
    pub fn get_or_empty(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    /// 覆盖或插入一个键值
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// 条目数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 去除值两侧引号并解码反斜杠转义
fn unquote(value: &str) -> Result<String> {
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                return Err(TunnelError::config_error(format!(
                    "invalid escape '\\{}' in value",
                    other
                )))
            }
            None => {
                return Err(TunnelError::config_error(
                    "dangling backslash at end of value",
                ))
            }
        }
    }

    Ok(out)
}

/// 隧道配置（启动后只读）
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// 本地监听地址
    pub local_addr: String,
    /// 中继端点地址
    pub dest_addr: String,
    /// 注入头部块（或含 %H 占位符的模板）
    pub headers: String,
    /// 中继方法白名单（逗号分隔）
    pub relay_methods: String,
    /// 服务模式
    pub mode: ServeMode,
}

impl TunnelConfig {
    /// 从行式配置构建并校验
    pub fn from_line_config(lc: &LineConfig) -> Result<Self> {
        let config = Self {
            local_addr: lc.get_or_empty("LocalAddr").to_string(),
            dest_addr: lc.get_or_empty("DestAddr").to_string(),
            headers: lc.get_or_empty("Headers").to_string(),
            relay_methods: lc.get_or_empty("RelayMethods").to_string(),
            mode: match lc.get("Mode") {
                Some(mode) => mode.parse()?,
                None => ServeMode::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验必填字段
    pub fn validate(&self) -> Result<()> {
        if self.local_addr.is_empty() {
            return Err(TunnelError::config_error("LocalAddr is required"));
        }
        if self.dest_addr.is_empty() {
            return Err(TunnelError::config_error("DestAddr is required"));
        }
        Ok(())
    }
}
