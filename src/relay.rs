/// 中继协议探测模块
///
/// 对隧道内的客户端字节流按块探测白名单 HTTP 方法的请求，
/// 命中时在请求行之后拼入注入头部，并按 Content-Length 计算剩余主体字节数，
/// 供会话泵把主体原样转发到中继连接而不再误解析
use crate::headers::HeaderProvider;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// 探测缓冲上限（头部未完整时最多累积的字节数）
///
/// 超过该上限仍未出现头部结束标记时降级为普通转发
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// 单次探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayScan {
    /// 不是中继请求，原样转发
    Passthrough,
    /// 以白名单方法开头但头部尚未完整，需要累积更多数据后重新探测
    NeedMore,
    /// 中继请求：改写后的数据块与剩余主体字节数（-1 表示长度未知）
    Relay { remaining: i64, rewritten: Bytes },
}

/// 中继协议探测器
///
/// 无状态，逐块调用；方法白名单与头部提供者为进程级只读配置
pub struct RelayDetector {
    methods: Vec<String>,
    provider: Arc<dyn HeaderProvider>,
}

impl RelayDetector {
    /// 创建探测器；方法名会去除首尾空白，空白名单表示禁用探测
    pub fn new(methods: impl IntoIterator<Item = String>, provider: Arc<dyn HeaderProvider>) -> Self {
        let methods = methods
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        Self { methods, provider }
    }

    /// 从逗号分隔的方法列表创建
    pub fn from_method_list(list: &str, provider: Arc<dyn HeaderProvider>) -> Self {
        Self::new(list.split(',').map(|s| s.to_string()), provider)
    }

    /// 白名单是否为空
    pub fn is_disabled(&self) -> bool {
        self.methods.is_empty()
    }

    /// 数据块是否以白名单方法加空格开头（HTTP 方法区分大小写）
    fn matches_method(&self, data: &[u8]) -> bool {
        self.methods
            .iter()
            .any(|m| data.len() > m.len() && data.starts_with(m.as_bytes()) && data[m.len()] == b' ')
    }

    /// 探测一个数据块
    ///
    /// 返回 NeedMore 时调用方应累积数据后重新调用（上限 MAX_HEADER_SIZE）
    pub fn scan(&self, data: &[u8]) -> RelayScan {
        if !self.matches_method(data) {
            return RelayScan::Passthrough;
        }

        // 请求行结束位置
        let line_end = match find(data, CRLF) {
            Some(i) => i,
            None => return RelayScan::NeedMore,
        };

        // 请求行必须恰好 3 个字段，否则不是 HTTP 请求行
        let fields = data[..line_end]
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|f| !f.is_empty())
            .count();
        if fields != 3 {
            return RelayScan::Passthrough;
        }

        // 头部结束标记
        let headers_start = line_end + CRLF.len();
        let end_rel = match find(&data[headers_start..], HEADER_END) {
            Some(i) => i,
            None => return RelayScan::NeedMore,
        };
        let body_start = headers_start + end_rel + HEADER_END.len();

        // 扫描头部行：第一个 Content-Length 生效，同时捕获 Host
        let mut content_length: i64 = -1;
        let mut host: Option<&[u8]> = None;
        for line in data[headers_start..headers_start + end_rel].split_str(CRLF) {
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = trim_ascii(&line[..colon]);
            let value = trim_ascii(&line[colon + 1..]);
            if content_length < 0 && name.eq_ignore_ascii_case(b"Content-Length") {
                if let Some(n) = parse_content_length(value) {
                    content_length = n;
                }
            }
            if host.is_none() && name.eq_ignore_ascii_case(b"Host") {
                host = Some(value);
            }
            if host.is_some() && content_length >= 0 {
                break;
            }
        }

        // 在请求行之后拼入注入头部，其余字节原样保留
        let injected = self.provider.headers_for(host);
        let mut rewritten = BytesMut::with_capacity(data.len() + injected.len());
        rewritten.put_slice(&data[..headers_start]);
        rewritten.put_slice(injected.as_bytes());
        rewritten.put_slice(&data[headers_start..]);

        // 未检测到 Content-Length：主体长度未知，不做精确计数
        let remaining = if content_length < 0 {
            -1
        } else {
            content_length - (data.len() - body_start) as i64
        };

        RelayScan::Relay {
            remaining,
            rewritten: rewritten.freeze(),
        }
    }
}

/// 子切片查找（等价 bytes.Index）
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_ascii(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !b.is_ascii_whitespace());
    match start {
        Some(start) => {
            let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap_or(start);
            &s[start..=end]
        }
        None => &[],
    }
}

fn parse_content_length(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.parse::<i64>().ok()
}

/// 按分隔子串切分的迭代器辅助 trait
trait SplitStr {
    fn split_str<'a>(&'a self, sep: &'a [u8]) -> SplitStrIter<'a>;
}

impl SplitStr for [u8] {
    fn split_str<'a>(&'a self, sep: &'a [u8]) -> SplitStrIter<'a> {
        SplitStrIter {
            data: Some(self),
            sep,
        }
    }
}

struct SplitStrIter<'a> {
    data: Option<&'a [u8]>,
    sep: &'a [u8],
}

impl<'a> Iterator for SplitStrIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let data = self.data?;
        match find(data, self.sep) {
            Some(i) => {
                self.data = Some(&data[i + self.sep.len()..]);
                Some(&data[..i])
            }
            None => {
                self.data = None;
                Some(data)
            }
        }
    }
}
