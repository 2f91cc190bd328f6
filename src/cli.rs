use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "relay-tunnel")]
#[command(author, version, about = "Local TCP tunneling proxy over a fixed HTTP relay endpoint", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "relay-tunnel.conf")]
    pub config: String,

    /// 本地监听地址（覆盖配置文件的 LocalAddr）
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// 中继端点地址（覆盖配置文件的 DestAddr）
    #[arg(long, value_name = "ADDR")]
    pub dest: Option<String>,

    /// 服务模式 (http, socks5, redirect)，覆盖配置文件的 Mode
    #[arg(long, value_parser = ["http", "socks5", "redirect"])]
    pub mode: Option<String>,

    /// 注入头部块，覆盖配置文件的 Headers
    #[arg(long, value_name = "BLOCK")]
    pub headers: Option<String>,

    /// 中继方法白名单（逗号分隔），覆盖配置文件的 RelayMethods
    #[arg(long, value_name = "METHODS")]
    pub relay_methods: Option<String>,

    /// 日志详细程度（-v info, -vv debug, -vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
