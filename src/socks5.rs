use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS 协议版本
pub const SOCKS_VERSION: u8 = 0x05;
/// 无认证方法
pub const METHOD_NO_AUTH: u8 = 0x00;
/// CONNECT 命令
pub const CMD_CONNECT: u8 = 0x01;
/// 成功状态
pub const REPLY_SUCCEEDED: u8 = 0x00;
/// 一般服务器错误状态
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// CONNECT 请求中的目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(IpAddr),
    Domain(String),
}

impl TargetAddr {
    /// 用于分流判定和拨号的主机串
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(ip) => ip.to_string(),
            TargetAddr::Domain(domain) => domain.clone(),
        }
    }
}

/// 解析后的 CONNECT 请求
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub target: TargetAddr,
    pub port: u16,
}

/// 处理客户端问候：校验版本并应答无认证
///
/// 问候格式：
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
pub async fn handle_greeting<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        bail!("SOCKS 版本不正确: 0x{:02x}", header[0]);
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    // 只支持无认证
    stream
        .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
        .await?;

    Ok(())
}

/// 读取并解析 CONNECT 请求
///
/// 请求格式：
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
///
/// 只接受 CONNECT；BIND 和 UDP ASSOCIATE 不支持。
pub async fn read_connect_request<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        bail!("请求版本不正确: 0x{:02x}", header[0]);
    }
    if header[1] != CMD_CONNECT {
        bail!("不支持的命令: 0x{:02x}", header[1]);
    }

    let target = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetAddr::Ip(IpAddr::V4(Ipv4Addr::from(addr)))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;
            if len == 0 {
                bail!("域名长度为 0");
            }
            let mut domain_buf = vec![0u8; len];
            stream.read_exact(&mut domain_buf).await?;
            let domain = String::from_utf8(domain_buf)
                .map_err(|_| anyhow::anyhow!("域名不是合法 UTF-8"))?;
            TargetAddr::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetAddr::Ip(IpAddr::V6(Ipv6Addr::from(addr)))
        }
        atyp => bail!("不支持的地址类型: 0x{:02x}", atyp),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(ConnectRequest { target, port })
}

/// 发送成功应答
///
/// 绑定地址对客户端没有意义，回传环回假地址。
pub async fn send_success_reply<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS_VERSION,
        REPLY_SUCCEEDED,
        0x00,
        ATYP_IPV4,
        127,
        0,
        0,
        1,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

/// 发送一般失败应答
pub async fn send_failure_reply<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS_VERSION,
        REPLY_GENERAL_FAILURE,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}
