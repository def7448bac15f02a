use anyhow::{bail, Result};
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// HTTPS/SVCB 记录类型
pub const TYPE_HTTPS: u16 = 65;
/// A 记录类型
pub const TYPE_A: u16 = 1;
/// AAAA 记录类型
pub const TYPE_AAAA: u16 = 28;
/// EDNS0 OPT 伪记录类型
const TYPE_OPT: u16 = 41;
/// IN 类
const CLASS_IN: u16 = 1;

/// 查询构造选项
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// 是否附加 EDNS0 OPT 伪记录
    pub edns: bool,
    /// EDNS0 UDP 载荷大小
    pub udp_payload: u16,
    /// 是否请求 DNSSEC 验证（DO 位）
    pub dnssec: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            edns: true,
            udp_payload: 1232,
            dnssec: false,
        }
    }
}

/// 构造一条标准 DNS 查询报文
///
/// 12 字节头部（随机 ID，RD=1，QDCOUNT=1），一个问题，
/// 可选的 EDNS0 OPT 伪记录（此时 ARCOUNT=1）。
pub fn build_query(domain: &str, qtype: u16, opts: &QueryOptions) -> Result<Vec<u8>> {
    let id: u16 = rand::thread_rng().gen();
    build_query_with_id(domain, qtype, opts, id)
}

/// 指定 ID 的查询构造（测试用）
pub fn build_query_with_id(
    domain: &str,
    qtype: u16,
    opts: &QueryOptions,
    id: u16,
) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(domain.len() + 32);

    // 头部
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    let arcount: u16 = if opts.edns { 1 } else { 0 };
    msg.extend_from_slice(&arcount.to_be_bytes());

    // QNAME：长度前缀标签序列
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            bail!("无效的域名标签: {:?}", domain);
        }
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);

    msg.extend_from_slice(&qtype.to_be_bytes());
    msg.extend_from_slice(&CLASS_IN.to_be_bytes());

    // EDNS0 OPT 伪记录：NAME=根，CLASS 字段承载 UDP 载荷大小，
    // TTL 第三字节最高位是 DO 位
    if opts.edns {
        msg.push(0); // 根名
        msg.extend_from_slice(&TYPE_OPT.to_be_bytes());
        msg.extend_from_slice(&opts.udp_payload.to_be_bytes());
        let do_byte: u8 = if opts.dnssec { 0x80 } else { 0 };
        msg.extend_from_slice(&[0, 0, do_byte, 0]);
        msg.extend_from_slice(&0u16.to_be_bytes()); // RDLENGTH
    }

    Ok(msg)
}

/// 一条已解析的资源记录
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// 解析后的 HTTPS/SVCB 记录
///
/// priority 为 0 表示 service 模式（无别名目标）；
/// 非 0 表示 alias 模式，target_name 按标准 DNS 名字编码解析。
#[derive(Debug, Clone)]
pub struct HttpsRecord {
    pub priority: u16,
    pub target_name: Option<String>,
    /// SvcParam 原始值，键为规范名（未知键为 `key<N>`）
    pub params: HashMap<String, Vec<u8>>,
    /// key 5（ech）的原始值
    pub ech_config_list: Option<Vec<u8>>,
}

impl HttpsRecord {
    /// ALPN 协议列表（key 1）
    pub fn alpn(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(value) = self.params.get("alpn") {
            let mut pos = 0;
            while pos < value.len() {
                let len = value[pos] as usize;
                pos += 1;
                if pos + len > value.len() {
                    break;
                }
                if let Ok(s) = std::str::from_utf8(&value[pos..pos + len]) {
                    out.push(s.to_string());
                }
                pos += len;
            }
        }
        out
    }

    /// 端口（key 3）
    pub fn port(&self) -> Option<u16> {
        let value = self.params.get("port")?;
        if value.len() != 2 {
            return None;
        }
        Some(u16::from_be_bytes([value[0], value[1]]))
    }

    /// IPv4 提示地址（key 4）
    pub fn ipv4_hints(&self) -> Vec<Ipv4Addr> {
        self.params
            .get("ipv4hint")
            .map(|v| {
                v.chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// IPv6 提示地址（key 6）
    pub fn ipv6_hints(&self) -> Vec<Ipv6Addr> {
        self.params
            .get("ipv6hint")
            .map(|v| {
                v.chunks_exact(16)
                    .map(|c| {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(c);
                        Ipv6Addr::from(bytes)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// 解析后的 DNS 应答
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub answers: Vec<ResourceRecord>,
    /// 应答中按顺序解码成功的 HTTPS 记录
    pub https_records: Vec<HttpsRecord>,
}

/// 解析 DoH 应答报文
///
/// 坏记录跳过不致命：RDLENGTH 可读时按其长度重新同步到下一条记录，
/// RDLENGTH 本身不可读时放弃剩余部分。
pub fn parse_response(msg: &[u8]) -> Result<DnsResponse> {
    if msg.len() < 12 {
        bail!("DNS 报文不足 12 字节头部");
    }

    let id = u16::from_be_bytes([msg[0], msg[1]]);
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);

    let mut pos = 12;

    // 跳过问题区：QNAME + QTYPE + QCLASS
    for _ in 0..qdcount {
        let (_, next) = read_name(msg, pos).ok_or_else(|| anyhow::anyhow!("问题区名字损坏"))?;
        pos = next + 4;
        if pos > msg.len() {
            bail!("问题区越界");
        }
    }

    let mut answers = Vec::new();
    let mut https_records = Vec::new();

    for _ in 0..ancount {
        let Some((name, next)) = read_name(msg, pos) else {
            break; // 名字不可读，无法重新同步
        };
        pos = next;
        if pos + 10 > msg.len() {
            break; // RDLENGTH 不可读，放弃剩余记录
        }
        let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let class = u16::from_be_bytes([msg[pos + 2], msg[pos + 3]]);
        let ttl = u32::from_be_bytes([msg[pos + 4], msg[pos + 5], msg[pos + 6], msg[pos + 7]]);
        let rdlength = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        pos += 10;

        if pos + rdlength > msg.len() {
            break; // RDATA 越界，声明长度无法用于同步
        }

        let rdata_start = pos;
        pos += rdlength;

        if rtype == TYPE_HTTPS {
            if let Some(record) = parse_https_rdata(msg, rdata_start, rdlength) {
                https_records.push(record);
            }
            // 解码失败的记录按 RDLENGTH 跳过
        }

        answers.push(ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdata: msg[rdata_start..rdata_start + rdlength].to_vec(),
        });
    }

    Ok(DnsResponse {
        id,
        flags,
        answers,
        https_records,
    })
}

/// 读取一个 DNS 名字，支持压缩指针
///
/// 返回 (名字, 原位置之后的游标)。跟随指针时只消耗指针处的 2 字节，
/// 不会把记录自身的游标推进到指针目标之后。
pub fn read_name(msg: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut ret_pos: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len_byte = *msg.get(pos)?;

        if len_byte & 0xC0 == 0xC0 {
            // 14 位压缩指针
            let second = *msg.get(pos + 1)?;
            if ret_pos.is_none() {
                ret_pos = Some(pos + 2);
            }
            jumps += 1;
            if jumps > 16 {
                return None; // 指针环
            }
            pos = (((len_byte & 0x3F) as usize) << 8) | second as usize;
            continue;
        }

        if len_byte == 0 {
            pos += 1;
            break;
        }

        if len_byte & 0xC0 != 0 {
            return None; // 保留的长度编码
        }

        let len = len_byte as usize;
        let label = msg.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    Some((labels.join("."), ret_pos.unwrap_or(pos)))
}

/// SvcParam 键的规范名
fn param_key_name(key: u16) -> String {
    match key {
        0 => "mandatory".to_string(),
        1 => "alpn".to_string(),
        2 => "no-default-alpn".to_string(),
        3 => "port".to_string(),
        4 => "ipv4hint".to_string(),
        5 => "ech".to_string(),
        6 => "ipv6hint".to_string(),
        7 => "dohpath".to_string(),
        8 => "ohttp".to_string(),
        n => format!("key{}", n),
    }
}

/// 解码 type 65 的 RDATA
///
/// 线上格式总是在 priority 之后编码 TargetName（service 模式下为根标签），
/// 名字始终消耗，但只在 alias 模式（priority != 0）下保留。
fn parse_https_rdata(msg: &[u8], start: usize, len: usize) -> Option<HttpsRecord> {
    let end = start + len;
    if len < 2 {
        return None;
    }

    let priority = u16::from_be_bytes([msg[start], msg[start + 1]]);
    let mut pos = start + 2;

    let (name, next) = read_name(msg, pos)?;
    if next > end {
        return None;
    }
    pos = next;

    let target_name = if priority != 0 && !name.is_empty() {
        Some(name)
    } else {
        None
    };

    let mut params = HashMap::new();
    let mut ech_config_list = None;

    // SvcParam 序列：{key u16, length u16, value}，直到 RDATA 耗尽
    while pos < end {
        if pos + 4 > end {
            return None; // 长度字段截断
        }
        let key = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let value_len = u16::from_be_bytes([msg[pos + 2], msg[pos + 3]]) as usize;
        pos += 4;
        if pos + value_len > end {
            return None; // 值截断
        }
        let value = msg[pos..pos + value_len].to_vec();
        pos += value_len;

        if key == 5 {
            ech_config_list = Some(value.clone());
        }
        params.insert(param_key_name(key), value);
    }

    Some(HttpsRecord {
        priority,
        target_name,
        params,
        ech_config_list,
    })
}
