use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::dns_message::{self, QueryOptions, TYPE_HTTPS};

/// ECH 配置列表中的单个条目（启发式字段布局，尽力解析）
#[derive(Debug, Clone)]
pub struct EchConfig {
    pub version: u16,
    pub config_id: Vec<u8>,
    pub public_name: String,
    pub public_key: Vec<u8>,
    pub cipher_suites: Vec<u32>,
    pub extensions: Vec<u8>,
}

/// ECH 配置解析器：通过 DoH 查询域名的 HTTPS 记录并提取 ECH 配置
///
/// 结果按进程生命周期缓存（含查不到的否定结果），`invalidate` 清空。
/// 任何网络失败都按"无 ECH 配置"处理，不向上传播。
pub struct EchResolver {
    doh_url: String,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, Option<Vec<u8>>>>,
}

impl EchResolver {
    /// 创建解析器，`doh_url` 为 DoH 端点（如 https://doh.pub/dns-query）
    pub fn new(doh_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("构建 DoH HTTP 客户端失败")?;

        Ok(Self {
            doh_url: doh_url.to_string(),
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// 获取域名的 ECH 配置；查不到返回 None（调用方按无 ECH 继续）
    pub async fn fetch_ech_config(&self, domain: &str) -> Option<Vec<u8>> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(domain) {
                debug!("ECH 缓存命中: {}", domain);
                return cached.clone();
            }
        }

        match self.query_doh(domain).await {
            Ok(body) => {
                let config = ech_from_response(&body);
                match &config {
                    Some(bytes) => info!("获取到 {} 的 ECH 配置 ({} 字节)", domain, bytes.len()),
                    None => debug!("{} 的 HTTPS 记录中没有可用的 ECH 配置", domain),
                }
                // 肯定和否定结果都缓存，避免反复打 DoH 端点
                let mut cache = self.cache.lock().await;
                cache.insert(domain.to_string(), config.clone());
                config
            }
            Err(e) => {
                // 网络失败不缓存，下次仍可重试
                warn!("ECH DoH 查询失败 {}: {}", domain, e);
                None
            }
        }
    }

    /// 清空 ECH 缓存
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.clear();
        info!("ECH 缓存已清除");
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// POST 原始 DNS 查询到 DoH 端点，返回原始应答报文
    async fn query_doh(&self, domain: &str) -> Result<Vec<u8>> {
        let query = dns_message::build_query(domain, TYPE_HTTPS, &QueryOptions::default())?;

        let response = self
            .client
            .post(&self.doh_url)
            .header("Accept", "application/dns-message")
            .header("Content-Type", "application/dns-message")
            .body(query)
            .send()
            .await
            .context("DoH 请求发送失败")?;

        if !response.status().is_success() {
            anyhow::bail!("DoH 端点返回 {}", response.status());
        }

        let body = response.bytes().await.context("读取 DoH 应答失败")?;
        Ok(body.to_vec())
    }
}

/// 从原始 DoH 应答中提取第一个可用的 ECH 配置
///
/// 按顺序扫描 HTTPS 记录，取第一条带非空 ech 列表的记录，
/// 从中提取第一个格式完好的条目，重新封装为单条目配置列表。
pub fn ech_from_response(body: &[u8]) -> Option<Vec<u8>> {
    let response = match dns_message::parse_response(body) {
        Ok(r) => r,
        Err(e) => {
            warn!("DoH 应答解析失败: {}", e);
            return None;
        }
    };

    for record in &response.https_records {
        if let Some(list) = &record.ech_config_list {
            if list.is_empty() {
                continue;
            }
            if let Some(entry) = extract_first_ech_config(list) {
                return Some(entry);
            }
        }
    }

    None
}

/// 从 {u16 长度, 载荷} 条目序列中取出第一个格式完好的条目
///
/// 返回值重新带上 u16 长度前缀，保持单条目列表的外层格式。
pub fn extract_first_ech_config(list: &[u8]) -> Option<Vec<u8>> {
    let mut pos = 0;

    while pos + 2 <= list.len() {
        let entry_len = u16::from_be_bytes([list[pos], list[pos + 1]]) as usize;
        pos += 2;
        if pos + entry_len > list.len() {
            return None; // 列表本身截断
        }
        let payload = &list[pos..pos + entry_len];
        pos += entry_len;

        if parse_ech_config(payload).is_some() {
            let mut framed = Vec::with_capacity(entry_len + 2);
            framed.extend_from_slice(&(entry_len as u16).to_be_bytes());
            framed.extend_from_slice(payload);
            return Some(framed);
        }
        // 坏条目跳过，尝试下一个
    }

    None
}

/// 尽力解析单个 ECH 配置条目
///
/// 字段布局按启发式处理（version、长度前缀的 config_id / public_name /
/// public_key / 密码套件列表 / extensions）；任何字段截断视为坏条目。
pub fn parse_ech_config(payload: &[u8]) -> Option<EchConfig> {
    let mut pos = 0;

    let version = read_u16(payload, &mut pos)?;

    let id_len = *payload.get(pos)? as usize;
    pos += 1;
    let config_id = payload.get(pos..pos + id_len)?.to_vec();
    pos += id_len;

    let name_len = read_u16(payload, &mut pos)? as usize;
    let public_name =
        String::from_utf8(payload.get(pos..pos + name_len)?.to_vec()).ok()?;
    pos += name_len;

    let key_len = read_u16(payload, &mut pos)? as usize;
    let public_key = payload.get(pos..pos + key_len)?.to_vec();
    pos += key_len;

    let suites_len = read_u16(payload, &mut pos)? as usize;
    if suites_len % 4 != 0 {
        return None;
    }
    let suites_bytes = payload.get(pos..pos + suites_len)?;
    pos += suites_len;
    let cipher_suites = suites_bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let ext_len = read_u16(payload, &mut pos)? as usize;
    let extensions = payload.get(pos..pos + ext_len)?.to_vec();

    Some(EchConfig {
        version,
        config_id,
        public_name,
        public_key,
        cipher_suites,
        extensions,
    })
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Option<u16> {
    let bytes = buf.get(*pos..*pos + 2)?;
    *pos += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_message::TYPE_HTTPS;

    /// 构造一个格式完好的 ECH 条目载荷
    fn wellformed_payload() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&0xFE0Du16.to_be_bytes()); // version
        p.push(1); // config_id 长度
        p.push(0x42);
        let name = b"public.example";
        p.extend_from_slice(&(name.len() as u16).to_be_bytes());
        p.extend_from_slice(name);
        let key = [0xAB; 32];
        p.extend_from_slice(&(key.len() as u16).to_be_bytes());
        p.extend_from_slice(&key);
        p.extend_from_slice(&8u16.to_be_bytes()); // 两个套件
        p.extend_from_slice(&0x00010001u32.to_be_bytes());
        p.extend_from_slice(&0x00010003u32.to_be_bytes());
        p.extend_from_slice(&0u16.to_be_bytes()); // 无扩展
        p
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn build_https_response(ech_list: &[u8]) -> Vec<u8> {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&1u16.to_be_bytes());
        rdata.push(0);
        rdata.extend_from_slice(&5u16.to_be_bytes());
        rdata.extend_from_slice(&(ech_list.len() as u16).to_be_bytes());
        rdata.extend_from_slice(ech_list);

        let mut msg = Vec::new();
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes()); // 无问题区
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.push(3);
        msg.extend_from_slice(b"www");
        msg.push(0);
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(&rdata);
        msg
    }

    #[test]
    fn test_parse_wellformed_config() {
        let config = parse_ech_config(&wellformed_payload()).unwrap();
        assert_eq!(config.version, 0xFE0D);
        assert_eq!(config.config_id, vec![0x42]);
        assert_eq!(config.public_name, "public.example");
        assert_eq!(config.public_key.len(), 32);
        assert_eq!(config.cipher_suites, vec![0x00010001, 0x00010003]);
        assert!(config.extensions.is_empty());
    }

    #[test]
    fn test_truncated_config_rejected() {
        let payload = wellformed_payload();
        // 任意截断都应判为坏条目
        assert!(parse_ech_config(&payload[..payload.len() - 1]).is_none());
        assert!(parse_ech_config(&payload[..5]).is_none());
        assert!(parse_ech_config(&[]).is_none());
    }

    #[test]
    fn test_extract_first_entry() {
        let list = frame(&wellformed_payload());
        let extracted = extract_first_ech_config(&list).unwrap();
        assert_eq!(extracted, list);
    }

    #[test]
    fn test_bad_first_entry_skipped() {
        // 第一个条目截断，第二个完好
        let mut list = frame(&[0xFE, 0x0D, 0x01]); // 声明长度 3，字段不完整
        list.extend_from_slice(&frame(&wellformed_payload()));

        let extracted = extract_first_ech_config(&list).unwrap();
        assert_eq!(extracted, frame(&wellformed_payload()));
    }

    #[test]
    fn test_list_truncation_yields_none() {
        let mut list = Vec::new();
        list.extend_from_slice(&100u16.to_be_bytes()); // 声明 100 字节，实际没有
        list.push(0xAA);
        assert!(extract_first_ech_config(&list).is_none());
    }

    #[test]
    fn test_ech_from_response_with_config() {
        let body = build_https_response(&frame(&wellformed_payload()));
        let extracted = ech_from_response(&body).unwrap();
        assert_eq!(extracted, frame(&wellformed_payload()));
    }

    #[test]
    fn test_ech_from_response_no_https_record() {
        // 只有 A 记录的应答
        let mut msg = Vec::new();
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.push(3);
        msg.extend_from_slice(b"www");
        msg.push(0);
        msg.extend_from_slice(&1u16.to_be_bytes()); // A
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&[1, 2, 3, 4]);

        assert!(ech_from_response(&msg).is_none());
    }

    #[tokio::test]
    async fn test_fetch_caches_negative_result() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // 最小 DoH 端点：总是返回不带 ech 参数的 HTTPS 应答
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut body_msg = Vec::new();
        body_msg.extend_from_slice(&1u16.to_be_bytes());
        body_msg.extend_from_slice(&0x8180u16.to_be_bytes());
        body_msg.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);

        let server = tokio::spawn(async move {
            let mut served = 0usize;
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut data = Vec::new();
                // 读到头部结束加正文（正文长度不关心，读到头就够了）
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                    if data.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/dns-message\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body_msg.len()
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.write_all(&body_msg).await;
                served += 1;
                if served >= 2 {
                    break;
                }
            }
            served
        });

        let resolver = EchResolver::new(
            &format!("http://{}/dns-query", addr),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(resolver.fetch_ech_config("example.com").await.is_none());
        // 第二次命中否定缓存，不再发请求
        assert!(resolver.fetch_ech_config("example.com").await.is_none());
        assert_eq!(resolver.cache_size().await, 1);

        resolver.invalidate().await;
        assert_eq!(resolver.cache_size().await, 0);

        server.abort();
    }
}
