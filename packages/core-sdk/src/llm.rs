use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::pin::Pin;

use crate::{
    auth::TokenProvider,
    config::WatsonxConfig,
    error::{Result, WatsonxError},
    models::{ChatRequest, ChatResponse},
    telemetry,
};

const API_VERSION: &str = "2021-05-01";

/** \brief 单行 SSE 文本的上限，超出即终止流。 */
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/** \brief 流式回复分片序列，丢弃即释放底层连接。 */
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/**
 * \brief watsonx 部署客户端：令牌交换 + 非流式/流式推理。
 */
#[derive(Debug, Clone)]
pub struct DeploymentClient {
    http: reqwest::Client,
    tokens: TokenProvider,
    config: WatsonxConfig,
}

impl DeploymentClient {
    /**
     * \brief 按配置构造客户端；insecure_tls 为真时关闭证书校验。
     */
    pub fn new(config: WatsonxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()?;
        if config.insecure_tls {
            telemetry::log_event(
                "client.init",
                "TLS certificate verification disabled by WATSONX_INSECURE_TLS",
            );
        }
        let tokens = TokenProvider::new(http.clone(), &config);
        Ok(Self {
            http,
            tokens,
            config,
        })
    }

    /**
     * \brief 从环境变量构造客户端，缺少必填项时返回配置错误。
     */
    pub fn from_env() -> Result<Self> {
        let config = WatsonxConfig::from_env()?;
        Self::new(config)
    }

    pub fn config(&self) -> &WatsonxConfig {
        &self.config
    }

    pub fn token_provider(&self) -> &TokenProvider {
        &self.tokens
    }

    /** \brief 构造本次调用的请求体。 */
    pub fn build_request(&self, question: &str) -> ChatRequest {
        ChatRequest::new(&self.config.system_prompt, question)
    }

    pub fn deployment_url(&self, streaming: bool) -> String {
        format!(
            "{}/ml/v4/deployments/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.deployment_id,
            if streaming { "ai_service_stream" } else { "ai_service" }
        )
    }

    /**
     * \brief 非流式调用。响应体不是合法 JSON 时返回 Fallback 而不报错，
     * 且不检查 HTTP 状态码。
     */
    pub async fn call_non_stream(&self, question: &str) -> Result<ChatResponse> {
        let token = self.tokens.get_token().await?;
        let body = self.build_request(question);

        let resp = self
            .http
            .post(self.deployment_url(false))
            .query(&[("version", API_VERSION)])
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(token.as_str())
            .json(&body)
            .timeout(self.config.timeouts.non_stream)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let parsed = ChatResponse::from_body(status, text);
        if parsed.is_fallback() {
            telemetry::log_error(
                "client.chat",
                &format!("non-json response substituted with fallback status={}", status),
            );
        } else {
            telemetry::log_event(
                "client.chat",
                &format!("non-stream status={} question_len={}", status, question.len()),
            );
        }
        Ok(parsed)
    }

    /**
     * \brief 流式调用：每个 `data:` 行产出一个分片，跳过空行与注释行。
     */
    pub async fn call_stream(&self, question: &str) -> Result<ChunkStream> {
        let token = self.tokens.get_token().await?;
        let body = self.build_request(question);

        let resp = self
            .http
            .post(self.deployment_url(true))
            .query(&[("version", API_VERSION)])
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .bearer_auth(token.as_str())
            .json(&body)
            .timeout(self.config.timeouts.stream)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            telemetry::log_error("client.stream", &format!("request failed status={}", status));
            return Err(WatsonxError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        telemetry::log_event(
            "client.stream",
            &format!("stream opened question_len={}", question.len()),
        );

        let mut stream = resp.bytes_stream();
        let mut lines = LineBuffer::new(MAX_SSE_LINE_BYTES);

        let out = try_stream! {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                for data in lines.push(&chunk)? {
                    yield data;
                }
            }
            if let Some(data) = lines.finish() {
                yield data;
            }
        };

        Ok(Box::pin(out))
    }

    /**
     * \brief 便捷接口：流式模式下完整消费后以空格拼接；
     * 非流式模式取第一个候选内容，否则返回整个响应的字符串形式。
     */
    pub async fn get_answer(&self, question: &str, streaming: bool) -> Result<String> {
        if streaming {
            let chunks = collect_chunks(self.call_stream(question).await?).await?;
            Ok(chunks.join(" "))
        } else {
            let resp = self.call_non_stream(question).await?;
            Ok(match resp.first_content() {
                Some(content) => content.to_string(),
                None => resp.to_string(),
            })
        }
    }
}

/**
 * \brief 消费整个分片流，遇到错误立即返回。
 */
pub async fn collect_chunks(mut stream: ChunkStream) -> Result<Vec<String>> {
    let mut chunks = Vec::new();
    while let Some(item) = stream.as_mut().next().await {
        chunks.push(item?);
    }
    Ok(chunks)
}

/**
 * \brief 跨网络分块拼接 SSE 行，行结束符可为 `\n`、`\r\n` 或单独的 `\r`。
 */
#[derive(Debug)]
struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
}

impl LineBuffer {
    fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
        }
    }

    /**
     * \brief 追加一块字节，返回其中完整 `data:` 行的内容。
     * \return 未结束的行超过上限时返回 LineTooLong
     */
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some((end, consumed)) = next_line_break(&self.buf) {
            let line = self.buf.drain(..consumed).collect::<Vec<u8>>();
            if let Some(data) = parse_sse_line(&line[..end]) {
                out.push(data);
            }
        }
        if self.buf.len() > self.max_line {
            return Err(WatsonxError::LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(out)
    }

    /** \brief 流结束时处理没有结束符的最后一行。 */
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        if rest.is_empty() {
            return None;
        }
        parse_sse_line(&rest)
    }
}

/**
 * \brief 查找下一个行结束符，返回（行内容长度，需消费的字节数）。
 * 末尾的 `\r` 需等待下一块以区分 `\r\n`。
 */
fn next_line_break(buf: &[u8]) -> Option<(usize, usize)> {
    let pos = buf.iter().position(|b| *b == b'\n' || *b == b'\r')?;
    if buf[pos] == b'\n' {
        return Some((pos, pos + 1));
    }
    match buf.get(pos + 1) {
        Some(b'\n') => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
        None => None,
    }
}

/**
 * \brief 解析单行 SSE 文本：仅 `data:` 行有效，空行与 `:` 注释行忽略。
 */
fn parse_sse_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data:").map(|rest| rest.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(parse_sse_line(b"data: Hello\n"), Some("Hello".into()));
        assert_eq!(parse_sse_line(b"data:world\r\n"), Some("world".into()));
        assert_eq!(parse_sse_line(b"data:   padded  "), Some("padded".into()));
        assert_eq!(parse_sse_line(b"data:"), Some(String::new()));
        assert_eq!(parse_sse_line(b": keep-alive\n"), None);
        assert_eq!(parse_sse_line(b"\n"), None);
        assert_eq!(parse_sse_line(b"\r\n"), None);
        assert_eq!(parse_sse_line(b"event: message\n"), None);
        assert_eq!(parse_sse_line(b"id: 7\n"), None);
    }

    #[test]
    fn test_next_line_break() {
        assert_eq!(next_line_break(b"abc\ndef"), Some((3, 4)));
        assert_eq!(next_line_break(b"abc\r\ndef"), Some((3, 5)));
        assert_eq!(next_line_break(b"abc\rdef"), Some((3, 4)));
        assert_eq!(next_line_break(b"abc\r"), None);
        assert_eq!(next_line_break(b"abc"), None);
    }

    #[test]
    fn test_line_buffer_cr_only_endings() {
        let mut lines = LineBuffer::new(MAX_SSE_LINE_BYTES);
        assert!(lines.push(b"data: a\r").unwrap().is_empty());
        assert_eq!(lines.push(b"data: b\r: c\r\rdata: d\r").unwrap(), vec!["a", "b"]);
        assert_eq!(lines.finish(), Some("d".to_string()));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_buffer_crlf_split_between_chunks() {
        let mut lines = LineBuffer::new(MAX_SSE_LINE_BYTES);
        assert!(lines.push(b"data: one\r").unwrap().is_empty());
        assert_eq!(lines.push(b"\ndata: two\n").unwrap(), vec!["one", "two"]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_buffer_rejects_unterminated_long_line() {
        let mut lines = LineBuffer::new(16);
        assert_eq!(lines.push(b"data: short\n").unwrap(), vec!["short"]);
        assert!(lines.push(b"data: 0123456789").unwrap().is_empty());
        match lines.push(b"abcdef") {
            Err(WatsonxError::LineTooLong { limit }) => assert_eq!(limit, 16),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_deployment_urls() {
        let cfg = WatsonxConfig::new("key", "dep-1").with_region("eu-gb");
        let client = DeploymentClient::new(cfg).expect("client");
        assert_eq!(
            client.deployment_url(false),
            "https://eu-gb.ml.cloud.ibm.com/ml/v4/deployments/dep-1/ai_service"
        );
        assert_eq!(
            client.deployment_url(true),
            "https://eu-gb.ml.cloud.ibm.com/ml/v4/deployments/dep-1/ai_service_stream"
        );
    }

    #[test]
    fn test_build_request_uses_configured_prompt() {
        let cfg = WatsonxConfig::new("key", "dep").with_system_prompt("persona");
        let client = DeploymentClient::new(cfg).expect("client");
        let req = client.build_request("Q");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[0].content, "persona");
        assert_eq!(req.messages[1].role, "user");
        assert_eq!(req.messages[1].content, "Q");
    }
}
