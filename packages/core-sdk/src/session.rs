use std::sync::Arc;

use serde::Serialize;

use crate::{
    error::Result,
    llm::{collect_chunks, DeploymentClient},
    models::{ChatResponse, Message},
    telemetry,
};

pub const APOLOGY_REPLY: &str =
    "I apologize, but I couldn't process your request. Please try again.";

/**
 * \brief 会话记录：只追加，仅驻留内存。
 */
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    entries: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.entries.push(message);
    }

    /** \brief 一次写入完整一轮（用户 + 助手），保证两者相邻。 */
    pub fn push_turn(&mut self, prompt: &str, reply: &str) {
        self.entries.push(Message::user(prompt));
        self.entries.push(Message::assistant(reply));
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/**
 * \brief 非流式结果的展示文本：有 choices 取首条内容，否则给出致歉提示。
 */
pub fn render_reply(resp: &ChatResponse) -> String {
    if resp.has_choices() {
        if let Some(content) = resp.first_content() {
            return content.to_string();
        }
    }
    APOLOGY_REPLY.to_string()
}

/** \brief 单轮失败时写入会话的助手消息。 */
pub fn render_error<E: std::fmt::Display>(err: E) -> String {
    format!("Sorry, I encountered an error: {}", err)
}

/**
 * \brief 单个聊天会话：每轮调用一次部署客户端，并在轮次边界吞掉错误。
 */
#[derive(Debug, Clone)]
pub struct ChatSession {
    client: Arc<DeploymentClient>,
    transcript: Transcript,
    streaming: bool,
}

impl ChatSession {
    pub fn new(client: Arc<DeploymentClient>, streaming: bool) -> Self {
        Self {
            client,
            transcript: Transcript::new(),
            streaming,
        }
    }

    pub fn client(&self) -> &Arc<DeploymentClient> {
        &self.client
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /**
     * \brief 提交一轮用户输入，返回写入会话的助手回复。
     * \param prompt 用户问题
     * \param streaming 覆盖会话默认模式（None 表示沿用）
     */
    pub async fn submit(&mut self, prompt: &str, streaming: Option<bool>) -> String {
        let streaming = streaming.unwrap_or(self.streaming);
        let reply = answer_turn(&self.client, prompt, streaming).await;
        self.transcript.push_turn(prompt, &reply);
        reply
    }
}

/**
 * \brief 执行一轮问答但不触碰会话记录；错误在此处转为内联回复。
 */
pub async fn answer_turn(client: &DeploymentClient, prompt: &str, streaming: bool) -> String {
    match answer(client, prompt, streaming).await {
        Ok(reply) => reply,
        Err(e) => {
            telemetry::log_error("session.turn", &format!("turn failed: {}", e));
            render_error(e)
        }
    }
}

async fn answer(client: &DeploymentClient, prompt: &str, streaming: bool) -> Result<String> {
    if streaming {
        let chunks = collect_chunks(client.call_stream(prompt).await?).await?;
        Ok(chunks.join(" "))
    } else {
        let resp = client.call_non_stream(prompt).await?;
        Ok(render_reply(&resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::WatsonxConfig, error::ConfigError};

    #[test]
    fn test_render_reply_with_choices() {
        let resp = ChatResponse::from_body(
            200,
            r#"{"choices":[{"message":{"content":"Article 12 applies."}}]}"#.into(),
        );
        assert_eq!(render_reply(&resp), "Article 12 applies.");
    }

    #[test]
    fn test_render_reply_without_choices() {
        let err_doc = ChatResponse::from_body(400, r#"{"errors":[]}"#.into());
        assert_eq!(render_reply(&err_doc), APOLOGY_REPLY);
        let fb = ChatResponse::from_body(500, "oops".into());
        assert_eq!(render_reply(&fb), APOLOGY_REPLY);
    }

    #[test]
    fn test_render_error() {
        assert_eq!(
            render_error(ConfigError::Missing("WATSONX_APIKEY")),
            "Sorry, I encountered an error: WATSONX_APIKEY environment variable is required"
        );
    }

    #[test]
    fn test_transcript_append_and_clear() {
        let mut t = Transcript::new();
        assert!(t.is_empty());
        t.push_turn("hi", "hello");
        assert_eq!(t.len(), 2);
        assert_eq!(t.entries()[0].role, "user");
        assert_eq!(t.entries()[1].role, "assistant");
        t.clear();
        assert!(t.is_empty());
    }

    #[tokio::test]
    async fn test_submit_renders_transport_error_inline() {
        // 本机 9 号端口（discard）通常无人监听，连接会被拒绝
        let cfg = WatsonxConfig::new("key", "dep")
            .with_iam_url("http://127.0.0.1:9/identity/token")
            .with_api_base("http://127.0.0.1:9");
        let client = Arc::new(DeploymentClient::new(cfg).expect("client"));
        let mut session = ChatSession::new(client, false);

        let reply = session.submit("Q", None).await;
        assert!(reply.starts_with("Sorry, I encountered an error:"));
        let entries = session.transcript().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], Message::user("Q"));
        assert_eq!(entries[1], Message::assistant(reply));
    }
}
