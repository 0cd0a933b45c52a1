use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/**
 * \brief 消息结构，与部署端 chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 推理请求体：固定为系统提示 + 用户问题两条消息。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
}

impl ChatRequest {
    pub fn new(system_prompt: &str, question: &str) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(question)],
        }
    }
}

/**
 * \brief IAM 返回的短期访问令牌，不做缓存。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/**
 * \brief 非流式调用结果。
 *
 * 响应体是合法 JSON 时原样保留（通常为 `{choices: [...]}`，也可能是错误文档）；
 * 否则退化为携带状态码与原始文本的 Fallback。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatResponse {
    Json(Value),
    Fallback { status_code: u16, raw: String },
}

impl ChatResponse {
    /**
     * \brief 按响应体文本构造结果，JSON 解析失败时不报错。
     */
    pub fn from_body(status_code: u16, body: String) -> Self {
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => ChatResponse::Json(v),
            Err(_) => ChatResponse::Fallback {
                status_code,
                raw: body,
            },
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ChatResponse::Fallback { .. })
    }

    /** \brief 响应是否带有 choices 字段。 */
    pub fn has_choices(&self) -> bool {
        matches!(self, ChatResponse::Json(v) if v.get("choices").is_some())
    }

    /**
     * \brief 第一个候选回复的 message.content。
     */
    pub fn first_content(&self) -> Option<&str> {
        match self {
            ChatResponse::Json(v) => v
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str()),
            ChatResponse::Fallback { .. } => None,
        }
    }
}

impl fmt::Display for ChatResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatResponse::Json(v) => write!(f, "{}", v),
            ChatResponse::Fallback { .. } => {
                let v = serde_json::to_value(self).map_err(|_| fmt::Error)?;
                write!(f, "{}", v)
            }
        }
    }
}
