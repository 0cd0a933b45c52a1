use thiserror::Error;

/**
 * \brief 启动期配置错误，出现即视为致命。
 */
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /** \brief 必填环境变量缺失或为空。 */
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    /** \brief 布尔开关取值无法识别。 */
    #[error("{var} must be a boolean flag (true/false/1/0/yes/no/on/off), got {value:?}")]
    InvalidFlag { var: &'static str, value: String },
    /** \brief .env 文件存在但无法解析。 */
    #[error("failed to load .env file: {0}")]
    DotEnv(String),
}

/**
 * \brief IAM 令牌交换失败。
 */
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /** \brief 身份端点返回非 2xx 状态。 */
    #[error("token exchange failed: {status} -> {body}")]
    Rejected { status: u16, body: String },
    /** \brief 响应体中没有 access_token 字段。 */
    #[error("token response did not contain an access_token")]
    MissingAccessToken,
}

#[derive(Debug, Error)]
pub enum WatsonxError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    /** \brief 流式推理端点返回非 2xx 状态。 */
    #[error("request failed: {status} -> {body}")]
    Status { status: u16, body: String },
    /** \brief 流式响应中单行超过上限仍未结束。 */
    #[error("stream line exceeded {limit} bytes without a line break")]
    LineTooLong { limit: usize },
    /** \brief 网络错误或超时。 */
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl WatsonxError {
    /**
     * \brief 是否为请求超时（默认 30s/120s/300s，见 config::Timeouts）。
     */
    pub fn is_timeout(&self) -> bool {
        matches!(self, WatsonxError::Transport(e) if e.is_timeout())
    }
}

pub type Result<T, E = WatsonxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_variable() {
        let err = WatsonxError::from(ConfigError::Missing("WATSONX_APIKEY"));
        assert_eq!(
            err.to_string(),
            "WATSONX_APIKEY environment variable is required"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_auth_error_passes_through() {
        let err = WatsonxError::from(AuthError::Rejected {
            status: 401,
            body: "bad key".into(),
        });
        assert_eq!(err.to_string(), "token exchange failed: 401 -> bad key");
        assert!(matches!(
            err,
            WatsonxError::Auth(AuthError::Rejected { status: 401, .. })
        ));
    }
}
