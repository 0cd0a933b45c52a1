use reqwest::header::ACCEPT;
use std::time::Duration;
use serde_json::Value;

use crate::{
    config::WatsonxConfig,
    error::{AuthError, Result},
    models::AccessToken,
    telemetry,
};

pub const GRANT_TYPE_APIKEY: &str = "urn:ibm:params:oauth:grant-type:apikey";

/**
 * \brief 用 API Key 换取 IAM Bearer 令牌。每次调用都会发起一次请求，不缓存。
 */
#[derive(Clone)]
pub struct TokenProvider {
    http: reqwest::Client,
    iam_url: String,
    api_key: String,
    timeout: Duration,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("iam_url", &self.iam_url)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, config: &WatsonxConfig) -> Self {
        Self {
            http,
            iam_url: config.iam_url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeouts.token,
        }
    }

    /**
     * \brief 获取访问令牌。
     * \return 非 2xx 或缺少 access_token 时返回 AuthError；网络错误返回 Transport。
     */
    pub async fn get_token(&self) -> Result<AccessToken> {
        let resp = self
            .http
            .post(&self.iam_url)
            .header(ACCEPT, "application/json")
            .form(&[
                ("apikey", self.api_key.as_str()),
                ("grant_type", GRANT_TYPE_APIKEY),
            ])
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            telemetry::log_error("client.token", &format!("rejected status={}", status));
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let text = resp.text().await?;
        let token = parse_access_token(&text).ok_or(AuthError::MissingAccessToken)?;
        telemetry::log_event("client.token", "token exchange ok");
        Ok(token)
    }
}

fn parse_access_token(body: &str) -> Option<AccessToken> {
    let v: Value = serde_json::from_str(body).ok()?;
    v.get("access_token")?
        .as_str()
        .filter(|t| !t.is_empty())
        .map(AccessToken::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_access_token() {
        let t = parse_access_token(r#"{"access_token":"T","expires_in":3600}"#).unwrap();
        assert_eq!(t.as_str(), "T");
    }

    #[test]
    fn test_parse_access_token_missing_or_invalid() {
        assert!(parse_access_token(r#"{"token_type":"Bearer"}"#).is_none());
        assert!(parse_access_token(r#"{"access_token":42}"#).is_none());
        assert!(parse_access_token(r#"{"access_token":""}"#).is_none());
        assert!(parse_access_token("not json").is_none());
    }
}
