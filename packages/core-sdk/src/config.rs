use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::ConfigError;

pub const ENV_API_KEY: &str = "WATSONX_APIKEY";
pub const ENV_DEPLOYMENT_ID: &str = "WATSONX_DEPLOYMENT_ID";
pub const ENV_REGION: &str = "WATSONX_REGION";
pub const ENV_SYSTEM_PROMPT: &str = "SYSTEM_PROMPT";
pub const ENV_INSECURE_TLS: &str = "WATSONX_INSECURE_TLS";
pub const ENV_IAM_URL: &str = "WATSONX_IAM_URL";
pub const ENV_API_BASE: &str = "WATSONX_API_BASE";
pub const ENV_TELEMETRY: &str = "WATSONX_TELEMETRY";
pub const ENV_LOG_DIR: &str = "WATSONX_LOG_DIR";

pub const DEFAULT_REGION: &str = "us-south";
pub const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com/identity/token";
pub const DEFAULT_LOG_DIR: &str = "logs";

pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);
pub const NON_STREAM_TIMEOUT: Duration = Duration::from_secs(120);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/**
 * \brief 各类出站请求的超时，超时以 Transport 错误返回且不重试。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /** \brief IAM 令牌交换 */
    pub token: Duration,
    /** \brief 非流式推理 */
    pub non_stream: Duration,
    /** \brief 流式推理（含读取整个响应体） */
    pub stream: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            token: TOKEN_TIMEOUT,
            non_stream: NON_STREAM_TIMEOUT,
            stream: STREAM_TIMEOUT,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a contract analysis assistant for the UPS\u{2013}Teamsters Collective Bargaining Agreement (2023\u{2013}2028). Your role is to provide accurate, concise, and well-cited interpretations of the contract and related supplements. When asked which contract(s) apply, search across all available agreements and supplements to identify the relevant provision(s).
CITATION RULES:
\u{2022}\tAlways provide citations in this format: [Document Name, Article/Section, Page]
\u{2022}\tInclude exact contract language (1\u{2013}3 sentences maximum) in quotes
\u{2022}\tIf the article/section/page is unknown, state: \"article/section/page unknown\" (never guess)
\u{2022}\tWhen a supplement modifies the Master Agreement, explain both provisions and state clearly which takes precedence
RESPONSE GUIDELINES:
\u{2022}\tResponses must be under 200 words
\u{2022}\tFocus on precise, factual interpretation of the contract text
\u{2022}\tUse clear, professional, neutral language appropriate for labor relations
\u{2022}\tWhen conflicts exist between the Master Agreement and local supplements, explicitly identify the governing provision
LIMITATIONS:
\u{2022}\tReference only the provided contract documents
\u{2022}\tDo not interpret beyond the explicit contract language
\u{2022}\tIf information is not available in the source documents, state: \"This information is not available in the contract documents.\"
";

/**
 * \brief watsonx 部署访问配置，启动时读取一次，进程内只读。
 */
#[derive(Clone)]
pub struct WatsonxConfig {
    /** \brief IBM Cloud API Key（不可输出到日志） */
    pub api_key: String,
    /** \brief 区域，如 us-south */
    pub region: String,
    /** \brief 部署 ID */
    pub deployment_id: String,
    /** \brief 系统提示词 */
    pub system_prompt: String,
    /** \brief IAM 令牌端点 */
    pub iam_url: String,
    /** \brief 推理服务基地址 */
    pub api_base: String,
    /** \brief 关闭证书校验（仅用于存在 TLS 拦截代理的企业网络） */
    pub insecure_tls: bool,
    /** \brief 是否写入遥测日志 */
    pub telemetry_enabled: bool,
    /** \brief 遥测日志目录 */
    pub log_dir: PathBuf,
    /** \brief 请求超时，默认 30s/120s/300s */
    pub timeouts: Timeouts,
}

impl std::fmt::Debug for WatsonxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatsonxConfig")
            .field("api_key", &"<redacted>")
            .field("region", &self.region)
            .field("deployment_id", &self.deployment_id)
            .field("iam_url", &self.iam_url)
            .field("api_base", &self.api_base)
            .field("insecure_tls", &self.insecure_tls)
            .field("telemetry_enabled", &self.telemetry_enabled)
            .field("log_dir", &self.log_dir)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl WatsonxConfig {
    /**
     * \brief 用最少字段构造配置，其余取默认值。
     */
    pub fn new(api_key: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        let region = DEFAULT_REGION.to_string();
        Self {
            api_key: api_key.into(),
            api_base: default_api_base(&region),
            region,
            deployment_id: deployment_id.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            iam_url: DEFAULT_IAM_URL.to_string(),
            insecure_tls: false,
            telemetry_enabled: false,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            timeouts: Timeouts::default(),
        }
    }

    /**
     * \brief 从进程环境读取配置（先加载当前目录的 .env）。
     * 没有 .env 文件时忽略；文件存在但无法解析时返回配置错误。
     */
    pub fn from_env() -> Result<Self, ConfigError> {
        check_dotenv(dotenvy::dotenv())?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 与 from_env 相同，但从指定路径加载 .env。
     */
    pub fn from_env_file(path: &Path) -> Result<Self, ConfigError> {
        check_dotenv(dotenvy::from_path(path))?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 通过任意键值查找函数构造配置，便于测试注入。
     * \param lookup 按变量名返回取值
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get(ENV_API_KEY).ok_or(ConfigError::Missing(ENV_API_KEY))?;
        let deployment_id = get(ENV_DEPLOYMENT_ID).ok_or(ConfigError::Missing(ENV_DEPLOYMENT_ID))?;
        let region = get(ENV_REGION).unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut cfg = Self::new(api_key, deployment_id);
        cfg.api_base = get(ENV_API_BASE)
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| default_api_base(&region));
        cfg.region = region;
        if let Some(prompt) = lookup(ENV_SYSTEM_PROMPT).filter(|p| !p.is_empty()) {
            cfg.system_prompt = prompt;
        }
        if let Some(url) = get(ENV_IAM_URL) {
            cfg.iam_url = url;
        }
        cfg.insecure_tls = parse_flag(ENV_INSECURE_TLS, get(ENV_INSECURE_TLS))?;
        cfg.telemetry_enabled = parse_flag(ENV_TELEMETRY, get(ENV_TELEMETRY))?;
        if let Some(dir) = get(ENV_LOG_DIR) {
            cfg.log_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    pub fn with_iam_url(mut self, url: impl Into<String>) -> Self {
        self.iam_url = url.into();
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self.api_base = default_api_base(&self.region);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

fn check_dotenv<T>(result: Result<T, dotenvy::Error>) -> Result<(), ConfigError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(ConfigError::DotEnv(e.to_string())),
    }
}

/**
 * \brief 区域对应的推理服务基地址。
 */
pub fn default_api_base(region: &str) -> String {
    format!("https://{}.ml.cloud.ibm.com", region)
}

fn parse_flag(var: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag { var, value: raw }),
    }
}
