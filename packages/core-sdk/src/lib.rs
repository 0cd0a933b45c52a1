pub mod auth;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod telemetry;

pub use error::{AuthError, ConfigError, Result, WatsonxError};

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::auth::TokenProvider;
    pub use crate::config::WatsonxConfig;
    pub use crate::llm::{ChunkStream, DeploymentClient};
    pub use crate::models::{ChatResponse, Message};
    pub use crate::session::{ChatSession, Transcript};
    pub use crate::{server, telemetry};
}
