use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::WatsonxError,
    llm::DeploymentClient,
    models::Message,
    session::{answer_turn, render_error, ChatSession},
    telemetry,
};

#[derive(Clone)]
struct AppState {
    session: Arc<Mutex<ChatSession>>,
}

/**
 * \brief 启动本地 HTTP 服务，对外暴露聊天接口。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, client: Arc<DeploymentClient>) -> Result<()> {
    let app = router(client);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening on {}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 构造路由。服务只有一个内存会话，所有请求共享同一份会话记录；
 * 并发的多轮各自以相邻的用户/助手消息对写入。
 */
pub fn router(client: Arc<DeploymentClient>) -> Router {
    let state = AppState {
        session: Arc::new(Mutex::new(ChatSession::new(client, false))),
    };
    Router::new()
        .route("/api/chat", post(chat_once))
        .route("/api/chat/sse", get(chat_sse))
        .route("/api/messages", get(get_messages).delete(clear_messages))
        .route("/api/health", get(health_check))
        .with_state(state)
}

#[derive(Deserialize, Debug)]
struct ChatInput {
    /** \brief 用户发送的消息 */
    prompt: String,
    /** \brief 是否走流式接口（默认 false） */
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Serialize, Debug)]
struct ChatOutput {
    reply: String,
    messages: Vec<Message>,
}

#[derive(Serialize, Debug)]
struct MessagesResponse {
    messages: Vec<Message>,
}

#[derive(Deserialize, Debug)]
struct SseQuery {
    /** \brief 用户发送的消息 */
    prompt: String,
}

/**
 * \brief 单轮问答：POST /api/chat，失败时回复中内联错误信息。
 * 上游调用期间不持有会话锁，本轮结束后一次写入用户与助手两条消息。
 */
async fn chat_once(
    State(state): State<AppState>,
    Json(input): Json<ChatInput>,
) -> Result<Json<ChatOutput>, (axum::http::StatusCode, String)> {
    if input.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let (client, streaming) = {
        let session = state.session.lock().await;
        (
            session.client().clone(),
            input.stream.unwrap_or(session.streaming()),
        )
    };
    telemetry::log_event(
        "server.chat",
        &format!("send prompt_len={} stream={}", input.prompt.len(), streaming),
    );

    let reply = answer_turn(&client, &input.prompt, streaming).await;

    let mut session = state.session.lock().await;
    session.transcript_mut().push_turn(&input.prompt, &reply);
    Ok(Json(ChatOutput {
        reply,
        messages: session.transcript().entries().to_vec(),
    }))
}

type EventSender = mpsc::UnboundedSender<Result<Event, Infallible>>;

/** \brief SSE 转发的结束方式。 */
enum Relay {
    Completed(Vec<String>),
    Disconnected(Vec<String>),
    Failed(WatsonxError),
}

/**
 * \brief 聊天 SSE 流接口：GET /api/chat/sse?prompt=...
 * 客户端断开后立即丢弃上游流，已收到的分片作为本轮回复写入会话。
 */
async fn chat_sse(
    State(state): State<AppState>,
    Query(q): Query<SseQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (axum::http::StatusCode, String),
> {
    if q.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }

    let client = state.session.lock().await.client().clone();
    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let session = state.session.clone();
    let prompt = q.prompt;

    tokio::spawn(async move {
        telemetry::log_event("server.chat", &format!("sse prompt_len={}", prompt.len()));

        let reply = match relay_stream(&client, &prompt, &tx).await {
            Relay::Completed(chunks) => {
                let _ = tx.send(Ok(Event::default().event("done").data("")));
                chunks.join(" ")
            }
            Relay::Disconnected(chunks) => {
                telemetry::log_event(
                    "server.chat",
                    &format!("sse client disconnected after {} chunks", chunks.len()),
                );
                chunks.join(" ")
            }
            Relay::Failed(e) => {
                telemetry::log_error("server.chat", &format!("stream failed: {}", e));
                let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
                render_error(e)
            }
        };
        session
            .lock()
            .await
            .transcript_mut()
            .push_turn(&prompt, &reply);
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

/**
 * \brief 将上游分片逐个转发给 SSE 客户端；返回时上游流随之释放。
 */
async fn relay_stream(client: &DeploymentClient, prompt: &str, tx: &EventSender) -> Relay {
    let mut chunks = Vec::new();
    let mut upstream = tokio::select! {
        res = client.call_stream(prompt) => match res {
            Ok(s) => s,
            Err(e) => return Relay::Failed(e),
        },
        _ = tx.closed() => return Relay::Disconnected(chunks),
    };

    loop {
        let item = tokio::select! {
            item = upstream.next() => item,
            _ = tx.closed() => return Relay::Disconnected(chunks),
        };
        match item {
            None => return Relay::Completed(chunks),
            Some(Ok(chunk)) => {
                if tx.send(Ok(Event::default().data(chunk.clone()))).is_err() {
                    return Relay::Disconnected(chunks);
                }
                chunks.push(chunk);
            }
            Some(Err(e)) => return Relay::Failed(e),
        }
    }
}

async fn get_messages(State(state): State<AppState>) -> Json<MessagesResponse> {
    let session = state.session.lock().await;
    Json(MessagesResponse {
        messages: session.transcript().entries().to_vec(),
    })
}

async fn clear_messages(State(state): State<AppState>) -> Json<MessagesResponse> {
    let mut session = state.session.lock().await;
    session.transcript_mut().clear();
    telemetry::log_event("server.chat", "transcript cleared");
    Json(MessagesResponse {
        messages: Vec::new(),
    })
}

/**
 * \brief 健康检查：仅回显区域与部署 ID，不暴露密钥。
 */
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let session = state.session.lock().await;
    let cfg = session.client().config();
    Json(serde_json::json!({
        "ok": true,
        "region": cfg.region,
        "deployment_id": cfg.deployment_id,
    }))
}

fn bad_request<E: std::fmt::Display>(e: E) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::BAD_REQUEST, e.to_string())
}
