use std::{
    io::{BufRead, Write},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use contract_assistant_core_sdk::{
    config::WatsonxConfig,
    llm::DeploymentClient,
    server,
    session::ChatSession,
    telemetry, ConfigError,
};

/**
 * \brief CLI 程序入口：向 watsonx 部署提问的合同助手。
 */
#[derive(Parser, Debug)]
#[command(
    name = "contract-assistant",
    version,
    about = "UPS agreements assistant backed by a watsonx deployment"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 单次提问并输出回答。
     */
    Ask {
        #[arg(long)]
        prompt: String,
        /// 以流式方式逐段输出
        #[arg(long, default_value_t = false)]
        stream: bool,
    },

    /**
     * \brief 交互式会话，会话记录仅保存在内存中。
     */
    Chat {
        #[arg(long, default_value_t = false)]
        stream: bool,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match WatsonxConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            print_config_help(&err);
            return ExitCode::from(2);
        }
    };
    telemetry::init(&config);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: WatsonxConfig) -> Result<()> {
    if config.insecure_tls {
        eprintln!("warning: TLS certificate verification is disabled (WATSONX_INSECURE_TLS)");
    }
    let client = Arc::new(DeploymentClient::new(config).context("build http client failed")?);

    match cli.command {
        Commands::Ask { prompt, stream } => {
            telemetry::log_event(
                "cli.ask",
                &format!("prompt_len={} stream={}", prompt.len(), stream),
            );
            if stream {
                let mut chunks = client
                    .call_stream(&prompt)
                    .await
                    .context("create stream failed")?;
                let mut first = true;
                while let Some(chunk) = chunks
                    .as_mut()
                    .next()
                    .await
                    .transpose()
                    .context("stream error")?
                {
                    if !first {
                        print!(" ");
                    }
                    print!("{}", chunk);
                    first = false;
                    std::io::stdout().flush().ok();
                }
                println!();
            } else {
                let answer = client
                    .get_answer(&prompt, false)
                    .await
                    .context("request failed")?;
                println!("{}", answer);
            }
        }
        Commands::Chat { stream } => {
            repl(ChatSession::new(client, stream)).await?;
        }
        Commands::Serve { addr } => {
            server::run(&addr, client).await?;
        }
    }

    Ok(())
}

/**
 * \brief 逐行读取用户输入；每轮的错误都以内联消息呈现，不会中断会话。
 */
async fn repl(mut session: ChatSession) -> Result<()> {
    println!("Ask about UPS agreements. Commands: /history, /clear, /exit");
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("you> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("read stdin failed")?;
        let prompt = line.trim();
        match prompt {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                session.transcript_mut().clear();
                println!("(history cleared)");
                continue;
            }
            "/history" => {
                for message in session.transcript().entries() {
                    println!("[{}] {}", message.role, message.content);
                }
                continue;
            }
            _ => {}
        }

        println!("assistant> Thinking...");
        let reply = session.submit(prompt, None).await;
        println!("assistant> {}", reply);
    }
    Ok(())
}

fn print_config_help(err: &ConfigError) {
    eprintln!("Configuration Error: {}", err);
    eprintln!(
        "Please set the following environment variables (a .env file in the working directory is also read):
  - WATSONX_APIKEY: your IBM watsonx API key
  - WATSONX_DEPLOYMENT_ID: your deployment ID
  - WATSONX_REGION: IBM Cloud region (optional, defaults to 'us-south')
  - SYSTEM_PROMPT: system prompt override (optional)
  - WATSONX_INSECURE_TLS: set to true only behind a TLS-intercepting proxy (optional)"
    );
}
