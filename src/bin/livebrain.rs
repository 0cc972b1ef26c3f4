use anyhow::{Context, Result};
use clap::Parser;
use livebrain::{
    config::ConfigManager,
    observability::init_logging,
    service::{BrainService, Downstream, Incoming, NdjsonDownstream},
    transport::DecisionFeed,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// ライブコメントの発話判定エンジン
#[derive(Parser, Debug)]
#[command(name = "livebrain", version, about)]
struct Args {
    /// 設定ファイル（省略時は既定の設定ディレクトリの config.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 入力 NDJSON ファイル（省略時は標準入力）
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 判定を標準出力ではなく WebSocket で配信する
    #[arg(long)]
    ws_port: Option<u16>,

    /// デバッグログを有効化
    #[arg(long)]
    debug: bool,

    /// 販売ファネル状態機械を無効化
    #[arg(long)]
    no_state_machine: bool,

    /// 有効な設定を TOML で表示して終了
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_manager = match &args.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = config_manager.load_config()?;
    if args.no_state_machine {
        config.brain.enable_state_machine = false;
    }

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.log, args.debug)?;
    tracing::info!("🎬 Starting livebrain {}", env!("CARGO_PKG_VERSION"));

    let feed = match args.ws_port {
        Some(port) => {
            let feed = DecisionFeed::bind(("127.0.0.1", port))
                .await
                .with_context(|| format!("Failed to bind decision feed on port {}", port))?;
            eprintln!("🌐 ws://{}", feed.local_addr());
            Some(Arc::new(feed))
        }
        None => None,
    };
    let downstream: Arc<dyn Downstream> = match &feed {
        Some(feed) => feed.clone(),
        None => Arc::new(NdjsonDownstream::new(tokio::io::stdout())),
    };

    let service = BrainService::new(config)?;
    let (handle, service_task) = service.start(downstream);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input: {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let input_handle = handle.clone();
    let mut input_task = tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut submitted = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if input_handle.submit(Incoming::Line(line)).await.is_err() {
                        break;
                    }
                    submitted += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("❌ Failed to read input: {}", e);
                    break;
                }
            }
        }
        submitted
    });

    tokio::select! {
        result = &mut input_task => {
            let submitted = result.unwrap_or(0);
            tracing::info!(submitted, "📥 Input finished");
            if feed.is_some() {
                // 配信モードではクライアントのために終了シグナルまで待つ
                tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("🛑 終了シグナルを受信しました");
            input_task.abort();
        }
    }

    handle.shutdown();
    let report = service_task.await.context("Brain service task failed")?;

    if let Some(feed) = &feed {
        feed.close();
    }

    let summary = serde_json::json!({
        "snapshot": report.snapshot,
        "forwarded": report.forward.delivered,
        "forward_failed": report.forward.failed,
        "metrics": report.metrics,
    });
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);

    tracing::info!("👋 livebrain shutting down");
    Ok(())
}
