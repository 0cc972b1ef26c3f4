//! WebSocket による SPEAK 判定の配信
//!
//! 接続中の全クライアントへ同じフレームを流す一方向のフィード。
//! フレームは `{"type": ..., "data": ...}` 形式の JSON で、接続直後に `info` が 1 回届く。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::{LiveBrainError, LiveBrainResult};
use crate::io::DecisionEnvelope;
use crate::service::Downstream;

/// 遅いクライアントのために保持するフレーム数
const FEED_BACKLOG: usize = 256;

/// クライアントへ送るフレーム
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FeedFrame {
    Decision(Box<DecisionEnvelope>),
    Info { version: String, subscribers: usize },
    Error { message: String },
}

/// クライアントからの要求
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedRequest {
    Ping,
    Info,
}

/// SPEAK 判定の配信口
///
/// `bind` した時点で受付を始め、`close` で全接続を閉じる。
pub struct DecisionFeed {
    local_addr: SocketAddr,
    frames: broadcast::Sender<String>,
    subscribers: Arc<AtomicUsize>,
    closed: watch::Sender<bool>,
}

impl DecisionFeed {
    pub async fn bind(addr: impl ToSocketAddrs) -> LiveBrainResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (frames, _) = broadcast::channel(FEED_BACKLOG);
        let (closed, closed_rx) = watch::channel(false);
        let subscribers = Arc::new(AtomicUsize::new(0));

        tokio::spawn(accept_loop(listener, frames.clone(), Arc::clone(&subscribers), closed_rx));
        info!(addr = %local_addr, "🌐 Decision feed listening");

        Ok(Self {
            local_addr,
            frames,
            subscribers,
            closed,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 判定を受け取れる状態のクライアント数
    pub fn subscribers(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// 判定を全クライアントへ流し、届け先の数を返す
    pub fn publish(&self, envelope: &DecisionEnvelope) -> LiveBrainResult<usize> {
        let frame = encode(&FeedFrame::Decision(Box::new(envelope.clone())))?;
        self.frames
            .send(frame)
            .map_err(|_| LiveBrainError::downstream("no feed subscribers"))
    }

    /// 受付を止め、接続中のクライアントに Close を送る
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(addr = %self.local_addr, "🛑 Decision feed closed");
        }
    }
}

impl Drop for DecisionFeed {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl Downstream for DecisionFeed {
    async fn forward(&self, envelope: &DecisionEnvelope) -> LiveBrainResult<()> {
        let delivered = self.publish(envelope)?;
        trace!(delivered, "Decision published to feed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

fn encode(frame: &FeedFrame) -> LiveBrainResult<String> {
    serde_json::to_string(frame).map_err(|source| LiveBrainError::Json { line: 0, source })
}

fn info_frame(subscribers: &AtomicUsize) -> LiveBrainResult<String> {
    encode(&FeedFrame::Info {
        version: env!("CARGO_PKG_VERSION").to_string(),
        subscribers: subscribers.load(Ordering::SeqCst),
    })
}

async fn accept_loop(
    listener: TcpListener,
    frames: broadcast::Sender<String>,
    subscribers: Arc<AtomicUsize>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let frames = frames.subscribe();
                    let subscribers = Arc::clone(&subscribers);
                    let closed = closed.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, frames, subscribers, closed).await {
                            warn!(peer = %peer, error = %e, "⚠️ Feed client dropped");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "❌ Failed to accept feed connection"),
            },
        }
    }
    debug!("Feed accept loop stopped");
}

/// 切断時に購読者数を戻す
struct Subscription(Arc<AtomicUsize>);

impl Subscription {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_client(
    stream: TcpStream,
    mut frames: broadcast::Receiver<String>,
    subscribers: Arc<AtomicUsize>,
    mut closed: watch::Receiver<bool>,
) -> LiveBrainResult<()> {
    let peer = stream.peer_addr()?;
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| LiveBrainError::downstream(format!("handshake with {} failed: {}", peer, e)))?;
    let (mut sink, mut source) = socket.split();
    let _subscription = Subscription::new(Arc::clone(&subscribers));
    info!(peer = %peer, subscribers = subscribers.load(Ordering::SeqCst), "📥 Feed client connected");

    let send_failed = |e: tokio_tungstenite::tungstenite::Error| LiveBrainError::downstream(e.to_string());
    sink.send(Message::Text(info_frame(&subscribers)?))
        .await
        .map_err(send_failed)?;

    loop {
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = frames.recv() => match frame {
                Ok(text) => sink.send(Message::Text(text)).await.map_err(send_failed)?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(peer = %peer, skipped, "⚠️ Feed client lagging, decisions skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = source.next() => {
                let reply = match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<FeedRequest>(&text) {
                        Ok(FeedRequest::Ping) => Message::Pong(Vec::new()),
                        Ok(FeedRequest::Info) => Message::Text(info_frame(&subscribers)?),
                        Err(e) => Message::Text(encode(&FeedFrame::Error {
                            message: format!("unrecognized request: {}", e),
                        })?),
                    },
                    Some(Ok(Message::Ping(payload))) => Message::Pong(payload),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(LiveBrainError::downstream(e.to_string())),
                };
                sink.send(reply).await.map_err(send_failed)?;
            }
        }
    }

    info!(peer = %peer, "📤 Feed client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{CommentEvent, Intent, LiveBrain};
    use crate::config::BrainConfig;
    use chrono::Utc;
    use std::time::Duration;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn envelope() -> DecisionEnvelope {
        let now = Utc::now();
        let mut brain = LiveBrain::new(BrainConfig::default(), now);
        let decision = brain.decide(CommentEvent::new("u1", "giá bao nhiêu", Intent::PriceQuestion, now), now);
        DecisionEnvelope::from(&decision)
    }

    /// 接続し、最初の info フレームを読み捨てる
    async fn subscribe(feed: &DecisionFeed) -> Client {
        let url = format!("ws://{}", feed.local_addr());
        let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        match next_frame(&mut client).await {
            FeedFrame::Info { subscribers, .. } => assert!(subscribers >= 1),
            other => panic!("expected info frame, got {:?}", other),
        }
        client
    }

    async fn next_message(client: &mut Client) -> Message {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn next_frame(client: &mut Client) -> FeedFrame {
        match next_message(client).await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_shape() {
        let json = serde_json::to_value(FeedFrame::Error { message: "x".into() }).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["message"], "x");

        let request: FeedRequest = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(request, FeedRequest::Ping));
    }

    #[tokio::test]
    async fn test_forward_without_subscribers_is_unavailable() {
        let feed = DecisionFeed::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(feed.subscribers(), 0);
        let err = feed.forward(&envelope()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_decision_reaches_every_subscriber() {
        let feed = DecisionFeed::bind("127.0.0.1:0").await.unwrap();
        let mut first = subscribe(&feed).await;
        let mut second = subscribe(&feed).await;
        assert_eq!(feed.subscribers(), 2);

        feed.forward(&envelope()).await.unwrap();

        for client in [&mut first, &mut second] {
            match next_frame(client).await {
                FeedFrame::Decision(received) => {
                    assert_eq!(received.input.user_id.as_deref(), Some("u1"));
                    assert_eq!(received.decision.priority, 9);
                }
                other => panic!("expected decision, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_ping_and_info_requests() {
        let feed = DecisionFeed::bind("127.0.0.1:0").await.unwrap();
        let mut client = subscribe(&feed).await;

        client.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert!(matches!(next_message(&mut client).await, Message::Pong(_)));

        client.send(Message::Text(r#"{"type":"info"}"#.into())).await.unwrap();
        assert!(matches!(next_frame(&mut client).await, FeedFrame::Info { subscribers: 1, .. }));

        client.send(Message::Text("hello".into())).await.unwrap();
        assert!(matches!(next_frame(&mut client).await, FeedFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_close_disconnects_clients() {
        let feed = DecisionFeed::bind("127.0.0.1:0").await.unwrap();
        let mut client = subscribe(&feed).await;

        feed.close();
        assert!(matches!(next_message(&mut client).await, Message::Close(_)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while feed.subscribers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
