#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use localsync_db::error::DbError;
use localsync_db::rpc::{self, RemoteChannel, RequestEnvelope, ResponseEnvelope, WireCodec};
use localsync_db::worker::{ClientSession, ConnectionRegistry, FrameSink};

/// What a scripted worker does with one request.
pub enum Step {
    Forward,
    Fail(DbError),
    Stall,
}

pub type Script = Arc<dyn Fn(&str) -> Step + Send + Sync>;

/// An in-process worker whose replies can be rewritten per request entry.
/// Forwarded requests are served by a real `ClientSession` over `registry`.
pub fn scripted_channel(registry: Arc<ConnectionRegistry>, script: Script) -> Arc<RemoteChannel> {
    let (channel, mut server) = RemoteChannel::in_process(WireCodec::Msgpack);
    let sink: Arc<dyn FrameSink> = Arc::new(server.replies.clone());
    let mut session = ClientSession::new(registry, sink);
    tokio::spawn(async move {
        let mut stalled = Vec::new();
        while let Some(frame) = server.requests.recv().await {
            let (request, wire) =
                rpc::decode_message::<RequestEnvelope>(&frame).expect("request frame");
            let reply = match script(&request.entry) {
                Step::Forward => session.handle_frame(&frame).await,
                Step::Fail(err) => rpc::encode_response(
                    ResponseEnvelope::error(request.request_id, Some(&request.entry), &err),
                    wire,
                )
                .ok(),
                Step::Stall => {
                    stalled.push(request.request_id);
                    None
                }
            };
            if let Some(reply) = reply {
                if server.replies.send(reply).is_err() {
                    break;
                }
            }
        }
    });
    channel
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
