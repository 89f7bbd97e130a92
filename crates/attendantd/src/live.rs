//! Live arrival feed for a session report.

use crate::api::ApiClient;
use crate::context::Activation;
use attendant_core::feed::{ArrivalDeduper, PushEvent, SseDecoder};
use attendant_core::ArrivalRecord;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("connection lost: {0}")]
    Transport(String),
}

/// Raw event payloads of one push connection.
pub type PayloadStream = BoxStream<'static, Result<String, FeedError>>;

/// Opens the push channel of a session.
pub trait PushTransport: Send + Sync {
    fn open(&self, session_id: i64) -> PayloadStream;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Records not seen before in this subscription, in receipt order.
    Arrivals(Vec<ArrivalRecord>),
    PresentCount(u64),
    /// One per `attendance_update`; names the last student in the event.
    Notification { count: u64, message: Option<String> },
    ConnectionLost,
}

/// Server-Sent Events over the API client's HTTP session.
pub struct SseTransport {
    api: Arc<ApiClient>,
}

impl SseTransport {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

impl PushTransport for SseTransport {
    fn open(&self, session_id: i64) -> PayloadStream {
        let request = self
            .api
            .request(reqwest::Method::GET, &ApiClient::live_path(session_id))
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let connect = async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => {
                    tracing::info!(session_id, "live feed connected");
                    decode_body(response.bytes_stream())
                }
                Err(e) => stream::iter([Err(FeedError::Transport(e.to_string()))]).boxed(),
            }
        };
        stream::once(connect).flatten().boxed()
    }
}

/// Turn a byte stream into SSE `data` payloads. UTF-8 sequences split across
/// chunks are carried over to the next chunk.
fn decode_body<S, B, E>(body: S) -> PayloadStream
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut decoder = SseDecoder::new();
    let mut carry: Vec<u8> = Vec::new();

    body.flat_map(move |chunk| {
        let items: Vec<Result<String, FeedError>> = match chunk {
            Ok(bytes) => {
                carry.extend_from_slice(bytes.as_ref());
                let text = take_utf8(&mut carry);
                decoder.push(&text).into_iter().map(Ok).collect()
            }
            Err(e) => vec![Err(FeedError::Transport(e.to_string()))],
        };
        stream::iter(items)
    })
    .boxed()
}

/// Drain the decodable prefix of `carry`. Invalid bytes become U+FFFD; only
/// a truncated sequence at the very end stays behind for the next chunk.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(carry) {
            Ok(rest) => {
                text.push_str(rest);
                carry.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match e.error_len() {
                    Some(len) => {
                        tracing::warn!(bytes = len, "invalid UTF-8 in live feed replaced");
                        text.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + len);
                    }
                    None => {
                        carry.drain(..valid);
                        return text;
                    }
                }
            }
        }
    }
}

/// Handle to one running subscription. Cancelling is idempotent.
#[derive(Clone)]
pub struct Subscription {
    session_id: i64,
    token: CancellationToken,
}

impl Subscription {
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(session_id = self.session_id, "live feed unsubscribed");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One push subscription at a time; subscribing again replaces the old one.
pub struct LiveFeed {
    transport: Arc<dyn PushTransport>,
    current: Mutex<Option<Subscription>>,
}

impl LiveFeed {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            current: Mutex::new(None),
        }
    }

    /// Subscribe to a session. The previous subscription is cancelled and its
    /// dedup state dropped. The subscription also ends with the activation.
    pub fn subscribe(&self, session_id: i64, activation: &Activation) -> (Subscription, mpsc::UnboundedReceiver<FeedEvent>) {
        let subscription = Subscription {
            session_id,
            token: activation.token().child_token(),
        };
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(subscription.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let payloads = self.transport.open(session_id);
        tokio::spawn(run_feed(session_id, payloads, subscription.token.clone(), tx));
        (subscription, rx)
    }

    pub fn cancel(&self) {
        if let Some(current) = self.current.lock().unwrap_or_else(|e| e.into_inner()).take() {
            current.cancel();
        }
    }
}

async fn run_feed(
    session_id: i64,
    mut payloads: PayloadStream,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<FeedEvent>,
) {
    let mut deduper = ArrivalDeduper::new();
    let mut notifications: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = payloads.next() => next,
        };
        if token.is_cancelled() {
            break;
        }

        let payload = match next {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                tracing::warn!(session_id, error = %e, "live feed connection lost");
                let _ = tx.send(FeedEvent::ConnectionLost);
                break;
            }
            None => {
                tracing::warn!(session_id, "live feed closed by server");
                let _ = tx.send(FeedEvent::ConnectionLost);
                break;
            }
        };

        let (count, students) = match PushEvent::parse(&payload) {
            Ok(PushEvent::AttendanceUpdate { count, students }) => (count, students),
            Ok(PushEvent::Other) => continue,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "skipping unparseable push event");
                continue;
            }
        };

        notifications += 1;
        let message = students.last().map(|latest| format!("{} marked attendance", latest.name));
        let update = deduper.ingest(count, students);
        let mut out = Vec::with_capacity(3);
        out.push(FeedEvent::Notification {
            count: notifications,
            message,
        });
        if !update.arrivals.is_empty() {
            out.push(FeedEvent::Arrivals(update.arrivals));
        }
        out.push(FeedEvent::PresentCount(update.present_count));

        for event in out {
            if tx.send(event).is_err() {
                return;
            }
        }
    }
    tracing::debug!(session_id, seen = deduper.seen(), "live feed stopped");
}
