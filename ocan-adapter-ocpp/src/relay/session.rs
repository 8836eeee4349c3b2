//! Bidirectional bridging of one charge point <-> CSMS connection pair
//!
//! ```text
//!  CP source ──pump──► transform ──► [mpsc] ──writer──► CSMS sink
//!  CP sink ◄──writer── [mpsc] ◄── transform ◄──pump── CSMS source
//!                         ▲
//!                 delayed injections
//! ```
//!
//! Each direction has exactly one pump and one writer, so receive order is
//! forward order. Injected messages enter the same queue as relayed ones.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::registry::ConnectionRegistry;
use super::transform::{Effect, Transformer};
use super::RelayError;
use crate::direction::Direction;
use crate::ocpp::OcppMessage;

/// Time writers get to flush queued messages once a session ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest message prefix written to the log
const PREVIEW_LEN: usize = 200;

/// Everything a session needs besides its two connections
#[derive(Clone)]
pub struct SessionContext {
    pub id: u64,
    pub transformer: Arc<Transformer>,
    pub registry: Arc<ConnectionRegistry>,
    pub channel_capacity: usize,
}

struct Shared {
    ctx: SessionContext,
    injections: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn schedule(
        &self,
        tx: mpsc::Sender<Message>,
        direction: Direction,
        message: OcppMessage,
        delay: Duration,
    ) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match message.to_text() {
                Ok(text) => {
                    warn!("[{}] ATTACK: injecting {}", direction, preview(&text));
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        debug!("[{}] Destination gone before injection", direction);
                    }
                }
                Err(e) => error!("Failed to serialize injected message: {}", e),
            }
        });

        let mut tasks = self.injections.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn cancel_injections(&self) {
        for task in self.injections.lock().drain(..) {
            task.abort();
        }
    }
}

/// Relay between the charge point (`downstream`) and CSMS (`upstream`)
/// until either side closes.
///
/// A clean close on either side ends the session with `Ok(())`; a sink that
/// stops accepting messages ends it with [`RelayError::DestinationUnavailable`].
pub async fn bridge<DS, DK, DE, US, UK, UE>(
    ctx: SessionContext,
    downstream: (DS, DK),
    upstream: (US, UK),
) -> Result<(), RelayError>
where
    DS: Stream<Item = Result<Message, DE>> + Send + 'static,
    DE: Display + Send + 'static,
    DK: Sink<Message> + Send + 'static,
    DK::Error: Display,
    US: Stream<Item = Result<Message, UE>> + Send + 'static,
    UE: Display + Send + 'static,
    UK: Sink<Message> + Send + 'static,
    UK::Error: Display,
{
    let (cp_source, cp_sink) = downstream;
    let (csms_source, csms_sink) = upstream;
    let capacity = ctx.channel_capacity.max(1);
    let id = ctx.id;

    let (to_csms_tx, to_csms_rx) = mpsc::channel(capacity);
    let (to_cp_tx, to_cp_rx) = mpsc::channel(capacity);

    let mut to_csms = tokio::spawn(write_all(csms_sink, to_csms_rx, Direction::ChargePointToCsms));
    let mut to_cp = tokio::spawn(write_all(cp_sink, to_cp_rx, Direction::CsmsToChargePoint));

    let shared = Arc::new(Shared {
        ctx,
        injections: Mutex::new(Vec::new()),
    });

    let mut upward = tokio::spawn(pump(
        cp_source,
        to_csms_tx,
        Direction::ChargePointToCsms,
        Arc::clone(&shared),
    ));
    let mut downward = tokio::spawn(pump(
        csms_source,
        to_cp_tx,
        Direction::CsmsToChargePoint,
        Arc::clone(&shared),
    ));

    // A writer can stop before its pump notices, so both are watched
    let (outcome, stopped_writer) = tokio::select! {
        r = &mut upward => (pump_outcome(r), None),
        r = &mut downward => (pump_outcome(r), None),
        r = &mut to_csms => (writer_outcome(r), Some(Direction::ChargePointToCsms)),
        r = &mut to_cp => (writer_outcome(r), Some(Direction::CsmsToChargePoint)),
    };

    upward.abort();
    downward.abort();
    shared.cancel_injections();

    for (direction, mut writer) in [
        (Direction::ChargePointToCsms, to_csms),
        (Direction::CsmsToChargePoint, to_cp),
    ] {
        if stopped_writer == Some(direction) {
            continue;
        }
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await {
            Ok(Ok(Err(e))) => debug!("[{}] Drain stopped: {}", direction, e),
            Ok(_) => {}
            Err(_) => writer.abort(),
        }
    }

    if let Some(info) = shared.ctx.registry.remove(id) {
        info!(
            "Session {} ({}) closed: {} to CSMS, {} to charge point",
            id, info.path, info.to_csms, info.to_charge_point
        );
    }

    match outcome {
        Err(RelayError::ConnectionClosed(direction)) => {
            debug!("Session {} ended by {} close", id, direction);
            Ok(())
        }
        other => other,
    }
}

fn pump_outcome(joined: Result<RelayError, JoinError>) -> Result<(), RelayError> {
    match joined {
        Ok(err) => Err(err),
        Err(e) => Err(task_failed(e)),
    }
}

/// A writer only returns `Ok` once its queue is closed, i.e. after its pump
fn writer_outcome(joined: Result<Result<(), RelayError>, JoinError>) -> Result<(), RelayError> {
    joined.unwrap_or_else(|e| Err(task_failed(e)))
}

fn task_failed(e: JoinError) -> RelayError {
    RelayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Receive, transform and queue messages for one direction
async fn pump<S, E>(
    source: S,
    tx: mpsc::Sender<Message>,
    direction: Direction,
    shared: Arc<Shared>,
) -> RelayError
where
    S: Stream<Item = Result<Message, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    pin_mut!(source);

    while let Some(item) = source.next().await {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                info!("[{}] Connection error: {}", direction, e);
                return RelayError::ConnectionClosed(direction);
            }
        };

        let (outgoing, effect) = match message {
            Message::Text(text) => {
                let n = shared.ctx.registry.record(shared.ctx.id, direction);
                info!("[{}] Message #{}: {}", direction, n, preview(text.as_str()));

                let transformed = shared.ctx.transformer.apply(text.as_str(), direction);
                (
                    transformed.forward.map(|out| Message::Text(out.into())),
                    transformed.effect,
                )
            }
            binary @ Message::Binary(_) => (Some(binary), Effect::None),
            Message::Close(_) => break,
            // Ping/pong are answered by the websocket layer on each hop
            _ => continue,
        };

        if let Some(outgoing) = outgoing {
            if tx.send(outgoing).await.is_err() {
                warn!("[{}] Destination unavailable", direction);
                return RelayError::DestinationUnavailable(direction);
            }
        }

        if let Effect::Inject { message, delay } = effect {
            shared.schedule(tx.clone(), direction, message, delay);
        }
    }

    info!("[{}] Connection closed", direction);
    RelayError::ConnectionClosed(direction)
}

/// Own one sink, writing queued messages until every sender is gone.
///
/// A failed send ends the writer with [`RelayError::DestinationUnavailable`],
/// which tears the whole session down.
async fn write_all<K>(
    sink: K,
    mut rx: mpsc::Receiver<Message>,
    direction: Direction,
) -> Result<(), RelayError>
where
    K: Sink<Message> + Send + 'static,
    K::Error: Display,
{
    pin_mut!(sink);

    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!("[{}] Destination unavailable, send failed: {}", direction, e);
            return Err(RelayError::DestinationUnavailable(direction));
        }
    }

    if let Err(e) = sink.close().await {
        debug!("[{}] Close failed: {}", direction, e);
    }
    Ok(())
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::transform::AttackMode;
    use futures_util::{sink, stream};
    use std::io;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    type Item = Result<Message, io::Error>;

    fn collector() -> (
        impl Sink<Message, Error = io::Error> + Send + 'static,
        UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = unbounded_channel();
        let sink = sink::unfold(tx, |tx, message: Message| async move {
            tx.send(message)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "collector closed"))?;
            Ok::<_, io::Error>(tx)
        });
        (sink, rx)
    }

    /// A source that yields `texts` then stays open
    fn open_source(texts: &[&str]) -> impl Stream<Item = Item> + Send + 'static {
        let items: Vec<Item> = texts
            .iter()
            .map(|t| Ok(Message::Text(t.to_string().into())))
            .collect();
        stream::iter(items).chain(stream::pending())
    }

    /// A source that yields `texts` then closes
    fn closing_source(texts: &[&str]) -> impl Stream<Item = Item> + Send + 'static {
        let items: Vec<Item> = texts
            .iter()
            .map(|t| Ok(Message::Text(t.to_string().into())))
            .collect();
        stream::iter(items)
    }

    fn context(mode: AttackMode) -> (SessionContext, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = registry.register("127.0.0.1:1".parse().unwrap(), "/CP001");
        (
            SessionContext {
                id,
                transformer: Arc::new(Transformer::new(mode)),
                registry: Arc::clone(&registry),
                channel_capacity: 16,
            },
            registry,
        )
    }

    async fn next_text(rx: &mut UnboundedReceiver<Message>) -> String {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match message {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rewrite_in_matching_direction() {
        let (ctx, _) = context(AttackMode::modify_stop());
        let (cp_sink, mut cp_rx) = collector();
        let (csms_sink, mut csms_rx) = collector();

        let session = tokio::spawn(bridge(
            ctx,
            (open_source(&[]), cp_sink),
            (
                open_source(&[r#"[2,"r1","RemoteStartTransaction",{"connectorId":1,"idTag":"U"}]"#]),
                csms_sink,
            ),
        ));

        let text = next_text(&mut cp_rx).await;
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[2], "RemoteStopTransaction");
        assert_eq!(value[3]["transactionId"], 999);
        assert!(csms_rx.try_recv().is_err());

        session.abort();
    }

    #[tokio::test]
    async fn test_order_preserved_with_injection_opposite() {
        let (ctx, _) = context(AttackMode::inject_fake());
        let (cp_sink, mut cp_rx) = collector();
        let (csms_sink, mut csms_rx) = collector();

        let session = tokio::spawn(bridge(
            ctx,
            (
                open_source(&[
                    r#"[2,"m1","MeterValues",{}]"#,
                    r#"[2,"m2","StatusNotification",{}]"#,
                ]),
                cp_sink,
            ),
            (open_source(&[r#"[2,"b","BootNotification",{}]"#]), csms_sink),
        ));

        assert!(next_text(&mut csms_rx).await.contains("\"m1\""));
        assert!(next_text(&mut csms_rx).await.contains("\"m2\""));

        // The trigger is forwarded first, the forged call follows
        assert!(next_text(&mut cp_rx).await.contains("BootNotification"));
        let forged = next_text(&mut cp_rx).await;
        assert!(forged.contains("FAKE_INJECTED_TAG"));

        session.abort();
    }

    #[tokio::test]
    async fn test_close_ends_session_and_cancels_injection() {
        let (mut ctx, registry) = context(AttackMode::InjectAfter {
            trigger: "BootNotification".into(),
            direction: Direction::CsmsToChargePoint,
            action: "RemoteStartTransaction".into(),
            payload: serde_json::json!({}),
            delay: Duration::from_secs(30),
        });
        ctx.channel_capacity = 4;
        let id = ctx.id;
        let (cp_sink, mut cp_rx) = collector();
        let (csms_sink, _csms_rx) = collector();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            bridge(
                ctx,
                (closing_source(&[r#"[2,"x","Heartbeat",{}]"#]), cp_sink),
                (open_source(&[r#"[2,"b","BootNotification",{}]"#]), csms_sink),
            ),
        )
        .await
        .expect("session did not end");

        assert!(result.is_ok());
        assert!(registry.get(id).is_none());

        // Queue drained, no forged message sneaks out after the close
        let mut texts = Vec::new();
        while let Ok(Message::Text(text)) = cp_rx.try_recv() {
            texts.push(text.as_str().to_string());
        }
        assert!(texts.iter().all(|t| !t.contains("RemoteStartTransaction")));
    }

    #[tokio::test]
    async fn test_unparseable_and_binary_pass_through() {
        let (ctx, registry) = context(AttackMode::modify_stop());
        let id = ctx.id;
        let (cp_sink, _cp_rx) = collector();
        let (csms_sink, mut csms_rx) = collector();

        let source = stream::iter(vec![
            Ok::<_, io::Error>(Message::Text("garbage".to_string().into())),
            Ok(Message::Binary(vec![1, 2, 3].into())),
        ])
        .chain(stream::pending());

        let session = tokio::spawn(bridge(
            ctx,
            (source, cp_sink),
            (open_source(&[]), csms_sink),
        ));

        assert_eq!(next_text(&mut csms_rx).await, "garbage");
        let binary = tokio::time::timeout(Duration::from_secs(2), csms_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(binary, Message::Binary(_)));
        assert_eq!(registry.get(id).unwrap().to_csms, 1);

        session.abort();
    }

    #[tokio::test]
    async fn test_failed_send_ends_idle_session() {
        let (ctx, registry) = context(AttackMode::None);
        let id = ctx.id;
        let (cp_sink, _cp_rx) = collector();
        let (csms_sink, csms_rx) = collector();
        drop(csms_rx);

        // One message, then both sources stay open and quiet
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            bridge(
                ctx,
                (open_source(&[r#"[2,"h1","Heartbeat",{}]"#]), cp_sink),
                (open_source(&[]), csms_sink),
            ),
        )
        .await
        .expect("session did not end");

        assert!(matches!(
            result,
            Err(RelayError::DestinationUnavailable(Direction::ChargePointToCsms))
        ));
        assert!(registry.get(id).is_none());
    }

    #[tokio::test]
    async fn test_failed_send_toward_charge_point_ends_session() {
        let (ctx, registry) = context(AttackMode::None);
        let id = ctx.id;
        let (cp_sink, cp_rx) = collector();
        let (csms_sink, _csms_rx) = collector();
        drop(cp_rx);

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            bridge(
                ctx,
                (open_source(&[]), cp_sink),
                (open_source(&[r#"[2,"g1","GetConfiguration",{}]"#]), csms_sink),
            ),
        )
        .await
        .expect("session did not end");

        assert!(matches!(
            result,
            Err(RelayError::DestinationUnavailable(Direction::CsmsToChargePoint))
        ));
        assert!(registry.is_empty());
        assert_eq!(registry.relayed_total(), 1);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "ş".repeat(300);
        assert_eq!(preview(&long).chars().count(), PREVIEW_LEN);
        assert_eq!(preview("short"), "short");
    }
}
