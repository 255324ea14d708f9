use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use shared::{
    error::FrameError,
    protocol::{InboundEvent, OutboundEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    error::{ClientError, ClientResult},
    token_store::Credential,
};

const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected,
    Inbound(InboundEvent),
    /// `expected` is false when the socket dropped without a local disconnect.
    Disconnected { expected: bool },
}

/// The single push connection, bound to the credential it was opened with.
pub struct RealtimeChannel {
    settings: Settings,
    events: broadcast::Sender<RealtimeEvent>,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    next_generation: u64,
    active: Option<ActiveConnection>,
}

struct ActiveConnection {
    generation: u64,
    credential: Credential,
    outbound: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ActiveConnection {
    /// Returns the writer, which drains queued frames and then sends a close
    /// frame once the sender is gone.
    fn shut_down(self) -> JoinHandle<()> {
        drop(self.outbound);
        self.reader_task.abort();
        self.writer_task
    }
}

impl RealtimeChannel {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            settings,
            events,
            state: Mutex::new(ChannelState::default()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    pub async fn is_connected_with(&self, credential: &Credential) -> bool {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .is_some_and(|active| &active.credential == credential)
    }

    /// Opens a connection authenticated with `credential`, replacing any
    /// existing one.
    pub async fn connect(self: &Arc<Self>, credential: &Credential) -> ClientResult<()> {
        self.disconnect().await;

        let url = self.settings.realtime_url(credential.expose())?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Realtime(format!("failed to connect websocket: {err}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let mut state = self.state.lock().await;
        if let Some(previous) = state.active.take() {
            // A concurrent connect won the race; the newest call wins.
            drop(previous.shut_down());
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        // Published before the reader starts so it precedes any inbound event.
        info!(generation, "realtime: connected");
        let _ = self.events.send(RealtimeEvent::Connected);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(message).await {
                    warn!("realtime: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let channel = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match InboundEvent::decode(&text) {
                        Ok(event) => {
                            debug!(event = event.event_name(), "realtime: inbound event");
                            let _ = channel.events.send(RealtimeEvent::Inbound(event));
                        }
                        Err(FrameError::UnknownEvent(name)) => {
                            debug!(event = %name, "realtime: ignoring unknown event");
                        }
                        Err(err) => warn!("realtime: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("realtime: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            channel.connection_dropped(generation).await;
        });

        state.active = Some(ActiveConnection {
            generation,
            credential: credential.clone(),
            outbound,
            reader_task,
            writer_task,
        });
        Ok(())
    }

    pub async fn disconnect(&self) {
        let active = self.state.lock().await.active.take();
        if let Some(active) = active {
            info!(generation = active.generation, "realtime: disconnecting");
            let writer = active.shut_down();
            let _ = self
                .events
                .send(RealtimeEvent::Disconnected { expected: true });
            if timeout(WRITER_CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("realtime: writer did not close in time, detaching it");
            }
        }
    }

    /// Best-effort, at-most-once send. Nothing is queued while disconnected.
    pub async fn emit(&self, event: &OutboundEvent) -> ClientResult<()> {
        let text = serde_json::to_string(event)?;
        let state = self.state.lock().await;
        let active = state.active.as_ref().ok_or(ClientError::NotConnected)?;
        active
            .outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)?;
        debug!(event = event.event_name(), "realtime: emitted");
        Ok(())
    }

    async fn connection_dropped(&self, generation: u64) {
        let mut state = self.state.lock().await;
        let is_current = state
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !is_current {
            return;
        }
        if let Some(active) = state.active.take() {
            drop(active.outbound);
            active.writer_task.abort();
        }
        drop(state);

        warn!(generation, "realtime: connection lost");
        let _ = self
            .events
            .send(RealtimeEvent::Disconnected { expected: false });
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
