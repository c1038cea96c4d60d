//! WebSocket channel factory
//!
//! Thin adapter mapping a tokio-tungstenite connection onto the channel
//! lifecycle contract:
//! - handshake ok → `opened`
//! - handshake error/timeout → `open_failed` + `closed("connect_error")`
//! - server Close frame → `closed("io server disconnect")`
//! - read error / stream end → `engine_closed(..)`
//! - `disconnect()` → Close frame + `closed("io client disconnect")`
//!
//! Events are only delivered while the lifecycle listener is attached.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{
    ChannelEvent, ChannelFactory, ChannelHandle, ChannelListener, ChannelOptions, ConnectionParams,
};

const WEBSOCKET_TRANSPORT: &str = "websocket";

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Opens WebSocket channels. Text frames go to the optional message sink.
#[derive(Debug, Clone, Default)]
pub struct WsChannelFactory {
    messages: Option<mpsc::UnboundedSender<String>>,
}

impl WsChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose channels forward inbound text frames to the returned receiver
    pub fn with_message_sink() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { messages: Some(tx) }, rx)
    }
}

impl ChannelFactory for WsChannelFactory {
    fn open(
        &self,
        params: &ConnectionParams,
        options: &ChannelOptions,
        listener: ChannelListener,
    ) -> Result<Box<dyn ChannelHandle>> {
        if !options.transports.iter().any(|t| t == WEBSOCKET_TRANSPORT) {
            bail!("no supported transport in {:?}", options.transports);
        }
        let url = params.url()?;

        let lifecycle: Slot<ChannelListener> = Arc::new(Mutex::new(Some(listener)));
        let sink: Slot<mpsc::UnboundedSender<String>> = Arc::new(Mutex::new(self.messages.clone()));
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run_channel(
            url,
            options.connect_timeout(),
            lifecycle.clone(),
            sink.clone(),
            stop_rx,
        ));

        Ok(Box::new(WsChannelHandle {
            lifecycle,
            sink,
            stop: Some(stop_tx),
            task,
        }))
    }
}

/// Handle to one WebSocket channel task
pub struct WsChannelHandle {
    lifecycle: Slot<ChannelListener>,
    sink: Slot<mpsc::UnboundedSender<String>>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WsChannelHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl ChannelHandle for WsChannelHandle {
    fn remove_all_listeners(&mut self) -> Result<()> {
        self.lifecycle.lock().take();
        Ok(())
    }

    fn off_any(&mut self) -> Result<()> {
        self.sink.lock().take();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        match self.stop.take() {
            Some(stop) => {
                // The task may already be gone; that is a completed disconnect
                let _ = stop.send(());
                Ok(())
            }
            None => bail!("channel already disconnected"),
        }
    }
}

fn emit(lifecycle: &Slot<ChannelListener>, event: ChannelEvent) {
    if let Some(listener) = lifecycle.lock().as_ref() {
        listener.emit(event);
    }
}

async fn run_channel(
    url: Url,
    connect_timeout: Duration,
    lifecycle: Slot<ChannelListener>,
    sink: Slot<mpsc::UnboundedSender<String>>,
    mut stop: oneshot::Receiver<()>,
) {
    debug!(url = %url, "ws_channel_connecting");

    let handshake = tokio::time::timeout(connect_timeout, connect_async(url.as_str()));
    let ws_stream = tokio::select! {
        _ = &mut stop => {
            debug!(url = %url, "ws_channel_stopped_before_open");
            return;
        }
        result = handshake => match result {
            Ok(Ok((stream, response))) => {
                info!(url = %url, status = %response.status(), "ws_channel_open");
                stream
            }
            Ok(Err(e)) => {
                emit(&lifecycle, ChannelEvent::OpenFailed(e.to_string()));
                emit(&lifecycle, ChannelEvent::Closed("connect_error".to_string()));
                return;
            }
            Err(_) => {
                emit(
                    &lifecycle,
                    ChannelEvent::OpenFailed(format!("handshake timed out after {connect_timeout:?}")),
                );
                emit(&lifecycle, ChannelEvent::Closed("connect_error".to_string()));
                return;
            }
        }
    };

    emit(&lifecycle, ChannelEvent::Opened);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = &mut stop => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(url = %url, error = %e, "ws_close_frame_failed");
                }
                emit(&lifecycle, ChannelEvent::Closed("io client disconnect".to_string()));
                break;
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        debug!(url = %url, bytes = text.len(), "ws_message");
                    }
                    if let Some(tx) = sink.lock().as_ref() {
                        if tx.send(text).is_err() {
                            warn!(url = %url, "ws_message_sink_closed");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        emit(&lifecycle, ChannelEvent::EngineClosed(format!("transport error: {e}")));
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(url = %url, ?frame, "ws_server_close");
                    emit(&lifecycle, ChannelEvent::Closed("io server disconnect".to_string()));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(&lifecycle, ChannelEvent::EngineClosed(format!("transport error: {e}")));
                    break;
                }
                None => {
                    emit(&lifecycle, ChannelEvent::EngineClosed("transport close".to_string()));
                    break;
                }
            }
        }
    }

    debug!(url = %url, "ws_channel_task_exit");
}
