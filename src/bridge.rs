// Transport bridge: WebSocket boundary between the remote controller and the loop
//
// Socket tasks never do robot I/O. They only
// - overwrite the latest stick sample (last write wins)
// - queue operator requests (estop, resume, recording)
// - forward whatever the loop broadcasts (status, notices) plus their own pings
// The control loop reads all of it through `BridgeHandle` once per tick.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::messages::{InboundMessage, OutboundMessage, RecordingCommand, StickSample, wall_clock};

/// Outbound messages buffered per client before it starts skipping
const OUTBOUND_CAPACITY: usize = 64;

/// Things the operator asks for, applied by the loop in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorRequest {
    Estop(String),
    Resume,
    Recording(RecordingCommand),
    /// Toggle recording (keyboard)
    ToggleRecording,
    Quit,
}

#[derive(Debug, Default)]
struct ControllerInputs {
    latest: Option<(StickSample, Instant)>,
    clients: usize,
    latency_ms: Option<f64>,
}

/// What the loop sees of the controller at one tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerSnapshot {
    pub sample: Option<StickSample>,
    /// Local receive time of `sample`
    pub received_at: Option<Instant>,
    pub connected: bool,
    pub latency_ms: Option<f64>,
}

/// Producer end, cloned into every socket task and the keyboard controller
#[derive(Debug, Clone)]
pub struct BridgePort {
    inputs: Arc<Mutex<ControllerInputs>>,
    requests: mpsc::UnboundedSender<OperatorRequest>,
    outbound: broadcast::Sender<OutboundMessage>,
}

/// Control loop end
#[derive(Debug)]
pub struct BridgeHandle {
    inputs: Arc<Mutex<ControllerInputs>>,
    requests: mpsc::UnboundedReceiver<OperatorRequest>,
    outbound: broadcast::Sender<OutboundMessage>,
}

pub fn channel() -> (BridgeHandle, BridgePort) {
    let inputs = Arc::new(Mutex::new(ControllerInputs::default()));
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (out_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);
    (
        BridgeHandle {
            inputs: inputs.clone(),
            requests: req_rx,
            outbound: out_tx.clone(),
        },
        BridgePort {
            inputs,
            requests: req_tx,
            outbound: out_tx,
        },
    )
}

// A panicked socket task cannot leave the inputs half-written, every write is one field
fn lock(inputs: &Mutex<ControllerInputs>) -> MutexGuard<'_, ControllerInputs> {
    inputs.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgePort {
    pub fn submit_stick(&self, sample: StickSample) {
        self.submit_stick_at(sample, Instant::now());
    }

    pub fn submit_stick_at(&self, sample: StickSample, received_at: Instant) {
        lock(&self.inputs).latest = Some((sample, received_at));
    }

    pub fn request(&self, request: OperatorRequest) {
        // Loop gone means we are shutting down
        let _ = self.requests.send(request);
    }

    pub fn client_connected(&self) -> usize {
        let mut inputs = lock(&self.inputs);
        inputs.clients += 1;
        inputs.clients
    }

    pub fn client_disconnected(&self) -> usize {
        let mut inputs = lock(&self.inputs);
        inputs.clients = inputs.clients.saturating_sub(1);
        if inputs.clients == 0 {
            // Nobody left to vouch for the last sample
            inputs.latest = None;
        }
        inputs.clients
    }

    pub fn set_latency(&self, latency_ms: f64) {
        lock(&self.inputs).latency_ms = Some(latency_ms);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl BridgeHandle {
    pub fn snapshot(&self) -> ControllerSnapshot {
        let inputs = lock(&self.inputs);
        ControllerSnapshot {
            sample: inputs.latest.map(|(sample, _)| sample),
            received_at: inputs.latest.map(|(_, at)| at),
            connected: inputs.clients > 0,
            latency_ms: inputs.latency_ms,
        }
    }

    pub fn drain_requests(&mut self) -> Vec<OperatorRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.requests.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Send to every connected controller; dropped if nobody is listening
    pub fn publish(&self, message: OutboundMessage) {
        let _ = self.outbound.send(message);
    }
}

/// Apply one text frame from a controller. Returns a direct reply, if any.
///
/// Malformed messages are dropped here and never reach the loop.
pub fn handle_text(port: &BridgePort, text: &str) -> Option<OutboundMessage> {
    let message = match InboundMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Dropping malformed message ({}): {}", e, text);
            return None;
        }
    };

    match message {
        InboundMessage::Stick { x, y, ts } => {
            port.submit_stick(StickSample { x, y, timestamp: ts });
            None
        }
        InboundMessage::Estop { reason } => {
            port.request(OperatorRequest::Estop(reason));
            None
        }
        InboundMessage::Resume {} => {
            port.request(OperatorRequest::Resume);
            None
        }
        InboundMessage::Recording { command } => {
            port.request(OperatorRequest::Recording(command));
            None
        }
        InboundMessage::Ping { ts } => Some(OutboundMessage::Pong { ts }),
        InboundMessage::Pong { ts } => {
            let rtt_ms = (wall_clock() - ts) * 1000.0;
            if rtt_ms.is_finite() && rtt_ms >= 0.0 {
                port.set_latency(rtt_ms);
            }
            None
        }
    }
}

#[derive(Clone)]
struct ServerState {
    port: BridgePort,
    ping_interval: Duration,
}

/// `/ws` for controllers, plus the controller UI when a static directory is given
pub fn router(port: BridgePort, ping_interval: Duration, static_dir: Option<&Path>) -> Router {
    let app = Router::new().route("/ws", get(ws_handler)).with_state(ServerState {
        port,
        ping_interval,
    });
    let app = match static_dir {
        Some(dir) => {
            info!("Serving controller UI from {}", dir.display());
            app.fallback_service(ServeDir::new(dir))
        }
        None => app,
    };
    app.layer(TraceLayer::new_for_http())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let ServerState {
        port,
        ping_interval,
    } = state;
    let (mut sink, mut stream) = socket.split();
    let mut outbound = port.subscribe();
    let mut ping = interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let clients = port.client_connected();
    info!("Controller connected ({} open)", clients);

    loop {
        let reply = tokio::select! {
            _ = ping.tick() => Some(OutboundMessage::Ping { ts: wall_clock() }),
            message = outbound.recv() => match message {
                Ok(message) => Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Controller lagging, skipped {} messages", skipped);
                    None
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&port, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    break;
                }
            },
        };

        let Some(reply) = reply else {
            continue;
        };
        let json = match reply.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }

    let clients = port.client_disconnected();
    info!("Controller disconnected ({} open)", clients);
}
