// Robot link: BLE session with the toio Core Cube
//
// The control loop never touches BLE directly. It holds a `LinkHandle`:
// - commands go out through a latest-value channel (an unsent command is
//   superseded by the next tick, nothing queues up)
// - connection changes and sensor notifications come back on one event channel
// The driver task owns the other end (`LinkPort`).

mod driver;
pub mod toio;

pub use driver::{ToioDriver, discover};
pub use toio::SensorEvent;

use tokio::sync::{mpsc, watch};
use tracing::warn;
use uuid::Uuid;

use crate::messages::MotorCommand;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("No Bluetooth adapter available")]
    NoAdapter,

    #[error("No toio Core Cube found after {attempts} scan attempts")]
    NotFound { attempts: u32 },

    #[error("Characteristic {0} not found on the cube")]
    MissingCharacteristic(Uuid),

    #[error("Cube {0} did not stay connected")]
    NotConnected(String),
}

/// Everything the robot side reports to the control loop
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connecting,
    Connected { address: String },
    Disconnected { reason: String },
    Sensor(SensorEvent),
}

/// Control loop end of the link
#[derive(Debug)]
pub struct LinkHandle {
    commands: watch::Sender<MotorCommand>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    closed: bool,
}

/// Driver end of the link
#[derive(Debug)]
pub struct LinkPort {
    commands: watch::Receiver<MotorCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

pub fn channel() -> (LinkHandle, LinkPort) {
    let (cmd_tx, cmd_rx) = watch::channel(MotorCommand::STOP);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        LinkHandle {
            commands: cmd_tx,
            events: event_rx,
            closed: false,
        },
        LinkPort {
            commands: cmd_rx,
            events: event_tx,
        },
    )
}

impl LinkHandle {
    /// Fire-and-forget dispatch; replaces any command the driver has not written yet
    pub fn send(&self, cmd: MotorCommand) {
        self.commands.send_replace(cmd);
    }

    /// Drain pending events without waiting.
    ///
    /// If the driver side has gone away a single `Disconnected` is reported,
    /// so a dead session is noticed on the very next tick.
    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.closed {
                        self.closed = true;
                        warn!("Link driver stopped");
                        events.push(LinkEvent::Disconnected {
                            reason: "link driver stopped".to_string(),
                        });
                    }
                    break;
                }
            }
        }
        events
    }
}

impl LinkPort {
    /// Wait for the next command. `None` once the control loop has gone away.
    pub async fn next_command(&mut self) -> Option<MotorCommand> {
        self.commands.changed().await.ok()?;
        Some(*self.commands.borrow_and_update())
    }

    pub fn report(&self, event: LinkEvent) {
        // Receiver gone means the loop is shutting down; nothing to tell
        let _ = self.events.send(event);
    }

    /// True once the control loop dropped its handle
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves once the control loop dropped its handle
    pub async fn closed(&self) {
        self.events.closed().await
    }
}
