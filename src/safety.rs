// Safety monitor: the only component allowed to take motion authority away
//
// Disconnected -> Connecting -> Connected -> {Estopped | Disconnected}
// Estopped -> Connected only via operator resume, or a fresh stick sample
// when the stop was automatic (command timeout, controller lost).

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::SafetyConfig;
use crate::link::LinkEvent;
use crate::messages::MotorCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstopReason {
    /// Explicit stop from the controller
    Operator(String),
    /// No stick sample within the timeout while connected
    CommandTimeout,
    /// Controller socket closed with estop-on-disconnect enabled
    ControllerLost,
}

impl EstopReason {
    fn clears_on_fresh_sample(&self) -> bool {
        !matches!(self, EstopReason::Operator(_))
    }

    pub fn describe(&self) -> String {
        match self {
            EstopReason::Operator(reason) if reason.is_empty() => "operator".to_string(),
            EstopReason::Operator(reason) => format!("operator: {}", reason),
            EstopReason::CommandTimeout => "command timeout".to_string(),
            EstopReason::ControllerLost => "controller disconnected".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Estopped(EstopReason),
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Estopped(_) => "estopped",
        }
    }

    pub fn estop_reason(&self) -> Option<&EstopReason> {
        match self {
            LinkState::Estopped(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct SafetyMonitor {
    state: LinkState,
    /// Robot link liveness, tracked separately so a drop during an estop is not forgotten
    robot_up: bool,
    timeout: Duration,
    connected_at: Option<Instant>,
    estopped_at: Option<Instant>,
}

impl SafetyMonitor {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            state: LinkState::Disconnected,
            robot_up: false,
            timeout: config.timeout(),
            connected_at: None,
            estopped_at: None,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn has_authority(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Pass the mixer output through only while connected and not stopped
    pub fn authorize(&self, cmd: MotorCommand) -> MotorCommand {
        if self.has_authority() {
            cmd
        } else {
            MotorCommand::STOP
        }
    }

    pub fn on_link_event(&mut self, event: &LinkEvent, now: Instant) {
        match event {
            LinkEvent::Connecting => self.link_connecting(),
            LinkEvent::Connected { .. } => self.link_connected(now),
            LinkEvent::Disconnected { .. } => self.link_lost(),
            LinkEvent::Sensor(_) => {}
        }
    }

    pub fn link_connecting(&mut self) {
        self.robot_up = false;
        if self.state == LinkState::Disconnected {
            self.transition(LinkState::Connecting);
        }
    }

    pub fn link_connected(&mut self, now: Instant) {
        self.robot_up = true;
        self.connected_at = Some(now);
        if matches!(self.state, LinkState::Disconnected | LinkState::Connecting) {
            self.transition(LinkState::Connected);
        }
    }

    pub fn link_lost(&mut self) {
        self.robot_up = false;
        if !matches!(self.state, LinkState::Estopped(_)) {
            self.transition(LinkState::Disconnected);
        }
    }

    /// Operator stop, effective from any state
    pub fn estop(&mut self, reason: impl Into<String>, now: Instant) {
        self.estopped_at = Some(now);
        self.transition(LinkState::Estopped(EstopReason::Operator(reason.into())));
    }

    /// Clear any estop. Returns false if there was nothing to clear.
    pub fn resume(&mut self, now: Instant) -> bool {
        if !matches!(self.state, LinkState::Estopped(_)) {
            return false;
        }
        self.release(now);
        true
    }

    /// Controller went away with estop-on-disconnect enabled
    pub fn controller_lost(&mut self, now: Instant) {
        if self.state == LinkState::Connected {
            self.estopped_at = Some(now);
            self.transition(LinkState::Estopped(EstopReason::ControllerLost));
        }
    }

    /// Watchdog on stick samples, run once per tick.
    ///
    /// Stops when the newest sample (or the moment the link came up, if later)
    /// is older than the timeout. An automatic stop clears once a sample
    /// newer than the stop arrives.
    pub fn check_command_age(&mut self, last_sample_at: Option<Instant>, now: Instant) {
        let auto_stopped = self
            .state
            .estop_reason()
            .is_some_and(EstopReason::clears_on_fresh_sample);

        if self.state == LinkState::Connected {
            let reference = match (last_sample_at, self.connected_at) {
                (Some(sample), Some(connected)) => sample.max(connected),
                (Some(sample), None) => sample,
                (None, Some(connected)) => connected,
                (None, None) => now,
            };
            let age = now.saturating_duration_since(reference);
            if age > self.timeout {
                warn!("No stick input for {:?}, stopping robot", age);
                self.estopped_at = Some(now);
                self.transition(LinkState::Estopped(EstopReason::CommandTimeout));
            }
        } else if auto_stopped {
            let fresh = match (last_sample_at, self.estopped_at) {
                (Some(sample), Some(stopped)) => sample > stopped,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if fresh {
                self.release(now);
            }
        }
    }

    fn release(&mut self, now: Instant) {
        self.estopped_at = None;
        if self.robot_up {
            // Restart the watchdog window so a resume is not immediately re-stopped
            self.connected_at = Some(now);
            self.transition(LinkState::Connected);
        } else {
            self.transition(LinkState::Disconnected);
        }
    }

    fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        match &next {
            LinkState::Estopped(reason) => warn!("ESTOP ({})", reason.describe()),
            LinkState::Disconnected => warn!("Link state: {} -> disconnected", self.state.name()),
            other => info!("Link state: {} -> {}", self.state.name(), other.name()),
        }
        self.state = next;
    }
}
