// Fixed-rate control loop
//
// Every tick, in order:
//   1. link events      (connection changes, collision notifications)
//   2. operator requests (estop, resume, recording)
//   3. controller presence + stick watchdog
//   4. shape -> mix -> authorize
//   5. dispatch exactly one motor command
//   6. record one frame with the command actually dispatched
//   7. status telemetry
//
// `Runtime::tick` is synchronous and takes its clock as an argument, so the
// whole pipeline can be driven without hardware or a network.

use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::bridge::{self, ControllerSnapshot, OperatorRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keyboard;
use crate::link::{self, LinkEvent, SensorEvent, ToioDriver};
use crate::messages::{MotorCommand, NoticeLevel, OutboundMessage, RecordingCommand, StatusReport};
use crate::motor::{InputShaper, MixingParams, ShapedCommand, mix_command};
use crate::recorder::{EpisodeOutcome, EpisodeRecorder, ObservationBuilder, RecordingError};
use crate::safety::SafetyMonitor;

/// How long one collision notification keeps the collision flag up
pub const COLLISION_LATCH: Duration = Duration::from_millis(100);

/// Everything gathered from the outside world for one tick
#[derive(Debug, Default)]
pub struct TickInputs {
    pub controller: ControllerSnapshot,
    pub link_events: Vec<LinkEvent>,
    pub requests: Vec<OperatorRequest>,
}

#[derive(Debug)]
pub struct TickOutput {
    /// The one command to dispatch this tick
    pub command: MotorCommand,
    pub messages: Vec<OutboundMessage>,
    pub quit: bool,
}

/// Status fields whose change triggers an immediate report
#[derive(Debug, Clone, PartialEq)]
struct StatusKey {
    link: &'static str,
    estop_reason: Option<String>,
    recording: bool,
    episode_index: Option<u64>,
    collision: bool,
}

pub struct Runtime {
    shaper: InputShaper,
    mixing: MixingParams,
    safety: SafetyMonitor,
    recorder: Option<EpisodeRecorder>,
    observations: ObservationBuilder,
    period: Duration,
    estop_on_controller_disconnect: bool,
    status_every: u64,

    last_tick: Option<Instant>,
    controller_connected: bool,
    collision_until: Option<Instant>,
    motor_speed: Option<[u8; 2]>,
    last_status: Option<StatusKey>,
    ticks: u64,
}

impl Runtime {
    pub fn new(config: &Config, recorder: Option<EpisodeRecorder>) -> Self {
        Self {
            shaper: InputShaper::new((&config.control).into()),
            mixing: (&config.control).into(),
            safety: SafetyMonitor::new(&config.safety),
            recorder,
            observations: ObservationBuilder::new(config.recording.seed),
            period: config.control.period(),
            estop_on_controller_disconnect: config.safety.estop_on_controller_disconnect,
            status_every: u64::from(config.server.status_every_ticks.max(1)),
            last_tick: None,
            controller_connected: false,
            collision_until: None,
            motor_speed: None,
            last_status: None,
            ticks: 0,
        }
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    pub fn recorder(&self) -> Option<&EpisodeRecorder> {
        self.recorder.as_ref()
    }

    pub fn tick(&mut self, now: Instant, inputs: TickInputs) -> TickOutput {
        let mut messages = Vec::new();
        let mut quit = false;

        let dt = match self.last_tick {
            Some(last) => now.saturating_duration_since(last),
            None => self.period,
        };
        self.last_tick = Some(now);

        for event in &inputs.link_events {
            self.on_link_event(event, now);
        }

        for request in inputs.requests {
            match request {
                OperatorRequest::Estop(reason) => self.safety.estop(reason, now),
                OperatorRequest::Resume => {
                    if !self.safety.resume(now) {
                        messages.push(OutboundMessage::notice(NoticeLevel::Info, "not estopped"));
                    }
                }
                OperatorRequest::Recording(command) => self.on_recording(command, &mut messages),
                OperatorRequest::ToggleRecording => {
                    let command = if self.is_recording() {
                        RecordingCommand::EndEpisode
                    } else {
                        RecordingCommand::StartEpisode
                    };
                    self.on_recording(command, &mut messages);
                }
                OperatorRequest::Quit => quit = true,
            }
        }

        let controller = inputs.controller;
        if controller.connected != self.controller_connected {
            self.controller_connected = controller.connected;
            if controller.connected {
                info!("Controller present");
            } else {
                warn!("No controller connected");
            }
        }
        // Absence is a standing condition: re-checked every tick so a robot
        // that comes back while nobody is driving is stopped right away
        let controller_present = controller.connected || !self.estop_on_controller_disconnect;
        if !controller_present {
            self.safety.controller_lost(now);
        }
        let last_sample_at = controller.received_at.filter(|_| controller_present);
        self.safety.check_command_age(last_sample_at, now);

        let raw = controller.sample.unwrap_or_default();
        let shaped = if self.safety.has_authority() {
            self.shaper.shape(&raw, dt.as_secs_f32())
        } else {
            // Ramp up from rest after any stop
            self.shaper.reset();
            ShapedCommand::ZERO
        };
        let command = self.safety.authorize(mix_command(shaped, &self.mixing));

        let collision = self.collision_until.is_some_and(|until| now < until);
        let observation = self.observations.observe(collision, raw.x);
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(observation, command, now);
        }

        self.ticks += 1;
        if let Some(status) = self.status(command, collision, controller.latency_ms) {
            messages.push(OutboundMessage::Status(status));
        }

        TickOutput {
            command,
            messages,
            quit,
        }
    }

    fn on_link_event(&mut self, event: &LinkEvent, now: Instant) {
        self.safety.on_link_event(event, now);
        match event {
            LinkEvent::Sensor(SensorEvent::Collision) => {
                debug!("Collision detected");
                self.collision_until = Some(now + COLLISION_LATCH);
            }
            LinkEvent::Sensor(SensorEvent::MotorSpeed { left, right }) => {
                self.motor_speed = Some([*left, *right]);
            }
            LinkEvent::Disconnected { reason } => {
                info!("Robot link down: {}", reason);
                self.motor_speed = None;
            }
            LinkEvent::Connecting | LinkEvent::Connected { .. } => {}
        }
    }

    fn is_recording(&self) -> bool {
        self.recorder.as_ref().is_some_and(EpisodeRecorder::is_recording)
    }

    fn on_recording(&mut self, command: RecordingCommand, messages: &mut Vec<OutboundMessage>) {
        let Some(recorder) = self.recorder.as_mut() else {
            messages.push(OutboundMessage::notice(NoticeLevel::Warning, "recording is disabled"));
            return;
        };

        let notice = match command {
            RecordingCommand::StartEpisode => match recorder.start_episode() {
                Ok(index) => {
                    self.observations.reset();
                    OutboundMessage::notice(NoticeLevel::Info, format!("recording episode {}", index))
                }
                Err(e) => {
                    warn!("{}", e);
                    OutboundMessage::notice(NoticeLevel::Warning, e.to_string())
                }
            },
            RecordingCommand::EndEpisode => match recorder.end_episode() {
                Ok(EpisodeOutcome::Saved {
                    episode_index,
                    frames,
                    ..
                }) => OutboundMessage::notice(
                    NoticeLevel::Info,
                    format!("episode {} saved ({} frames)", episode_index, frames),
                ),
                Ok(EpisodeOutcome::Discarded { episode_index }) => OutboundMessage::notice(
                    NoticeLevel::Info,
                    format!("episode {} was empty, discarded", episode_index),
                ),
                Err(e @ RecordingError::Persist(_)) => {
                    error!("{} (episode kept in memory, will retry)", e);
                    OutboundMessage::notice(NoticeLevel::Error, e.to_string())
                }
                Err(e) => {
                    warn!("{}", e);
                    OutboundMessage::notice(NoticeLevel::Warning, e.to_string())
                }
            },
        };
        messages.push(notice);
    }

    /// Report on every state change and every `status_every` ticks
    fn status(
        &mut self,
        command: MotorCommand,
        collision: bool,
        latency_ms: Option<f64>,
    ) -> Option<StatusReport> {
        let state = self.safety.state();
        let key = StatusKey {
            link: state.name(),
            estop_reason: state.estop_reason().map(|r| r.describe()),
            recording: self.is_recording(),
            episode_index: self.recorder.as_ref().and_then(EpisodeRecorder::episode_index),
            collision,
        };

        let changed = self.last_status.as_ref() != Some(&key);
        if !changed && self.ticks % self.status_every != 0 {
            return None;
        }
        self.last_status = Some(key.clone());

        Some(StatusReport {
            link: key.link,
            estop_reason: key.estop_reason,
            recording: key.recording,
            episode_index: key.episode_index,
            left: command.left,
            right: command.right,
            collision,
            motor_speed: self.motor_speed,
            latency_ms,
        })
    }

    /// Seal and flush recordings. Call once, after the last tick.
    pub fn shutdown(&mut self) -> std::result::Result<(), RecordingError> {
        match self.recorder.as_mut() {
            Some(recorder) => recorder.shutdown(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Drive from the local terminal as well as the WebSocket
    pub keyboard: bool,
}

pub async fn run(config: Config, options: RunOptions) -> Result<()> {
    let recorder = if config.recording.enabled {
        let recorder = EpisodeRecorder::open(&config.recording, config.control.rate_hz)?;
        info!(
            "Recording to {} (next episode {})",
            recorder.dataset().root().display(),
            recorder.dataset().next_episode_index()
        );
        Some(recorder)
    } else {
        info!("Recording disabled");
        None
    };

    let (mut bridge, port) = bridge::channel();
    let listener = TcpListener::bind(config.server.bind)
        .await
        .map_err(|source| Error::Bind {
            addr: config.server.bind,
            source,
        })?;
    let app = bridge::router(
        port.clone(),
        config.server.ping_interval(),
        config.server.static_dir.as_deref(),
    );
    info!("Controller socket at ws://{}/ws", config.server.bind);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server stopped: {}", e);
        }
    });

    let keyboard = if options.keyboard {
        Some(keyboard::spawn(port.clone())?)
    } else {
        None
    };

    // Discovery runs in the driver task; the loop ticks (and stops) meanwhile
    let (mut link, link_port) = link::channel();
    let mut driver_task = ToioDriver::spawn(config.robot.clone(), config.control.motor_duration(), link_port);
    let mut driver_running = true;
    let mut link_failure = None;

    let mut runtime = Runtime::new(&config, recorder);
    let mut tick = interval(config.control.period());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Control loop started: {}Hz, {:?} stick timeout",
        config.control.rate_hz,
        config.safety.timeout()
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            joined = &mut driver_task, if driver_running => {
                driver_running = false;
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Robot link failed: {}", e);
                        link_failure = Some(e);
                        break;
                    }
                    Err(e) => warn!("Link driver task failed: {}", e),
                }
                // Closed link shows up as Disconnected on the next tick
                continue;
            }
        }

        let inputs = TickInputs {
            controller: bridge.snapshot(),
            link_events: link.drain_events(),
            requests: bridge.drain_requests(),
        };
        let output = runtime.tick(Instant::now(), inputs);
        link.send(output.command);
        for message in output.messages {
            bridge.publish(message);
        }
        if output.quit {
            info!("Quit requested, shutting down");
            break;
        }
    }

    link.send(MotorCommand::STOP);
    let saved = runtime.shutdown();

    // Dropping the handle lets the driver stop the cube and disconnect
    drop(link);
    if driver_running {
        match driver_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Robot link failed during shutdown: {}", e),
            Err(e) => warn!("Link driver task failed: {}", e),
        }
    }
    if let Some(keyboard) = keyboard {
        keyboard.shutdown().await;
    }
    server.abort();

    saved?;
    match link_failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
