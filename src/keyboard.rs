// Keyboard teleop from the local terminal: WASD drive, space estop,
// enter resume, R toggle recording, Q quit
//
// Feeds the same bridge inputs as the WebSocket, so the loop cannot tell the
// two apart. Terminals rarely report key releases, so the stick drops back to
// center when no drive key has been seen for a short while.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::{BridgePort, OperatorRequest};
use crate::messages::{StickSample, wall_clock};

/// Poll period, also the stick publish rate (50Hz)
const POLL: Duration = Duration::from_millis(20);
/// Center the stick after this long without a drive key
const INPUT_TIMEOUT: Duration = Duration::from_millis(100);

/// Stick state driven by key presses
#[derive(Debug)]
struct KeyboardStick {
    x: f32,
    y: f32,
    last_drive: Option<Instant>,
}

impl KeyboardStick {
    fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            last_drive: None,
        }
    }

    /// Apply one key. Non-drive keys map to operator requests.
    fn on_key(&mut self, key: KeyEvent, now: Instant) -> Option<OperatorRequest> {
        if !matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
            return None;
        }
        // Raw mode swallows the signal, so Ctrl-C arrives as a key
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Some(OperatorRequest::Quit);
        }

        match key.code {
            KeyCode::Char('w') => self.drive(self.x, 1.0, now),
            KeyCode::Char('s') => self.drive(self.x, -1.0, now),
            KeyCode::Char('a') => self.drive(-1.0, self.y, now),
            KeyCode::Char('d') => self.drive(1.0, self.y, now),
            KeyCode::Char(' ') => {
                self.center();
                return Some(OperatorRequest::Estop("keyboard".to_string()));
            }
            KeyCode::Enter => return Some(OperatorRequest::Resume),
            KeyCode::Char('r') => return Some(OperatorRequest::ToggleRecording),
            KeyCode::Char('q') | KeyCode::Esc => return Some(OperatorRequest::Quit),
            _ => {}
        }
        None
    }

    fn drive(&mut self, x: f32, y: f32, now: Instant) {
        self.x = x;
        self.y = y;
        self.last_drive = Some(now);
    }

    fn center(&mut self) {
        self.x = 0.0;
        self.y = 0.0;
        self.last_drive = None;
    }

    fn sample(&mut self, now: Instant) -> StickSample {
        let expired = self
            .last_drive
            .is_none_or(|at| now.saturating_duration_since(at) > INPUT_TIMEOUT);
        if expired {
            self.center();
        }
        StickSample {
            x: self.x,
            y: self.y,
            timestamp: wall_clock(),
        }
    }
}

pub struct KeyboardController {
    stop: Arc<AtomicBool>,
    task: JoinHandle<io::Result<()>>,
}

impl KeyboardController {
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Keyboard controller error: {}", e),
            Err(e) => warn!("Keyboard task failed: {}", e),
        }
    }
}

/// Put the terminal in raw mode and start reading keys on a blocking thread
pub fn spawn(port: BridgePort) -> io::Result<KeyboardController> {
    enable_raw_mode()?;
    info!("Keyboard: WASD=drive, SPACE=estop, ENTER=resume, R=record, Q=quit");

    let stop = Arc::new(AtomicBool::new(false));
    let task = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || {
            port.client_connected();
            let result = read_keys(&port, &stop);
            port.client_disconnected();
            let restored = disable_raw_mode();
            result.and(restored)
        }
    });
    Ok(KeyboardController { stop, task })
}

fn read_keys(port: &BridgePort, stop: &AtomicBool) -> io::Result<()> {
    let mut stick = KeyboardStick::new();
    while !stop.load(Ordering::Relaxed) {
        if event::poll(POLL)? {
            if let Event::Key(key) = event::read()? {
                if let Some(request) = stick.on_key(key, Instant::now()) {
                    let quit = request == OperatorRequest::Quit;
                    port.request(request);
                    if quit {
                        break;
                    }
                }
            }
        }
        // Published every poll so the stick watchdog stays fed while idle
        port.submit_stick(stick.sample(Instant::now()));
    }
    Ok(())
}
