// BLE session with a toio Core Cube
//
// Discovery, connection setup, then a session task that writes motor commands
// as they arrive and forwards notifications. After a mid-session drop the task
// keeps reconnecting to the same cube until the control loop goes away.

use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::toio::{
    self, CONFIG_CHAR_UUID, MOTOR_CHAR_UUID, SENSOR_CHAR_UUID, SERVICE_UUID,
};
use super::{LinkError, LinkEvent, LinkPort};
use crate::config::RobotConfig;
use crate::messages::MotorCommand;

/// How often the peripheral list is polled while scanning
const SCAN_POLL: Duration = Duration::from_millis(200);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type AdapterEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Why a session ended
enum SessionEnd {
    /// Control loop dropped its handle
    Shutdown,
    Lost(String),
}

/// Decide whether an advertisement belongs to the cube we want.
///
/// A configured address must match exactly (case-insensitive). Without one,
/// the advertised name prefix or the toio service UUID is enough.
pub fn is_target(
    config: &RobotConfig,
    address: &str,
    local_name: Option<&str>,
    services: &[Uuid],
) -> bool {
    if let Some(wanted) = &config.address {
        return wanted.eq_ignore_ascii_case(address);
    }
    let name_match = !config.name_prefix.is_empty()
        && local_name.is_some_and(|name| name.trim().starts_with(&config.name_prefix));
    name_match || services.contains(&SERVICE_UUID)
}

/// Scan for the cube, retrying up to `scan_retry` times
pub async fn discover(adapter: &Adapter, config: &RobotConfig) -> Result<Peripheral, LinkError> {
    let attempts = config.scan_retry.max(1);
    for attempt in 1..=attempts {
        info!("Scanning for toio cube (attempt {}/{})", attempt, attempts);
        adapter.start_scan(ScanFilter::default()).await?;
        let found = scan_until(adapter, config, Instant::now() + config.scan_timeout()).await;
        if let Err(e) = adapter.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
        if let Some(cube) = found? {
            info!("Found cube {}", cube.address());
            return Ok(cube);
        }
    }
    Err(LinkError::NotFound { attempts })
}

async fn scan_until(
    adapter: &Adapter,
    config: &RobotConfig,
    deadline: Instant,
) -> Result<Option<Peripheral>, LinkError> {
    while Instant::now() < deadline {
        sleep(SCAN_POLL).await;
        for peripheral in adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let address = peripheral.address().to_string();
            if is_target(config, &address, props.local_name.as_deref(), &props.services) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

/// Connected cube plus the characteristics the runtime uses
pub struct ToioDriver {
    adapter: Adapter,
    cube: Peripheral,
    address: String,
    motor: Characteristic,
    sensor: Characteristic,
    settings: Characteristic,
    config: RobotConfig,
    /// Hold time sent with every motor command
    hold: Duration,
}

impl ToioDriver {
    /// Find the cube and open a session. Discovery failure is final.
    pub async fn connect(config: &RobotConfig, hold: Duration) -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::NoAdapter)?;

        let cube = discover(&adapter, config).await?;
        let address = cube.address().to_string();

        info!("Connecting to cube {}...", address);
        cube.connect().await?;
        if !cube.is_connected().await? {
            return Err(LinkError::NotConnected(address));
        }
        cube.discover_services().await?;

        let find = |uuid: Uuid| {
            cube.characteristics()
                .into_iter()
                .find(|c| c.uuid == uuid)
                .ok_or(LinkError::MissingCharacteristic(uuid))
        };
        let motor = find(MOTOR_CHAR_UUID)?;
        let sensor = find(SENSOR_CHAR_UUID)?;
        let settings = find(CONFIG_CHAR_UUID)?;

        let driver = Self {
            adapter,
            cube,
            address,
            motor,
            sensor,
            settings,
            config: config.clone(),
            hold,
        };
        driver.configure().await?;
        info!("Connected to cube {}", driver.address);
        Ok(driver)
    }

    /// Collision threshold, optional speed feedback, notification subscriptions
    async fn configure(&self) -> Result<(), LinkError> {
        let threshold = toio::collision_threshold_payload(self.config.collision_threshold);
        match self
            .cube
            .write(&self.settings, &threshold, WriteType::WithResponse)
            .await
        {
            Ok(()) => info!("Collision threshold set to {}", threshold[2]),
            // Cube still drives with its default threshold
            Err(e) => warn!("Failed to set collision threshold: {}", e),
        }

        if self.config.motor_speed_feedback {
            let enable = toio::motor_speed_feedback_payload(true);
            self.cube
                .write(&self.settings, &enable, WriteType::WithResponse)
                .await?;
            self.cube.subscribe(&self.motor).await?;
        }

        self.cube.subscribe(&self.sensor).await?;
        debug!("Sensor notifications enabled");
        Ok(())
    }

    /// Send one command. No acknowledgement, the next tick supersedes it.
    pub async fn write_command(&self, cmd: MotorCommand) -> Result<(), LinkError> {
        let payload = toio::motor_payload(cmd, self.hold);
        self.cube
            .write(&self.motor, &payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LinkError> {
        self.write_command(MotorCommand::STOP).await
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        self.cube.connect().await?;
        self.cube.discover_services().await?;
        self.configure().await
    }

    async fn close(&self) {
        if let Err(e) = self.stop().await {
            warn!("Failed to stop cube on shutdown: {}", e);
        }
        info!("Disconnecting cube {}", self.address);
        if let Err(e) = self.cube.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }

    /// Find the cube and run the session in its own task until the control
    /// loop drops its handle. The task only returns an error if the cube was
    /// never reached.
    pub fn spawn(config: RobotConfig, hold: Duration, port: LinkPort) -> JoinHandle<Result<(), LinkError>> {
        tokio::spawn(Self::launch(config, hold, port))
    }

    async fn launch(config: RobotConfig, hold: Duration, port: LinkPort) -> Result<(), LinkError> {
        port.report(LinkEvent::Connecting);
        let driver = tokio::select! {
            driver = Self::connect(&config, hold) => driver?,
            _ = port.closed() => {
                debug!("Control loop gone before the cube was found");
                return Ok(());
            }
        };
        driver.run(port).await;
        Ok(())
    }

    async fn run(self, mut port: LinkPort) {
        port.report(LinkEvent::Connected {
            address: self.address.clone(),
        });

        loop {
            match self.session(&mut port).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    warn!("Cube link lost: {}", reason);
                    port.report(LinkEvent::Disconnected { reason });
                }
            }

            if !self.reconnect_until_up(&port).await {
                break;
            }
            port.report(LinkEvent::Connected {
                address: self.address.clone(),
            });
        }

        self.close().await;
    }

    /// Returns false if the loop went away while we were retrying
    async fn reconnect_until_up(&self, port: &LinkPort) -> bool {
        loop {
            sleep(self.config.reconnect_delay()).await;
            if port.is_closed() {
                return false;
            }
            port.report(LinkEvent::Connecting);
            match self.reconnect().await {
                Ok(()) => {
                    info!("Reconnected to cube {}", self.address);
                    return true;
                }
                Err(e) => debug!("Reconnect to {} failed: {}", self.address, e),
            }
        }
    }

    async fn session(&self, port: &mut LinkPort) -> SessionEnd {
        let mut notifications: Notifications = match self.cube.notifications().await {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Lost(format!("notification stream: {}", e)),
        };
        let mut adapter_events: AdapterEvents = match self.adapter.events().await {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Lost(format!("adapter events: {}", e)),
        };
        let cube_id = self.cube.id();

        loop {
            tokio::select! {
                cmd = port.next_command() => {
                    let Some(cmd) = cmd else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = self.write_command(cmd).await {
                        if !self.cube.is_connected().await.unwrap_or(false) {
                            return SessionEnd::Lost(format!("write failed: {}", e));
                        }
                        debug!("Motor write failed: {}", e);
                    }
                }
                notification = notifications.next() => {
                    let Some(notification) = notification else {
                        return SessionEnd::Lost("notification stream closed".to_string());
                    };
                    if let Some(event) = toio::decode_notification(notification.uuid, &notification.value) {
                        debug!("Sensor event: {:?}", event);
                        port.report(LinkEvent::Sensor(event));
                    }
                }
                event = adapter_events.next() => {
                    match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == cube_id => {
                            return SessionEnd::Lost("cube disconnected".to_string());
                        }
                        Some(_) => {}
                        None => return SessionEnd::Lost("adapter event stream closed".to_string()),
                    }
                }
            }
        }
    }
}
