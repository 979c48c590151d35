use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::config::LampConfig;
use crate::{HeadbangError, Result};

/// Wire command that puts the lamp into its beat-on mode.
pub const CMD_RAINBOW: &str = "rainbow";
/// Wire command that turns the lamp off.
pub const CMD_OFF: &str = "none";

/// How long `stop` waits for the send loop before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace period for the best-effort "off" written during `stop`.
const STOP_FLUSH: Duration = Duration::from_millis(100);

/// Transport seam between the command channel and the actual peripheral.
///
/// The channel owns the transport for the lifetime of its thread; with the
/// `ble-lamp` feature [`BleLampTransport`] provides the real GATT link.
pub trait LampTransport: Send {
    /// Discovers and connects to the peripheral. `Ok(false)` means it was not
    /// found within the configured timeout, the degraded but non-fatal outcome.
    fn connect(&mut self, config: &LampConfig) -> Result<bool>;

    /// Writes one UTF-8 command string. [`HeadbangError::LampDisconnected`]
    /// ends the send loop; any other error is logged and the loop continues.
    fn write(&mut self, command: &str) -> Result<()>;

    /// Tears the connection down. Called from the channel thread on exit.
    fn disconnect(&mut self);
}

/// One-slot mailbox: a new command replaces any unsent predecessor, so the
/// peripheral always receives the freshest state and never a backlog.
#[derive(Default)]
struct Mailbox {
    slot: Mutex<Option<String>>,
    available: Condvar,
}

impl Mailbox {
    fn post(&self, command: String) {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(command);
        self.available.notify_one();
    }

    /// Takes the pending command, waiting up to `timeout` for one to arrive.
    fn take(&self, timeout: Duration) -> Option<String> {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            let (guard, _) = self
                .available
                .wait_timeout(slot, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot = guard;
        }
        slot.take()
    }
}

/// Command relay to the light peripheral.
///
/// `send` is non-blocking regardless of the connection state; peripheral I/O
/// happens on the channel's own thread, so the motion loop can fire a command
/// every half-beat without ever waiting on the radio.
pub struct LampChannel {
    config: LampConfig,
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    drop_logged: AtomicBool,
    worker: Option<Worker>,
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl LampChannel {
    pub fn new(config: LampConfig) -> Self {
        Self {
            config,
            mailbox: Arc::new(Mailbox::default()),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(AtomicBool::new(false)),
            drop_logged: AtomicBool::new(false),
            worker: None,
        }
    }

    /// Spawns the connect-and-send thread. No-op when already running. A
    /// peripheral that cannot be found leaves the channel in degraded mode;
    /// the rest of the system carries on without light sync.
    pub fn start(&mut self, transport: Box<dyn LampTransport>) {
        if self.running.load(Ordering::SeqCst) {
            debug!("lamp channel already running");
            return;
        }
        self.degraded.store(false, Ordering::SeqCst);
        self.drop_logged.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (done_tx, done) = bounded::<()>(1);
        let config = self.config.clone();
        let mailbox = self.mailbox.clone();
        let running = self.running.clone();
        let connected = self.connected.clone();
        let degraded = self.degraded.clone();
        let handle = thread::spawn(move || {
            let _done = done_tx;
            send_loop(transport, config, mailbox, running, connected, degraded);
        });
        self.worker = Some(Worker { handle, done });
    }

    /// Queues `command`, replacing any not-yet-sent predecessor. After a lost
    /// or never-established connection this is a cheap no-op, logged once.
    pub fn send(&self, command: &str) {
        if self.degraded.load(Ordering::SeqCst) {
            if !self.drop_logged.swap(true, Ordering::SeqCst) {
                warn!("lamp unavailable, dropping commands from now on");
            }
            return;
        }
        self.mailbox.post(command.to_string());
    }

    pub fn rainbow(&self) {
        self.send(CMD_RAINBOW);
    }

    pub fn off(&self) {
        self.send(CMD_OFF);
    }

    /// Solid color, wire form `c,R,G,B`.
    pub fn color(&self, r: u8, g: u8, b: u8) {
        self.send(&format!("c,{r},{g},{b}"));
    }

    /// Best-effort "off", then shuts the send loop down and joins it within
    /// a bounded timeout. Safe to call at any time, including before `start`.
    pub fn stop(&mut self) {
        if self.running.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst) {
            self.mailbox.post(CMD_OFF.to_string());
            thread::sleep(STOP_FLUSH);
        }
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.done.recv_timeout(JOIN_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("lamp channel did not stop in time, detaching its thread");
            }
            _ => {
                if worker.handle.join().is_err() {
                    warn!("lamp channel thread panicked");
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn pending_command(&self) -> Option<String> {
        self.mailbox
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn send_loop(
    mut transport: Box<dyn LampTransport>,
    config: LampConfig,
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
) {
    match transport.connect(&config) {
        Ok(true) => {
            connected.store(true, Ordering::SeqCst);
            info!(device = %config.device_name, "lamp connected");
        }
        Ok(false) => {
            warn!(device = %config.device_name, "lamp not found, continuing without light sync");
            degraded.store(true, Ordering::SeqCst);
            running.store(false, Ordering::SeqCst);
            return;
        }
        Err(err) => {
            warn!(%err, "lamp connection failed, continuing without light sync");
            degraded.store(true, Ordering::SeqCst);
            running.store(false, Ordering::SeqCst);
            return;
        }
    }

    let poll = config.poll_timeout();
    while running.load(Ordering::SeqCst) {
        let Some(command) = mailbox.take(poll) else {
            continue;
        };
        match transport.write(&command) {
            Ok(()) => debug!(command = %command, "lamp command written"),
            Err(HeadbangError::LampDisconnected) => {
                warn!("lamp connection lost, light sync disabled");
                degraded.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => warn!(%err, "lamp write failed"),
        }
    }
    transport.disconnect();
    connected.store(false, Ordering::SeqCst);
    running.store(false, Ordering::SeqCst);
    debug!("lamp channel stopped");
}

#[cfg(feature = "ble-lamp")]
pub use self::ble::BleLampTransport;

#[cfg(feature = "ble-lamp")]
mod ble {
    use btleplug::api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    };
    use btleplug::platform::{Adapter, Manager, Peripheral};
    use futures::StreamExt;
    use tokio::runtime::{Builder, Runtime};
    use uuid::Uuid;

    use super::*;

    /// GATT transport to the lamp, discovered by its advertised name.
    ///
    /// All bluetooth I/O runs on a private current-thread tokio runtime that
    /// lives and dies with the channel thread, so no other component ever
    /// shares its event loop.
    pub struct BleLampTransport {
        runtime: Runtime,
        link: Option<Link>,
    }

    struct Link {
        peripheral: Peripheral,
        characteristic: Characteristic,
    }

    impl BleLampTransport {
        pub fn new() -> Result<Self> {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            Ok(Self {
                runtime,
                link: None,
            })
        }
    }

    impl LampTransport for BleLampTransport {
        fn connect(&mut self, config: &LampConfig) -> Result<bool> {
            let characteristic_uuid =
                Uuid::parse_str(&config.characteristic_uuid).map_err(|err| {
                    HeadbangError::msg(format!("invalid characteristic uuid: {err}"))
                })?;
            let name = config.device_name.clone();
            let timeout = config.discovery_timeout();

            let link = self.runtime.block_on(async move {
                let manager = Manager::new().await.map_err(ble_err)?;
                let adapter = manager
                    .adapters()
                    .await
                    .map_err(ble_err)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| HeadbangError::msg("no bluetooth adapter available"))?;

                adapter
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(ble_err)?;
                let found = tokio::time::timeout(timeout, find_by_name(&adapter, &name)).await;
                let _ = adapter.stop_scan().await;
                let peripheral = match found {
                    Ok(result) => match result? {
                        Some(peripheral) => peripheral,
                        None => return Ok(None),
                    },
                    Err(_elapsed) => return Ok(None),
                };

                peripheral.connect().await.map_err(ble_err)?;
                peripheral.discover_services().await.map_err(ble_err)?;
                let characteristic = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == characteristic_uuid)
                    .ok_or_else(|| {
                        HeadbangError::msg("lamp does not expose the command characteristic")
                    })?;
                Ok(Some(Link {
                    peripheral,
                    characteristic,
                }))
            })?;

            match link {
                Some(link) => {
                    self.link = Some(link);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        fn write(&mut self, command: &str) -> Result<()> {
            let link = self.link.as_ref().ok_or(HeadbangError::LampDisconnected)?;
            self.runtime
                .block_on(link.peripheral.write(
                    &link.characteristic,
                    command.as_bytes(),
                    WriteType::WithoutResponse,
                ))
                .map_err(|err| match err {
                    btleplug::Error::NotConnected => HeadbangError::LampDisconnected,
                    other => HeadbangError::msg(other.to_string()),
                })
        }

        fn disconnect(&mut self) {
            if let Some(link) = self.link.take() {
                let _ = self.runtime.block_on(link.peripheral.disconnect());
            }
        }
    }

    /// Watches scan events until a peripheral advertising `name` shows up.
    /// The caller bounds this with the discovery timeout.
    async fn find_by_name(adapter: &Adapter, name: &str) -> Result<Option<Peripheral>> {
        let mut events = adapter.events().await.map_err(ble_err)?;
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = adapter.peripheral(&id).await.map_err(ble_err)?;
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties.local_name.as_deref() == Some(name) {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    fn ble_err(err: btleplug::Error) -> HeadbangError {
        HeadbangError::msg(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct MockTransport {
        writes: Arc<Mutex<Vec<String>>>,
        found: bool,
        /// Writes at or beyond this index report a lost connection.
        fail_from: Option<usize>,
    }

    impl MockTransport {
        fn new(found: bool) -> Self {
            Self {
                writes: Arc::new(Mutex::new(Vec::new())),
                found,
                fail_from: None,
            }
        }
    }

    impl LampTransport for MockTransport {
        fn connect(&mut self, _config: &LampConfig) -> Result<bool> {
            Ok(self.found)
        }

        fn write(&mut self, command: &str) -> Result<()> {
            let mut writes = self.writes.lock().unwrap();
            if let Some(limit) = self.fail_from {
                if writes.len() >= limit {
                    return Err(HeadbangError::LampDisconnected);
                }
            }
            writes.push(command.to_string());
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    fn settle() {
        thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn a_newer_command_overwrites_the_pending_one() {
        let channel = LampChannel::new(LampConfig::default());
        channel.send("a");
        channel.send("b");

        assert_eq!(channel.mailbox.take(Duration::ZERO), Some("b".to_string()));
        assert_eq!(channel.mailbox.take(Duration::ZERO), None);
    }

    #[test]
    fn drains_to_a_single_write_and_turns_off_on_stop() {
        let transport = MockTransport::new(true);
        let writes = transport.writes.clone();

        let mut channel = LampChannel::new(LampConfig::default());
        channel.send("a");
        channel.send("b");
        channel.start(Box::new(transport));
        settle();
        channel.stop();

        assert_eq!(*writes.lock().unwrap(), vec!["b", CMD_OFF]);
    }

    #[test]
    fn missing_lamp_degrades_without_failing() {
        let transport = MockTransport::new(false);
        let writes = transport.writes.clone();

        let mut channel = LampChannel::new(LampConfig::default());
        channel.start(Box::new(transport));
        settle();

        assert!(!channel.is_connected());
        channel.rainbow();
        channel.stop();
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn a_lost_connection_turns_sends_into_no_ops() {
        let mut transport = MockTransport::new(true);
        transport.fail_from = Some(1);
        let writes = transport.writes.clone();

        let mut channel = LampChannel::new(LampConfig::default());
        channel.start(Box::new(transport));
        settle();

        channel.send("first");
        settle();
        channel.send("second");
        settle();
        channel.send("third");
        settle();

        assert_eq!(*writes.lock().unwrap(), vec!["first"]);
        assert!(!channel.is_connected());
        channel.stop();
        assert_eq!(writes.lock().unwrap().len(), 1);
    }
}
