//! Native driver boundary and the shared device handle.
//!
//! [`DriverInterface`] is the blocking surface of a potentiostat library.
//! Every call may block for as long as the instrument takes to answer, so
//! the executor never calls it on an async worker thread directly.
//!
//! [`Device`] is the handle shared by all channels of one instrument. It
//! serializes driver calls (one call in flight per device), tracks the
//! connection, and records which sessions hold it open so that the last one
//! to leave disconnects. A session is named by a [`SessionToken`]; taking it
//! twice counts once, and a released token cannot be taken again.

use crate::catalog::{self, ChannelMode, DeviceDescriptor, DeviceFamily, ElectrodeConnection};
use crate::error::{DriverError, EchemError, Result};
use crate::parameter::{ParamRecord, SequenceEntry, TechniqueSequence};
use crate::telemetry::PollFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of a driver call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Description of a connected instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device model code.
    pub device_code: i32,
    /// Family selecting row layouts and technique file variants.
    pub family: DeviceFamily,
    /// Channels with a board plugged in (zero based).
    pub channels: Vec<u8>,
    /// Firmware version reported by the instrument.
    pub firmware_version: i32,
}

impl DeviceInfo {
    /// Catalog entry for the device code.
    pub fn model(&self) -> Option<&'static DeviceDescriptor> {
        catalog::device(self.device_code)
    }

    /// Whether `channel` is available on the instrument.
    pub fn has_channel(&self, channel: u8) -> bool {
        self.channels.contains(&channel)
    }
}

/// An open connection returned by [`DriverInterface::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Library side connection identifier.
    pub id: i32,
    /// Instrument description.
    pub info: DeviceInfo,
}

/// Electrode wiring of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Grounded or floating operation.
    pub mode: ChannelMode,
    /// Electrode connection.
    pub connection: ElectrodeConnection,
}

/// Blocking interface of a native potentiostat driver.
pub trait DriverInterface: Send + Sync {
    /// Opens a connection to the instrument at `address`.
    fn connect(&self, address: &str, timeout: Duration) -> DriverResult<Connection>;

    /// Closes `conn`.
    fn disconnect(&self, conn: &Connection) -> DriverResult<()>;

    /// Loads one technique of a sequence onto `channel`.
    ///
    /// `is_first` clears previously loaded techniques; `is_last` closes the
    /// sequence.
    fn load(
        &self,
        conn: &Connection,
        channel: u8,
        technique_file: &str,
        params: &[ParamRecord],
        is_first: bool,
        is_last: bool,
    ) -> DriverResult<()>;

    /// Replaces parameters of the technique at `technique_index` while the
    /// channel runs.
    fn update(
        &self,
        conn: &Connection,
        channel: u8,
        technique_index: usize,
        technique_file: &str,
        params: &[ParamRecord],
    ) -> DriverResult<()>;

    /// Starts the loaded sequence.
    fn start(&self, conn: &Connection, channel: u8) -> DriverResult<()>;

    /// Stops the channel.
    fn stop(&self, conn: &Connection, channel: u8) -> DriverResult<()>;

    /// Reads the rows buffered since the previous poll.
    fn poll(&self, conn: &Connection, channel: u8) -> DriverResult<PollFrame>;

    /// Reads the electrode wiring of `channel`.
    fn hardware_config(&self, conn: &Connection, channel: u8) -> DriverResult<HardwareConfig>;

    /// Changes the electrode wiring of `channel`.
    fn set_hardware_config(&self, conn: &Connection, channel: u8, config: HardwareConfig) -> DriverResult<()>;
}

/// Identity of one session on a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Session {
    connection: Option<Connection>,
    holders: HashSet<SessionToken>,
    retired: HashSet<SessionToken>,
}

/// Shared handle to one instrument.
pub struct Device {
    address: String,
    driver: Arc<dyn DriverInterface>,
    calls: Mutex<()>,
    session: Mutex<Session>,
    next_token: AtomicU64,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.lock();
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("connected", &session.connection.is_some())
            .field("holders", &session.holders.len())
            .finish()
    }
}

impl Device {
    /// Handle for the instrument at `address`, not yet connected.
    pub fn new(address: impl Into<String>, driver: Arc<dyn DriverInterface>) -> Self {
        Self {
            address: address.into(),
            driver,
            calls: Mutex::new(()),
            session: Mutex::new(Session::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Instrument address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a connection is open.
    pub fn is_connected(&self) -> bool {
        self.session.lock().connection.is_some()
    }

    /// Description of the connected instrument.
    pub fn info(&self) -> Option<DeviceInfo> {
        self.session.lock().connection.as_ref().map(|c| c.info.clone())
    }

    /// Number of sessions currently holding the connection open.
    pub fn sessions(&self) -> usize {
        self.session.lock().holders.len()
    }

    /// New token for [`acquire`](Self::acquire) and [`release`](Self::release).
    pub fn session_token(&self) -> SessionToken {
        SessionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens the connection if it is not open yet. Does not take a session.
    pub fn connect(&self, timeout: Duration) -> Result<DeviceInfo> {
        let mut session = self.session.lock();
        self.ensure_connected(&mut session, timeout)
    }

    /// Closes the connection regardless of open sessions.
    pub fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock();
        let held = std::mem::take(&mut session.holders);
        session.retired.extend(held);
        self.close(&mut session)
    }

    /// Takes the session `token`, connecting first when needed.
    ///
    /// Taking a token already held is a no-op. A released token is refused,
    /// so an acquire that completes after its owner gave up cannot reopen the
    /// connection.
    pub fn acquire(&self, token: SessionToken, timeout: Duration) -> Result<DeviceInfo> {
        let mut session = self.session.lock();
        if session.retired.contains(&token) {
            return Err(EchemError::ChannelState {
                operation: "acquire",
                state: format!("session {token} released"),
            });
        }
        let info = self.ensure_connected(&mut session, timeout)?;
        if session.holders.insert(token) {
            debug!(device = %self.address, %token, holders = session.holders.len(), "Session acquired");
        }
        Ok(info)
    }

    /// Drops the session `token`; the last one disconnects. Returns whether
    /// the connection was closed.
    pub fn release(&self, token: SessionToken) -> Result<bool> {
        let mut session = self.session.lock();
        session.holders.remove(&token);
        session.retired.insert(token);
        debug!(device = %self.address, %token, holders = session.holders.len(), "Session released");
        if !session.holders.is_empty() || session.connection.is_none() {
            return Ok(false);
        }
        self.close(&mut session)?;
        Ok(true)
    }

    fn ensure_connected(&self, session: &mut Session, timeout: Duration) -> Result<DeviceInfo> {
        if let Some(conn) = &session.connection {
            return Ok(conn.info.clone());
        }
        let conn = {
            let _call = self.calls.lock();
            self.driver
                .connect(&self.address, timeout)
                .map_err(|e| EchemError::from_driver("connect", e))?
        };
        info!(
            device = %self.address,
            code = conn.info.device_code,
            family = %conn.info.family,
            channels = conn.info.channels.len(),
            "Connected"
        );
        let info = conn.info.clone();
        session.connection = Some(conn);
        Ok(info)
    }

    fn close(&self, session: &mut Session) -> Result<()> {
        let Some(conn) = session.connection.take() else {
            return Ok(());
        };
        let _call = self.calls.lock();
        self.driver
            .disconnect(&conn)
            .map_err(|e| EchemError::from_driver("disconnect", e))?;
        info!(device = %self.address, "Disconnected");
        Ok(())
    }

    /// Runs one serialized driver call against the open connection.
    fn with_connection<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn DriverInterface, &Connection) -> DriverResult<T>,
    ) -> Result<T> {
        let conn = self
            .session
            .lock()
            .connection
            .clone()
            .ok_or_else(|| EchemError::ChannelState {
                operation,
                state: "disconnected".to_string(),
            })?;
        let _call = self.calls.lock();
        f(self.driver.as_ref(), &conn).map_err(|e| EchemError::from_driver(operation, e))
    }

    /// Loads every technique of `sequence` onto `channel`, in order.
    pub fn load(&self, channel: u8, sequence: &TechniqueSequence) -> Result<()> {
        let family = self.family("load")?;
        for entry in sequence.entries() {
            let file = entry.definition().file_name(family);
            let bundle = entry.bundle();
            let records = bundle.records();
            self.with_connection("load", |driver, conn| {
                driver.load(conn, channel, &file, &records, bundle.is_first(), bundle.is_last())
            })?;
            debug!(device = %self.address, channel, file = %file, params = records.len(), "Technique loaded");
        }
        Ok(())
    }

    /// Pushes the parameters of `entry`, at `technique_index` in the loaded
    /// sequence, to a running channel.
    pub fn update(&self, channel: u8, technique_index: usize, entry: &SequenceEntry) -> Result<()> {
        let family = self.family("update")?;
        let file = entry.definition().file_name(family);
        let records = entry.bundle().records();
        self.with_connection("update", |driver, conn| {
            driver.update(conn, channel, technique_index, &file, &records)
        })
    }

    /// Starts `channel`.
    pub fn start(&self, channel: u8) -> Result<()> {
        self.with_connection("start", |driver, conn| driver.start(conn, channel))
    }

    /// Stops `channel`.
    pub fn stop(&self, channel: u8) -> Result<()> {
        self.with_connection("stop", |driver, conn| driver.stop(conn, channel))
    }

    /// Reads buffered rows of `channel`.
    pub fn poll(&self, channel: u8) -> Result<PollFrame> {
        self.with_connection("poll", |driver, conn| driver.poll(conn, channel))
    }

    /// Reads the electrode wiring of `channel`.
    pub fn hardware_config(&self, channel: u8) -> Result<HardwareConfig> {
        self.with_connection("hardware_config", |driver, conn| driver.hardware_config(conn, channel))
    }

    /// Changes the electrode wiring of `channel`.
    pub fn set_hardware_config(&self, channel: u8, config: HardwareConfig) -> Result<()> {
        self.with_connection("set_hardware_config", |driver, conn| {
            driver.set_hardware_config(conn, channel, config)
        })
    }

    fn family(&self, operation: &'static str) -> Result<DeviceFamily> {
        self.info().map(|i| i.family).ok_or_else(|| EchemError::ChannelState {
            operation,
            state: "disconnected".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use crate::parameter::ParameterSet;
    use crate::technique::{CA, OCV};

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        reject_load: bool,
    }

    impl RecordingDriver {
        fn log(&self, entry: String) {
            self.calls.lock().push(entry);
        }
    }

    impl DriverInterface for RecordingDriver {
        fn connect(&self, address: &str, _timeout: Duration) -> DriverResult<Connection> {
            self.log(format!("connect {address}"));
            Ok(Connection {
                id: 1,
                info: DeviceInfo {
                    device_code: 27,
                    family: DeviceFamily::Sp300,
                    channels: vec![0, 1],
                    firmware_version: 1,
                },
            })
        }

        fn disconnect(&self, _conn: &Connection) -> DriverResult<()> {
            self.log("disconnect".into());
            Ok(())
        }

        fn load(
            &self,
            _conn: &Connection,
            channel: u8,
            technique_file: &str,
            params: &[ParamRecord],
            is_first: bool,
            is_last: bool,
        ) -> DriverResult<()> {
            if self.reject_load {
                return Err(DriverError::from_code(-4));
            }
            self.log(format!(
                "load {channel} {technique_file} {} {is_first} {is_last}",
                params.len()
            ));
            Ok(())
        }

        fn update(
            &self,
            _conn: &Connection,
            channel: u8,
            technique_index: usize,
            technique_file: &str,
            _params: &[ParamRecord],
        ) -> DriverResult<()> {
            self.log(format!("update {channel} {technique_index} {technique_file}"));
            Ok(())
        }

        fn start(&self, _conn: &Connection, channel: u8) -> DriverResult<()> {
            self.log(format!("start {channel}"));
            Ok(())
        }

        fn stop(&self, _conn: &Connection, channel: u8) -> DriverResult<()> {
            self.log(format!("stop {channel}"));
            Ok(())
        }

        fn poll(&self, _conn: &Connection, _channel: u8) -> DriverResult<PollFrame> {
            Err(DriverError::new(DriverErrorKind::Communication, "no link"))
        }

        fn hardware_config(&self, _conn: &Connection, _channel: u8) -> DriverResult<HardwareConfig> {
            Ok(HardwareConfig::default())
        }

        fn set_hardware_config(&self, _conn: &Connection, _channel: u8, _config: HardwareConfig) -> DriverResult<()> {
            Ok(())
        }
    }

    fn sequence() -> TechniqueSequence {
        TechniqueSequence::build([
            (&OCV, ParameterSet::new().with("Rest_time_T", 1.0)),
            (
                &CA,
                ParameterSet::new()
                    .with_list("Voltage_step", [0.1, 0.2])
                    .with_list("vs_initial", [false, false])
                    .with_list("Duration_step", [1.0, 1.0])
                    .with("Step_number", 1),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_sessions_share_one_connection() {
        let driver = Arc::new(RecordingDriver::default());
        let device = Device::new("10.0.0.7", driver.clone());

        let (a, b) = (device.session_token(), device.session_token());
        device.acquire(a, Duration::from_secs(1)).unwrap();
        device.acquire(b, Duration::from_secs(1)).unwrap();
        assert_eq!(device.sessions(), 2);

        assert!(!device.release(a).unwrap());
        assert!(device.is_connected());
        assert!(device.release(b).unwrap());
        assert!(!device.is_connected());

        let calls = driver.calls.lock().clone();
        assert_eq!(calls, vec!["connect 10.0.0.7".to_string(), "disconnect".to_string()]);
    }

    #[test]
    fn test_repeated_acquire_holds_one_session() {
        let driver = Arc::new(RecordingDriver::default());
        let device = Device::new("usb0", driver.clone());
        let token = device.session_token();

        device.acquire(token, Duration::from_secs(1)).unwrap();
        device.acquire(token, Duration::from_secs(1)).unwrap();
        assert_eq!(device.sessions(), 1);
        assert!(device.release(token).unwrap());

        let err = device.acquire(token, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EchemError::ChannelState { operation: "acquire", .. }));
        assert!(!device.is_connected());
        assert_eq!(driver.calls.lock().len(), 2);
    }

    #[test]
    fn test_load_uses_family_file_names_and_flags() {
        let driver = Arc::new(RecordingDriver::default());
        let device = Device::new("usb0", driver.clone());
        device.connect(Duration::from_secs(1)).unwrap();
        device.load(2, &sequence()).unwrap();

        let calls = driver.calls.lock().clone();
        assert!(calls[1].starts_with("load 2 ocv4.ecc"));
        assert!(calls[1].ends_with("true false"));
        assert!(calls[2].starts_with("load 2 ca4.ecc"));
        assert!(calls[2].ends_with("false true"));
    }

    #[test]
    fn test_calls_require_connection() {
        let device = Device::new("usb0", Arc::new(RecordingDriver::default()));
        let err = device.start(0).unwrap_err();
        assert!(matches!(err, EchemError::ChannelState { operation: "start", .. }));
    }

    #[test]
    fn test_driver_errors_are_classified() {
        let driver = Arc::new(RecordingDriver {
            reject_load: true,
            ..RecordingDriver::default()
        });
        let device = Device::new("usb0", driver);
        device.connect(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            device.load(0, &sequence()),
            Err(EchemError::InvalidParameter(_))
        ));
        assert!(device.poll(0).unwrap_err().is_retryable());
    }
}
