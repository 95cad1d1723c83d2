//! HID implementation of the device source.
//!
//! The knob enumerates as a vendor HID device and emits 3-byte reports
//! where the first byte is a key code: rotation direction or one of the
//! click gestures. A zero key code is a heartbeat and is skipped.

use super::{ButtonKey, DeviceEvent, DeviceInput, DeviceSource};
use crate::errors::DeviceError;
use hidapi::{HidApi, HidDevice};
use std::time::Instant;
use tracing::{debug, info};

// Key codes from the knob's report descriptor.
const KEY_ROTATE_DOWN: u8 = 1;
const KEY_ROTATE_UP: u8 = 2;
const KEY_LONG_PRESS: u8 = 4;
const KEY_TRIPLE_CLICK: u8 = 8;
const KEY_DOUBLE_CLICK: u8 = 16;
const KEY_CLICK: u8 = 32;

const REPORT_LEN: usize = 3;

/// HID-backed knob source. Holds the handle open across reads and
/// supports reopening after the device is unplugged and replugged.
pub struct HidKnob {
    api: HidApi,
    device: Option<HidDevice>,
    vid: u16,
    pid: u16,
    read_timeout_ms: i32,
}

impl HidKnob {
    pub fn new(vid: u16, pid: u16, read_timeout_ms: i32) -> Result<Self, DeviceError> {
        let api = HidApi::new().map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        Ok(Self {
            api,
            device: None,
            vid,
            pid,
            read_timeout_ms,
        })
    }

    fn ensure_open(&mut self) -> Result<&HidDevice, DeviceError> {
        if self.device.is_none() {
            let device = self
                .api
                .open(self.vid, self.pid)
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
            info!(
                "connected to knob VID {:#06x} PID {:#06x}",
                self.vid, self.pid
            );
            self.device = Some(device);
        }
        Ok(self.device.as_ref().expect("just opened"))
    }

    fn decode(key: u8, at: Instant) -> Option<DeviceEvent> {
        let input = match key {
            KEY_ROTATE_UP => DeviceInput::Rotate { delta: 1 },
            KEY_ROTATE_DOWN => DeviceInput::Rotate { delta: -1 },
            KEY_CLICK => DeviceInput::Button {
                key: ButtonKey::Click,
            },
            KEY_DOUBLE_CLICK => DeviceInput::Button {
                key: ButtonKey::DoubleClick,
            },
            KEY_TRIPLE_CLICK => DeviceInput::Button {
                key: ButtonKey::TripleClick,
            },
            KEY_LONG_PRESS => DeviceInput::Button {
                key: ButtonKey::LongPress,
            },
            other => {
                debug!("unmapped knob key code {other}");
                return None;
            }
        };
        Some(DeviceEvent { input, at })
    }
}

impl DeviceSource for HidKnob {
    fn read_next(&mut self) -> Result<Option<DeviceEvent>, DeviceError> {
        let timeout = self.read_timeout_ms;
        let device = self.ensure_open()?;

        let mut report = [0u8; REPORT_LEN];
        let read = device
            .read_timeout(&mut report, timeout)
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        if read == 0 {
            return Ok(None); // timeout tick
        }

        let key = report[0];
        if key == 0 {
            return Ok(None);
        }

        Ok(Self::decode(key, Instant::now()))
    }

    fn reopen(&mut self) -> Result<(), DeviceError> {
        self.device = None;
        self.api
            .refresh_devices()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        self.ensure_open().map(|_| ())
    }
}
