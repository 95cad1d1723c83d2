//! Windows implementations: Win32 window control, GDI pixel sampling,
//! SendInput clicks, and a sysinfo-backed process table.

use crate::automation::{Color, SampleRegion, ScreenPoint, UiAction, UiInteraction, VisualSampler};
use crate::errors::{PowerError, SupervisorError};
use crate::process::{Pid, ProcessControl, ProcessHandle, WindowId, WindowRect};
use parking_lot::Mutex;
use std::path::Path;
use std::time::Instant;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};
use windows::Win32::Foundation::{BOOL, COLORREF, HWND, LPARAM, RECT, WPARAM};
use windows::Win32::Graphics::Gdi::{GetDC, GetPixel, ReleaseDC, CLR_INVALID};
use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEINPUT,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowRect, GetWindowThreadProcessId, IsHungAppWindow, IsIconic,
    IsWindowVisible, PostMessageW, SetCursorPos, ShowWindow, SC_MINIMIZE, SW_MINIMIZE,
    WM_SYSCOMMAND,
};

fn hwnd(window: WindowId) -> HWND {
    HWND(window.0 as isize)
}

/// Win32/sysinfo process control.
pub struct WinProcessControl {
    sys: Mutex<System>,
}

impl WinProcessControl {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for WinProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

struct EnumContext {
    pid: u32,
    found: HWND,
}

unsafe extern "system" fn enum_visible_window(window: HWND, lparam: LPARAM) -> BOOL {
    let ctx = &mut *(lparam.0 as *mut EnumContext);
    let mut owner_pid = 0u32;
    GetWindowThreadProcessId(window, Some(&mut owner_pid));
    if owner_pid == ctx.pid && IsWindowVisible(window).as_bool() {
        ctx.found = window;
        return BOOL(0); // stop enumeration
    }
    BOOL(1)
}

impl ProcessControl for WinProcessControl {
    fn find_by_name(&self, process_name: &str) -> Option<Pid> {
        let wanted = process_name.to_lowercase();
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        for (pid, process) in sys.processes() {
            let name = process.name().to_string_lossy().to_lowercase();
            if name == wanted || name == format!("{wanted}.exe") {
                return Some(pid.as_u32());
            }
        }
        None
    }

    fn is_running(&self, pid: Pid) -> bool {
        let mut sys = self.sys.lock();
        let target = sysinfo::Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).is_some()
    }

    fn is_responsive(&self, pid: Pid) -> bool {
        match self.find_window(pid) {
            // No window yet counts as responsive; hang detection only
            // means anything once a window exists.
            None => true,
            Some(window) => unsafe { !IsHungAppWindow(hwnd(window)).as_bool() },
        }
    }

    fn launch(&self, path: &Path) -> Result<ProcessHandle, SupervisorError> {
        let child = std::process::Command::new(path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| SupervisorError::LaunchFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(ProcessHandle {
            pid: child.id(),
            launched_at: Instant::now(),
            window: None,
        })
    }

    fn terminate(&self, pid: Pid) {
        let mut sys = self.sys.lock();
        let target = sysinfo::Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match sys.process(target) {
            Some(process) => {
                if !process.kill() {
                    warn!("failed to kill pid {pid}");
                }
            }
            None => debug!("terminate: pid {pid} already gone"),
        }
    }

    fn find_window(&self, pid: Pid) -> Option<WindowId> {
        let mut ctx = EnumContext {
            pid,
            found: HWND(0),
        };
        unsafe {
            // EnumWindows reports an error when the callback stops it
            // early; that is our found-it path, not a failure.
            let _ = EnumWindows(
                Some(enum_visible_window),
                LPARAM(&mut ctx as *mut EnumContext as isize),
            );
        }
        if ctx.found.0 == 0 {
            None
        } else {
            Some(WindowId(ctx.found.0 as u64))
        }
    }

    fn window_rect(&self, window: WindowId) -> Option<WindowRect> {
        let mut rect = RECT::default();
        unsafe {
            GetWindowRect(hwnd(window), &mut rect).ok()?;
        }
        Some(WindowRect {
            left: rect.left,
            top: rect.top,
            right: rect.right,
            bottom: rect.bottom,
        })
    }

    fn minimize(&self, window: WindowId) -> bool {
        let handle = hwnd(window);
        unsafe {
            ShowWindow(handle, SW_MINIMIZE);
            if IsIconic(handle).as_bool() {
                return true;
            }
            // Some UI toolkits ignore ShowWindow while painting their
            // startup splash; a posted syscommand gets through.
            let _ = PostMessageW(
                handle,
                WM_SYSCOMMAND,
                WPARAM(SC_MINIMIZE as usize),
                LPARAM(0),
            );
            IsIconic(handle).as_bool()
        }
    }
}

/// GDI screen sampler: per-channel median over the patch.
pub struct GdiSampler;

impl VisualSampler for GdiSampler {
    fn sample(&self, region: SampleRegion) -> Result<Color, PowerError> {
        let radius = region.radius.max(0);
        let mut reds = Vec::new();
        let mut greens = Vec::new();
        let mut blues = Vec::new();

        unsafe {
            let dc = GetDC(HWND(0));
            if dc.is_invalid() {
                return Err(PowerError::Sampling("GetDC failed".into()));
            }
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let pixel = GetPixel(dc, region.center.x + dx, region.center.y + dy);
                    if pixel == CLR_INVALID {
                        continue;
                    }
                    let v = pixel.0;
                    reds.push((v & 0xFF) as u8);
                    greens.push(((v >> 8) & 0xFF) as u8);
                    blues.push(((v >> 16) & 0xFF) as u8);
                }
            }
            ReleaseDC(HWND(0), dc);
        }

        if reds.is_empty() {
            return Err(PowerError::Sampling(format!(
                "no readable pixels around ({}, {})",
                region.center.x, region.center.y
            )));
        }

        Ok(Color {
            r: median(&mut reds),
            g: median(&mut greens),
            b: median(&mut blues),
        })
    }
}

fn median(values: &mut [u8]) -> u8 {
    values.sort_unstable();
    values[values.len() / 2]
}

/// SendInput-based mouse synthesis.
pub struct SendInputUi;

impl SendInputUi {
    fn mouse_input(flags: windows::Win32::UI::Input::KeyboardAndMouse::MOUSE_EVENT_FLAGS) -> INPUT {
        INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx: 0,
                    dy: 0,
                    mouseData: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        }
    }
}

impl UiInteraction for SendInputUi {
    fn invoke(&self, action: UiAction) -> Result<(), PowerError> {
        match action {
            UiAction::Click(ScreenPoint { x, y }) => unsafe {
                SetCursorPos(x, y)
                    .map_err(|e| PowerError::Interaction(format!("SetCursorPos: {e}")))?;
                std::thread::sleep(std::time::Duration::from_millis(20));

                let inputs = [
                    Self::mouse_input(MOUSEEVENTF_LEFTDOWN),
                    Self::mouse_input(MOUSEEVENTF_LEFTUP),
                ];
                let sent = SendInput(&inputs, std::mem::size_of::<INPUT>() as i32);
                if sent != inputs.len() as u32 {
                    return Err(PowerError::Interaction(format!(
                        "SendInput delivered {sent}/{} events",
                        inputs.len()
                    )));
                }
                Ok(())
            },
        }
    }
}
