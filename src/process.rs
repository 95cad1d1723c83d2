//! Process-control seam for the external monitor app.
//!
//! Window identities here are weak references: lookup keys that the app
//! can silently invalidate by recreating its window. Holders revalidate
//! on every use and never assume one survives across supervision cycles.

use crate::errors::SupervisorError;
use std::path::Path;
use std::time::Instant;

pub type Pid = u32;

/// Opaque window identity. Identity + lookup only; carries no ownership
/// or durability guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Window rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// The supervised process as the supervisor sees it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub launched_at: Instant,
    /// Last stabilized window identity, if any. Weak reference.
    pub window: Option<WindowId>,
}

/// Operations on the external process and its window.
pub trait ProcessControl: Send + Sync {
    /// Find a running process by executable name (without extension).
    fn find_by_name(&self, process_name: &str) -> Option<Pid>;

    fn is_running(&self, pid: Pid) -> bool;

    /// Whether the process's UI is responding to input. A process with no
    /// window yet counts as responsive.
    fn is_responsive(&self, pid: Pid) -> bool;

    fn launch(&self, path: &Path) -> Result<ProcessHandle, SupervisorError>;

    fn terminate(&self, pid: Pid);

    /// Main (visible) window of the process, if one exists right now.
    fn find_window(&self, pid: Pid) -> Option<WindowId>;

    /// Screen rectangle of a window; `None` if the identity went stale.
    fn window_rect(&self, window: WindowId) -> Option<WindowRect>;

    /// Request minimization; non-blocking best effort. True if the window
    /// is minimized afterwards.
    fn minimize(&self, window: WindowId) -> bool;
}
