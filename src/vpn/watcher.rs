//! Debounced network-change watcher
//!
//! Subscribes to interface-change and route-change notifications and calls
//! a reapply callback once the change storm has been quiet for the debounce
//! window. Kicks arriving inside the suppression window are dropped: the
//! configurator's own route writes raise the same notifications, and
//! reacting to them would reconfigure in a feedback loop.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::NetworkManagement::IpHelper::{
    CancelMibChangeNotify2, NotifyIpInterfaceChange, NotifyRouteChange2, MIB_IPFORWARD_ROW2,
    MIB_IPINTERFACE_ROW, MIB_NOTIFICATION_TYPE,
};
use windows::Win32::Networking::WinSock::AF_UNSPEC;
use windows::Win32::System::SystemInformation::GetTickCount64;
use windows::Win32::System::Threading::{
    CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE,
};

use super::{VpnError, VpnResult};

/// Default quiet window before reapplying.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Whether a kick at `now_ms` falls inside the suppression window.
pub fn is_suppressed(now_ms: u64, until_ms: u64) -> bool {
    now_ms < until_ms
}

/// State shared with the OS notification callbacks. Kept alive through a
/// leaked Arc reference until both subscriptions are cancelled.
struct WatcherShared {
    kick_raw: usize,
    suppress_until_ms: AtomicU64,
}

// The raw kick handle is only ever passed back to Win32; the event object
// itself is thread-safe.
unsafe impl Send for WatcherShared {}
unsafe impl Sync for WatcherShared {}

impl WatcherShared {
    fn now_ms() -> u64 {
        unsafe { GetTickCount64() }
    }

    fn kick_handle(&self) -> HANDLE {
        HANDLE(self.kick_raw as *mut c_void)
    }

    fn kick(&self) {
        let until = self.suppress_until_ms.load(Ordering::Relaxed);
        if is_suppressed(Self::now_ms(), until) {
            return;
        }
        unsafe {
            let _ = SetEvent(self.kick_handle());
        }
    }

    fn suppress(&self, dur: Duration) {
        let until = Self::now_ms() + dur.as_millis() as u64;
        self.suppress_until_ms.store(until, Ordering::Relaxed);
    }
}

unsafe extern "system" fn on_interface_change(
    ctx: *const c_void,
    _row: *const MIB_IPINTERFACE_ROW,
    _kind: MIB_NOTIFICATION_TYPE,
) {
    if !ctx.is_null() {
        log::trace!("Interface change: kick");
        (*(ctx as *const WatcherShared)).kick();
    }
}

unsafe extern "system" fn on_route_change(
    ctx: *const c_void,
    _row: *const MIB_IPFORWARD_ROW2,
    _kind: MIB_NOTIFICATION_TYPE,
) {
    if !ctx.is_null() {
        log::trace!("Route change: kick");
        (*(ctx as *const WatcherShared)).kick();
    }
}

fn worker_main(
    stop_raw: usize,
    shared: Arc<WatcherShared>,
    debounce: Duration,
    reapply: Box<dyn Fn() + Send>,
) {
    log::debug!("Watcher thread started");
    let handles = [HANDLE(stop_raw as *mut c_void), shared.kick_handle()];
    let debounce_ms = debounce.as_millis() as u32;

    loop {
        let dw = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };
        if dw == WAIT_OBJECT_0 {
            log::debug!("Watcher thread: stop signaled");
            break;
        }
        if dw.0 != WAIT_OBJECT_0.0 + 1 {
            log::warn!("Watcher thread: unexpected wait result {}", dw.0);
            break;
        }

        log::trace!("Watcher thread: kick, debounce={}ms", debounce_ms);
        // Coalesce: each further kick restarts the quiet window.
        loop {
            let dw2 = unsafe { WaitForMultipleObjects(&handles, false, debounce_ms) };
            if dw2 == WAIT_OBJECT_0 {
                log::debug!("Watcher thread: stop during debounce");
                return;
            }
            if dw2 == WAIT_TIMEOUT {
                log::info!("Network quiescent, reapplying configuration");
                // Our own route writes must not re-kick us immediately.
                shared.suppress(debounce);
                reapply();
                break;
            }
            if dw2.0 == WAIT_OBJECT_0.0 + 1 {
                log::trace!("Watcher thread: extra kick during debounce");
                continue;
            }
            log::warn!("Watcher thread: unexpected wait result {}", dw2.0);
            break;
        }
    }
    log::debug!("Watcher thread exiting");
}

/// Scoped network-change watcher. Construction arms the subscriptions and
/// spawns the worker; Drop (or `stop`) tears everything down.
pub struct NetWatcher {
    shared: Arc<WatcherShared>,
    ctx: *const WatcherShared,
    stop_raw: usize,
    if_notify_raw: usize,
    route_notify_raw: usize,
    thread: Option<JoinHandle<()>>,
    stopped: bool,
}

// Raw handles and the leaked context pointer are owned exclusively by this
// object; all Win32 objects involved are thread-safe.
unsafe impl Send for NetWatcher {}

impl NetWatcher {
    pub fn new(reapply: Box<dyn Fn() + Send>, debounce: Duration) -> VpnResult<Self> {
        log::debug!("Starting net watcher, debounce={}ms", debounce.as_millis());

        let stop = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|e| VpnError::Watcher(format!("CreateEventW(stop) failed: {}", e)))?;
        let kick = match unsafe { CreateEventW(None, false, false, PCWSTR::null()) } {
            Ok(h) => h,
            Err(e) => {
                unsafe { let _ = CloseHandle(stop); };
                return Err(VpnError::Watcher(format!("CreateEventW(kick) failed: {}", e)));
            }
        };

        let shared = Arc::new(WatcherShared {
            kick_raw: kick.0 as usize,
            suppress_until_ms: AtomicU64::new(0),
        });
        // Reference handed to the OS callbacks; reclaimed in stop_core once
        // both subscriptions are cancelled.
        let ctx = Arc::into_raw(Arc::clone(&shared));

        let close_events = |ctx: *const WatcherShared| unsafe {
            drop(Arc::from_raw(ctx));
            let _ = CloseHandle(stop);
            let _ = CloseHandle(kick);
        };

        let mut h_if = HANDLE::default();
        let rc = unsafe {
            NotifyIpInterfaceChange(
                AF_UNSPEC,
                Some(on_interface_change),
                Some(ctx as *const c_void),
                false,
                &mut h_if,
            )
        };
        if rc.is_err() {
            close_events(ctx);
            return Err(VpnError::Watcher(format!(
                "NotifyIpInterfaceChange failed rc={}",
                rc.0
            )));
        }

        let mut h_route = HANDLE::default();
        let rc = unsafe {
            NotifyRouteChange2(
                AF_UNSPEC,
                Some(on_route_change),
                Some(ctx as *const c_void),
                false,
                &mut h_route,
            )
        };
        if rc.is_err() {
            unsafe { let _ = CancelMibChangeNotify2(h_if); };
            close_events(ctx);
            return Err(VpnError::Watcher(format!(
                "NotifyRouteChange2 failed rc={}",
                rc.0
            )));
        }

        let stop_raw = stop.0 as usize;
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("tunforge-netwatch".into())
            .spawn(move || worker_main(stop_raw, thread_shared, debounce, reapply))
            .map_err(|e| {
                unsafe {
                    let _ = CancelMibChangeNotify2(h_if);
                    let _ = CancelMibChangeNotify2(h_route);
                };
                close_events(ctx);
                VpnError::Watcher(format!("failed to spawn watcher thread: {}", e))
            })?;

        log::info!("Net watcher armed (debounce={}ms)", debounce.as_millis());
        Ok(Self {
            shared,
            ctx,
            stop_raw,
            if_notify_raw: h_if.0 as usize,
            route_notify_raw: h_route.0 as usize,
            thread: Some(thread),
            stopped: false,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    /// Drop kicks for the given interval. Called around configuration
    /// passes initiated outside the watcher itself.
    pub fn suppress(&self, dur: Duration) {
        self.shared.suppress(dur);
    }

    /// Stop the watcher. Idempotent.
    pub fn stop(&mut self) {
        self.stop_core();
    }

    fn stop_core(&mut self) {
        if self.stopped {
            return;
        }
        log::debug!("Stopping net watcher");

        // Cancel subscriptions first: after these return no callback can
        // still be running, so the leaked context is safe to reclaim.
        unsafe {
            if self.if_notify_raw != 0 {
                let _ = CancelMibChangeNotify2(HANDLE(self.if_notify_raw as *mut c_void));
                self.if_notify_raw = 0;
            }
            if self.route_notify_raw != 0 {
                let _ = CancelMibChangeNotify2(HANDLE(self.route_notify_raw as *mut c_void));
                self.route_notify_raw = 0;
            }
        }

        unsafe {
            let _ = SetEvent(HANDLE(self.stop_raw as *mut c_void));
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        unsafe {
            let _ = CloseHandle(HANDLE(self.stop_raw as *mut c_void));
            let _ = CloseHandle(self.shared.kick_handle());
            drop(Arc::from_raw(self.ctx));
        }

        self.stopped = true;
        log::info!("Net watcher stopped");
    }
}

impl Drop for NetWatcher {
    fn drop(&mut self) {
        self.stop_core();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_debounce() {
        assert_eq!(DEFAULT_DEBOUNCE, Duration::from_millis(1500));
    }

    #[test]
    fn test_suppression_window() {
        assert!(is_suppressed(100, 200));
        assert!(!is_suppressed(200, 200));
        assert!(!is_suppressed(300, 200));
        // No suppression armed
        assert!(!is_suppressed(0, 0));
    }
}
