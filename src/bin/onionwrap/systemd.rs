//! systemd notification support
//!
//! Lets onionwrap run as a `Type=notify` unit: the unit becomes active once
//! the onion service has been published, not when the process starts.

/// Notify systemd that the onion service exists and the worker is starting.
#[cfg(feature = "systemd")]
pub fn notify_ready() {
    // Keep NOTIFY_SOCKET for the status and stopping notifications
    match sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        Ok(()) => log::debug!("Sent READY notification to systemd"),
        Err(e) => log::debug!("Failed to notify systemd (not running under systemd?): {}", e),
    }
}

#[cfg(not(feature = "systemd"))]
pub fn notify_ready() {
    log::debug!("systemd notify support not compiled in");
}

/// Update the status line shown by `systemctl status`.
#[cfg(feature = "systemd")]
pub fn notify_status(status: &str) {
    match sd_notify::notify(false, &[sd_notify::NotifyState::Status(status)]) {
        Ok(()) => log::trace!("Updated systemd status: {}", status),
        Err(e) => log::trace!("Failed to update status: {}", e),
    }
}

#[cfg(not(feature = "systemd"))]
pub fn notify_status(_status: &str) {}

/// Tell systemd the onion service is being torn down.
#[cfg(feature = "systemd")]
pub fn notify_stopping() {
    match sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]) {
        Ok(()) => log::debug!("Sent STOPPING notification to systemd"),
        Err(e) => log::trace!("Failed to send STOPPING notification: {}", e),
    }
}

#[cfg(not(feature = "systemd"))]
pub fn notify_stopping() {}
