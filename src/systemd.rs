//! Minimal systemd notification support.
//!
//! Sends state strings over the `NOTIFY_SOCKET` datagram socket as described
//! in `sd_notify(3)`. Outside of a systemd unit (no socket in the
//! environment) every call is a no-op.

#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

use tracing::debug;

/// Send a set of `KEY=VALUE` state lines to the service manager.
pub fn notify(states: &[&str]) {
    #[cfg(unix)]
    {
        let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
            return;
        };
        // Abstract namespace sockets ('@' prefixed) are not supported here.
        if !socket_path.starts_with('/') {
            return;
        }
        let Ok(socket) = UnixDatagram::unbound() else {
            return;
        };
        let message = states.join("\n");
        if let Err(e) = socket.send_to(message.as_bytes(), &socket_path) {
            debug!(error = %e, "can not notify service manager");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = states;
    }
}

/// Announce that the service finished starting up.
pub fn notify_ready() {
    notify(&["READY=1"]);
}

/// Report a degraded state to the service manager.
pub fn notify_degraded(status: &str) {
    let status_line = format!("STATUS={status}");
    notify(&[status_line.as_str(), "ERROR=1"]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_without_socket_is_noop() {
        // No NOTIFY_SOCKET in the test environment; must not panic.
        notify(&["READY=1"]);
        notify_ready();
        notify_degraded("something failed");
    }
}
