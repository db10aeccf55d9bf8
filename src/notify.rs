//! User notifications
//!
//! The engine reports unexpected disconnects and exhausted recovery through a
//! `Notifier`. The default implementation writes them to the log.

use tracing::warn;

pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Notifier that logs at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        warn!("[notification] {}: {}", title, body);
    }
}
