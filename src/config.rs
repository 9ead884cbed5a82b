//! Channel configuration.

use std::time::Duration;

use crate::{dispatch::DispatchMode, message::Credentials};

/// Smallest accepted segment size in bytes.
///
/// Sizes passed to the builders are clamped to at least this value so a
/// frame header plus a useful payload always fit one segment.
pub const MIN_SEGMENT_SIZE: usize = 64;

/// Largest accepted segment size in bytes (16 MiB).
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

fn clamp_segment_size(value: usize) -> usize { value.clamp(MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE) }

/// Tunables for one channel.
///
/// The defaults match the wire protocol's nominal operating point; every
/// field has a `with_*` builder for overrides.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Capacity of transmit segments.
    pub tx_segment_size: usize,
    /// Size of the receive window handed to the transport.
    pub rx_segment_size: usize,
    /// Idle segments the pool retains.
    pub pool_max_idle: usize,
    /// Time allowed for the login handshake.
    pub login_timeout: Duration,
    /// Time allowed for the logout handshake during graceful close.
    pub logout_timeout: Duration,
    /// Grace period for the transmit drain during shutdown.
    pub drain_grace: Duration,
    /// Items per stream page.
    pub page_size: usize,
    /// Stream send window in pages.
    pub window: u32,
    /// Inbound dispatch concurrency mode.
    pub dispatch_mode: DispatchMode,
    /// Depth of the paged inbound queue (`PagedQueueX1` only).
    pub queue_depth: usize,
    /// Route the dialed socket through the installed secure hook.
    pub tls_enabled: bool,
    /// Credentials presented at login.
    pub credentials: Credentials,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            tx_segment_size: 64 * 1024,
            rx_segment_size: 64 * 1024,
            pool_max_idle: 32,
            login_timeout: Duration::from_secs(10),
            logout_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(5),
            page_size: 200,
            window: 2,
            dispatch_mode: DispatchMode::NoQueue,
            queue_depth: 64,
            tls_enabled: false,
            credentials: Credentials::default(),
        }
    }
}

impl ChannelConfig {
    /// Set the transmit segment size (clamped to the supported range).
    #[must_use]
    pub fn with_tx_segment_size(mut self, size: usize) -> Self {
        self.tx_segment_size = clamp_segment_size(size);
        self
    }

    /// Set the receive window size (clamped to the supported range).
    #[must_use]
    pub fn with_rx_segment_size(mut self, size: usize) -> Self {
        self.rx_segment_size = clamp_segment_size(size);
        self
    }

    /// Set the login handshake timeout.
    #[must_use]
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the logout handshake timeout.
    #[must_use]
    pub fn with_logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }

    /// Set the shutdown drain grace period.
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Set the stream page size in items.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the stream send window in pages.
    #[must_use]
    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window.max(1);
        self
    }

    /// Select the inbound dispatch mode.
    #[must_use]
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Set the paged queue depth.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Enable routing through the secure hook.
    #[must_use]
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Set the login credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}
