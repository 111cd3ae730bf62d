//! Connection lifecycle and rate-limit backoff.
//!
//! ```text
//! Disconnected --begin_connect--> Connecting --on_connected--> Connected
//!       ^                             |
//!       |                     rate limit / login failure
//!       |                             v
//!       +------ cooldown hits 0 -- RateLimited(cooldown)
//! ```
//!
//! `locked` guards against duplicate connect attempts. It is set when a
//! connect begins and cleared only when a cooldown runs out.

use std::fmt;

use crate::transport::ChannelHandle;
use crate::types::{ChannelBoxError, Result, DEFAULT_LOGIN_FAILURE_COOLDOWN_SECS};

/// Coarse lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    RateLimited,
}

/// User-facing connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    /// A cooldown is armed; seconds remaining.
    RetryAfter(u64),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NotConnected => f.write_str("not connected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::RetryAfter(secs) => write!(f, "retry after {secs}"),
        }
    }
}

/// Connect lock, cooldown counter and channel handle.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    phase: ConnectionPhase,
    locked: bool,
    cooldown_secs: u64,
    channel: Option<ChannelHandle>,
    login_failure_cooldown_secs: u64,
}

impl ConnectionState {
    pub fn new(login_failure_cooldown_secs: u64) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            locked: false,
            cooldown_secs: 0,
            channel: None,
            login_failure_cooldown_secs,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs
    }

    pub fn channel(&self) -> Option<&ChannelHandle> {
        self.channel.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.channel.is_some() {
            ConnectionStatus::Connected
        } else if self.cooldown_secs > 0 {
            ConnectionStatus::RetryAfter(self.cooldown_secs)
        } else if self.locked {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::NotConnected
        }
    }

    /// Enter `Connecting`. Fails while locked or already connected.
    pub fn begin_connect(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Err(ChannelBoxError::StateError("already connected".to_string()));
        }
        if self.locked {
            let reason = if self.cooldown_secs > 0 {
                format!("rate limited, retry after {}s", self.cooldown_secs)
            } else {
                "connect already in progress".to_string()
            };
            return Err(ChannelBoxError::StateError(reason));
        }
        self.locked = true;
        self.phase = ConnectionPhase::Connecting;
        Ok(())
    }

    /// The target channel was fetched after `ready`.
    pub fn on_connected(&mut self, channel: ChannelHandle) {
        self.channel = Some(channel);
        self.locked = true;
        self.phase = ConnectionPhase::Connected;
    }

    /// Arm a cooldown of `ceil(timeout_ms / 1000)` seconds.
    ///
    /// While connected the channel is kept; the cooldown only blocks new
    /// connect attempts. Returns `true` when a cooldown was armed, in which
    /// case the caller restarts its one-second clock.
    pub fn on_rate_limited(&mut self, timeout_ms: u64) -> bool {
        self.arm_cooldown(timeout_ms.div_ceil(1000))
    }

    /// Login or channel fetch failed: back off for the fixed login cooldown.
    ///
    /// With a zero cooldown the attempt is simply abandoned and the lock
    /// released, unless another cooldown is still running.
    pub fn on_login_failed(&mut self) -> bool {
        if self.login_failure_cooldown_secs == 0 {
            if self.channel.is_none() && self.cooldown_secs == 0 {
                self.locked = false;
                self.phase = ConnectionPhase::Disconnected;
            }
            return false;
        }
        self.arm_cooldown(self.login_failure_cooldown_secs)
    }

    fn arm_cooldown(&mut self, secs: u64) -> bool {
        if secs == 0 {
            return false;
        }
        self.cooldown_secs = secs;
        self.locked = true;
        if self.channel.is_none() {
            self.phase = ConnectionPhase::RateLimited;
        }
        true
    }

    /// Advance the cooldown by one second.
    ///
    /// Returns `true` on the tick that brings the cooldown to zero, which is
    /// also when the lock is released.
    pub fn tick(&mut self) -> bool {
        if self.cooldown_secs == 0 {
            return false;
        }
        self.cooldown_secs -= 1;
        if self.cooldown_secs > 0 {
            return false;
        }
        self.locked = false;
        self.phase = if self.channel.is_some() {
            ConnectionPhase::Connected
        } else {
            ConnectionPhase::Disconnected
        };
        true
    }

    /// Drop the channel on teardown. A running cooldown keeps the lock.
    pub fn release(&mut self) -> Option<ChannelHandle> {
        let channel = self.channel.take();
        if self.cooldown_secs > 0 {
            self.phase = ConnectionPhase::RateLimited;
        } else {
            self.locked = false;
            self.phase = ConnectionPhase::Disconnected;
        }
        channel
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_FAILURE_COOLDOWN_SECS)
    }
}
