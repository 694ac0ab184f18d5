//! Session lifetime policies.
//!
//! Decides, once per loop iteration, whether the server should exit.

use std::time::{Duration, Instant};

/// Default expect timeout in seconds.
pub const DEFAULT_TIMEOUT: i32 = 10;

/// Lifetime and behavior settings of a session.
///
/// Durations are kept in the signed whole-second form they are configured
/// and reported in; non-positive TTL and idle values, and negative
/// zombie-idle values, disable the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policies {
    pub ttl: i32,
    pub idle: i32,
    pub zombie_idle: i32,
    pub autowait: bool,
    /// Discard output while no client is attached instead of blocking the child.
    pub nonblock: bool,
    pub close_on_exit: bool,
    pub default_timeout: i32,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            ttl: 0,
            idle: 0,
            zombie_idle: -1,
            autowait: false,
            nonblock: false,
            close_on_exit: false,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[allow(clippy::cast_sign_loss)] // guarded by the sign checks of the callers
const fn secs(value: i32) -> Duration {
    Duration::from_secs(value as u64)
}

impl Policies {
    const fn ttl_limit(&self) -> Option<Duration> {
        if self.ttl > 0 { Some(secs(self.ttl)) } else { None }
    }

    const fn idle_limit(&self) -> Option<Duration> {
        if self.idle > 0 { Some(secs(self.idle)) } else { None }
    }

    const fn zombie_limit(&self) -> Option<Duration> {
        if self.zombie_idle >= 0 {
            Some(secs(self.zombie_idle))
        } else {
            None
        }
    }
}

/// Session state the policies look at.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub spawned_at: Instant,
    pub last_active: Instant,
    /// When the child was seen to exit.
    pub exited_at: Option<Instant>,
    /// A client has collected the exit status.
    pub waited: bool,
    pub pty_open: bool,
    pub connected: bool,
}

/// Why the server is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit status was delivered and the client is gone.
    Reaped,
    Autowait,
    ZombieIdle,
    Ttl,
    Idle,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Reaped => "child reaped",
            Self::Autowait => "child exited (autowait)",
            Self::ZombieIdle => "zombie idle timeout",
            Self::Ttl => "ttl expired",
            Self::Idle => "idle timeout",
        })
    }
}

/// Decide whether the session should end, in precedence order.
///
/// Nothing fires while a client is connected.
#[must_use]
pub fn evaluate(policies: &Policies, state: &Snapshot, now: Instant) -> Option<ExitReason> {
    if state.connected {
        return None;
    }
    if state.waited {
        return Some(ExitReason::Reaped);
    }

    let zombie = state.exited_at.is_some() && !state.pty_open;
    if zombie && policies.autowait {
        return Some(ExitReason::Autowait);
    }

    let idle_for = now.saturating_duration_since(state.last_active);
    if let (Some(limit), Some(exited_at)) = (policies.zombie_limit(), state.exited_at)
        && zombie
        && idle_for > limit
        && now.saturating_duration_since(exited_at) > limit
    {
        return Some(ExitReason::ZombieIdle);
    }

    if let Some(limit) = policies.ttl_limit()
        && now.saturating_duration_since(state.spawned_at) > limit
    {
        return Some(ExitReason::Ttl);
    }

    if let Some(limit) = policies.idle_limit()
        && idle_for > limit
    {
        return Some(ExitReason::Idle);
    }

    None
}
