use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Chat permission level that decides which send window applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    Regular,
    /// Moderators, VIPs and the broadcaster.
    Moderator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleReason {
    TooFast,
    TooMany,
}

impl ThrottleReason {
    pub fn user_message(&self) -> &'static str {
        match self {
            ThrottleReason::TooFast => "You are sending messages too quickly.",
            ThrottleReason::TooMany => "You are sending too many messages.",
        }
    }
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.user_message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub max_messages: usize,
    pub window: Duration,
    pub min_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub regular: TierLimits,
    pub moderator: TierLimits,
    pub warning_cooldown: Duration,
}

/// Regular 20 per 30 s, moderator 100 per 30 s. The regular tier also
/// requires 1.1 s between sends, so a burst is cut short by `TooFast` well
/// before the window fills; use a zero `min_interval` for pure capacity.
impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            regular: TierLimits {
                max_messages: 20,
                window: Duration::from_secs(30),
                min_interval: Duration::from_millis(1100),
            },
            moderator: TierLimits {
                max_messages: 100,
                window: Duration::from_secs(30),
                min_interval: Duration::from_millis(100),
            },
            warning_cooldown: Duration::from_secs(30),
        }
    }
}

/// Timestamps of recent sends for one tier, oldest first.
#[derive(Debug)]
pub struct RateWindow {
    limits: TierLimits,
    sent: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limits: TierLimits) -> Self {
        Self {
            limits,
            sent: VecDeque::new(),
        }
    }

    pub fn limits(&self) -> TierLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    /// Records a send at `now` if the tier allows it.
    pub fn admit(&mut self, now: Instant) -> Result<(), ThrottleReason> {
        if let Some(last) = self.sent.back()
            && now.saturating_duration_since(*last) < self.limits.min_interval
        {
            return Err(ThrottleReason::TooFast);
        }

        self.purge_expired(now);

        if self.sent.len() >= self.limits.max_messages {
            return Err(ThrottleReason::TooMany);
        }

        self.sent.push_back(now);
        Ok(())
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= self.limits.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected {
        reason: ThrottleReason,
        /// Whether the caller should surface a warning for this rejection.
        warn: bool,
    },
}

/// Send admission for one account across both tiers.
///
/// Warnings are debounced per reason: a rejection only asks for a warning
/// if none was requested for the same reason within `warning_cooldown`.
#[derive(Debug)]
pub struct SendGate {
    regular: RateWindow,
    moderator: RateWindow,
    warning_cooldown: Duration,
    last_warned_too_fast: Option<Instant>,
    last_warned_too_many: Option<Instant>,
}

impl SendGate {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            regular: RateWindow::new(config.regular),
            moderator: RateWindow::new(config.moderator),
            warning_cooldown: config.warning_cooldown,
            last_warned_too_fast: None,
            last_warned_too_many: None,
        }
    }

    pub fn window(&self, tier: RateTier) -> &RateWindow {
        match tier {
            RateTier::Regular => &self.regular,
            RateTier::Moderator => &self.moderator,
        }
    }

    pub fn check(&mut self, tier: RateTier, now: Instant) -> Admission {
        let window = match tier {
            RateTier::Regular => &mut self.regular,
            RateTier::Moderator => &mut self.moderator,
        };

        match window.admit(now) {
            Ok(()) => Admission::Accepted,
            Err(reason) => {
                let last_warned = match reason {
                    ThrottleReason::TooFast => &mut self.last_warned_too_fast,
                    ThrottleReason::TooMany => &mut self.last_warned_too_many,
                };
                let warn = last_warned
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.warning_cooldown);
                if warn {
                    *last_warned = Some(now);
                }
                Admission::Rejected { reason, warn }
            }
        }
    }
}
