use std::time::Duration;

use serde::Serialize;

use crate::config::HeartbeatConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    #[default]
    Active,
    /// Counting down to a graceful shutdown (soft limit only).
    SoftIdle,
    /// Counting down to a forced shutdown (soft and hard limits).
    PossiblyIdle,
}

impl std::fmt::Display for IdleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleState::Active => write!(f, "active"),
            IdleState::SoftIdle => write!(f, "soft_idle"),
            IdleState::PossiblyIdle => write!(f, "possibly_idle"),
        }
    }
}

/// What an idle tick means for the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Idle shutdown is disabled; nothing to show.
    Untracked,
    /// Still counting down; `annotation` goes to the status string.
    Counting { annotation: String },
    /// Limit reached. `forced` skips the final flush.
    Shutdown { annotation: String, forced: bool },
}

/// Idle/heartbeat state machine.
///
/// Fed once per tick: [`record_activity`](Self::record_activity) when the
/// tick moved any messages, [`record_idle_tick`](Self::record_idle_tick)
/// otherwise. Each idle episode logs its entry exactly once; later ticks only
/// refresh the countdown.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    period: Duration,
    soft: u32,
    hard: Option<u32>,
    state: IdleState,
    idle_ticks: u32,
}

impl IdleTracker {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            period: config.heartbeat_period,
            soft: config.idle_heartbeats_soft,
            hard: config.idle_heartbeats_hard,
            state: IdleState::Active,
            idle_ticks: 0,
        }
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    /// Returns true if this moved us out of an idle state.
    pub fn record_activity(&mut self, reason: &str) -> bool {
        self.idle_ticks = 0;
        if self.state == IdleState::Active {
            return false;
        }
        self.state = IdleState::Active;
        tracing::info!("Moved to active state due to {}", reason);
        true
    }

    pub fn record_idle_tick(&mut self) -> IdleVerdict {
        if self.soft == 0 {
            return IdleVerdict::Untracked;
        }
        self.idle_ticks += 1;
        let n = self.idle_ticks;

        match self.hard {
            None => {
                if self.state == IdleState::Active {
                    self.state = IdleState::SoftIdle;
                    tracing::info!(
                        "In idle state due to idle_heartbeats_soft, shut down in {} seconds.",
                        seconds(countdown(self.period, self.soft - 1))
                    );
                }
                let annotation = format!(
                    "[idle; shut down in {}s]",
                    seconds(countdown(self.period, self.soft.saturating_sub(n)))
                );
                if n >= self.soft {
                    tracing::info!("Idle heartbeats reached.  Shutting down.");
                    IdleVerdict::Shutdown {
                        annotation,
                        forced: false,
                    }
                } else {
                    IdleVerdict::Counting { annotation }
                }
            }
            Some(hard) => {
                if self.state == IdleState::Active {
                    self.state = IdleState::PossiblyIdle;
                    tracing::info!(
                        "Possibly idle due to idle_heartbeats_hard, shut down in {} seconds.",
                        seconds(countdown(self.period, hard.saturating_sub(self.soft + 1)))
                    );
                }
                let annotation = format!(
                    "[possibly idle; shut down in {}s]",
                    seconds(countdown(self.period, hard.saturating_sub(n)))
                );
                if n >= hard {
                    tracing::warn!("Idle heartbeats reached.  Shutting down.  (HARD limit)");
                    IdleVerdict::Shutdown {
                        annotation,
                        forced: true,
                    }
                } else {
                    IdleVerdict::Counting { annotation }
                }
            }
        }
    }
}

/// Time left after `ticks` more periods, saturating at `Duration::MAX`.
fn countdown(period: Duration, ticks: u32) -> Duration {
    period.checked_mul(ticks).unwrap_or(Duration::MAX)
}

/// Whole seconds print without a fraction ("4"), others as-is ("2.5").
pub(crate) fn seconds(d: Duration) -> String {
    format!("{}", d.as_secs_f64())
}
