//! Stack configuration (spec.md §6.3). Grounded on the reference
//! implementation's inline `EndpointOption`/`DialogLayer` constructor
//! arguments, pulled together here into one settings type so a caller
//! configures the whole stack in one place instead of threading options
//! through multiple builders.

use std::time::Duration;

/// Transport-facing settings the stack needs even though it never opens a
/// socket itself — these shape Via/Contact construction and retransmit
/// timing, not the listener.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub default_transport: rsip::Transport,
    pub public_address: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_transport: rsip::Transport::Udp,
            public_address: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub user_agent: String,
    pub transport: TransportConfig,
    /// Contact URI used on UAS-side dialogs (the local Contact header for
    /// an inbound call the stack accepts). UAC-side dialogs take their
    /// Contact from `InviteOption::contact` instead, since a single
    /// process may originate calls under several identities.
    pub local_contact: Option<rsip::Uri>,
    /// Hard cap on live dialogs (spec.md §4.8); further `NewInvite`/inbound
    /// dialog-creating requests are rejected with `Error::ResourceExhausted`.
    pub max_dialogs: usize,
    /// Hard cap on live transactions (spec.md §4.4); enforced by
    /// [`crate::transaction::registry::TransactionRegistry`].
    pub max_transactions: usize,
    /// Timer B/F (transaction timeout) default, 64*T1 per RFC 3261 unless
    /// overridden.
    pub transaction_timeout: Duration,
    pub timer: crate::transaction::timer::TimerOptions,
    /// Disabled by default per spec.md's open question (c); set a refresher
    /// to enable RFC 4028 Session-Timers.
    pub session_timer: SessionTimerConfig,
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let timer = crate::transaction::timer::TimerOptions::default();
        Self {
            user_agent: "sipcore-stack".to_string(),
            transport: TransportConfig::default(),
            local_contact: None,
            max_dialogs: 1000,
            max_transactions: 100_000,
            transaction_timeout: timer.t1x64,
            timer,
            session_timer: SessionTimerConfig::default(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

/// RFC 4028 Session-Timers, sketched but disabled by default (spec.md's
/// open question (c)): this core never arms a session-refresh timer
/// unless a caller explicitly opts in by setting `refresher`.
#[derive(Debug, Clone, Default)]
pub struct SessionTimerConfig {
    pub refresher: Option<Refresher>,
    pub session_expires: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.max_dialogs, 1000);
        assert!(c.session_timer.refresher.is_none());
    }
}
