//! Admission and per-message rate limiting.
//!
//! Two layers: per-IP buckets gate the socket upgrade itself, per-user
//! buckets gate each inbound message. A rate of `0` disables the
//! corresponding gate.

use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config::Config;

/// Bucket classes for the plain-HTTP surface that fronts the signaling
/// endpoint (health, room directory). The socket path uses the dedicated
/// ip/user gates below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiClass {
    Global,
    Public,
    Rooms,
}

pub struct RateGate {
    upgrade_per_ip: Option<DefaultKeyedRateLimiter<IpAddr>>,
    upgrade_per_user: Option<DefaultKeyedRateLimiter<String>>,
    messages_per_user: Option<DefaultKeyedRateLimiter<String>>,
    api_global: Option<DefaultDirectRateLimiter>,
    api_public: Option<DefaultDirectRateLimiter>,
    api_rooms: Option<DefaultDirectRateLimiter>,
    dev_mode: bool,
}

fn per_minute(rate: u32) -> Option<Quota> {
    NonZeroU32::new(rate).map(Quota::per_minute)
}

impl RateGate {
    pub fn new(config: &Config) -> Self {
        Self {
            upgrade_per_ip: per_minute(config.rate_limit_ws_ip).map(RateLimiter::keyed),
            upgrade_per_user: per_minute(config.rate_limit_ws_user).map(RateLimiter::keyed),
            messages_per_user: per_minute(config.rate_limit_api_messages).map(RateLimiter::keyed),
            api_global: per_minute(config.rate_limit_api_global).map(RateLimiter::direct),
            api_public: per_minute(config.rate_limit_api_public).map(RateLimiter::direct),
            api_rooms: per_minute(config.rate_limit_api_rooms).map(RateLimiter::direct),
            dev_mode: config.dev_mode,
        }
    }

    /// Checked once per upgrade attempt, before the handshake is read.
    pub fn allow_upgrade_ip(&self, ip: IpAddr) -> bool {
        match &self.upgrade_per_ip {
            Some(limiter) => limiter.check_key(&ip).is_ok(),
            None => true,
        }
    }

    /// Checked once per upgrade attempt, after the token validated.
    pub fn allow_upgrade_user(&self, user_id: &str) -> bool {
        match &self.upgrade_per_user {
            Some(limiter) => limiter.check_key(&user_id.to_owned()).is_ok(),
            None => true,
        }
    }

    /// Checked by the router for every inbound message. Disabled in
    /// development mode.
    pub fn allow_message(&self, user_id: &str) -> bool {
        if self.dev_mode {
            return true;
        }
        match &self.messages_per_user {
            Some(limiter) => limiter.check_key(&user_id.to_owned()).is_ok(),
            None => true,
        }
    }

    pub fn allow_api(&self, class: ApiClass) -> bool {
        let limiter = match class {
            ApiClass::Global => &self.api_global,
            ApiClass::Public => &self.api_public,
            ApiClass::Rooms => &self.api_rooms,
        };
        match limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }
}
