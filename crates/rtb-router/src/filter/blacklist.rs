//! Time-bounded user blacklists (stage 14).
//!
//! When an agent with a blacklist policy wins a user, that user (or
//! user+site pair) is barred from the agent's auctions for the configured
//! duration. Scope decides whether the bar applies to the single agent or
//! to every agent billing the same top-level account.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use rtb_common::agent_config::{AgentConfig, BlacklistKind, BlacklistScope};
use rtb_common::bid_request::BidRequest;

/// Who the blacklist entry is keyed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BlacklistKey {
    /// Agent id or account root, per the policy's scope.
    scope: String,
    user: String,
    /// Present only for user+site entries.
    site: Option<String>,
}

/// Shared store of live blacklist entries.
///
/// Reads happen on the filter hot path; `DashMap` keeps them lock-free
/// with respect to concurrent wins inserting new entries.
#[derive(Debug, Default)]
pub struct BlacklistStore {
    entries: DashMap<BlacklistKey, DateTime<Utc>>,
}

fn scope_key(agent_id: &str, config: &AgentConfig) -> String {
    match config.blacklist.scope {
        BlacklistScope::Agent => agent_id.to_string(),
        BlacklistScope::Account => config.account.root().to_string(),
    }
}

/// The id the blacklist tracks users by.
fn user_key(request: &BidRequest) -> Option<&str> {
    request
        .user_ids
        .exchange_id()
        .or_else(|| request.user_ids.provider_id())
}

impl BlacklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage 14: is this request's user barred for this agent?
    pub fn is_blacklisted(
        &self,
        agent_id: &str,
        config: &AgentConfig,
        request: &BidRequest,
        now: DateTime<Utc>,
    ) -> bool {
        if !config.blacklist.is_enabled() {
            return false;
        }
        let Some(user) = user_key(request) else {
            return false;
        };
        let scope = scope_key(agent_id, config);

        let live = |key: &BlacklistKey| {
            self.entries
                .get(key)
                .map(|expiry| *expiry > now)
                .unwrap_or(false)
        };

        // A user-wide entry bars every site.
        if live(&BlacklistKey {
            scope: scope.clone(),
            user: user.to_string(),
            site: None,
        }) {
            return true;
        }
        if config.blacklist.kind == BlacklistKind::UserSite {
            return live(&BlacklistKey {
                scope,
                user: user.to_string(),
                site: Some(request.host().to_string()),
            });
        }
        false
    }

    /// Record a win under the agent's blacklist policy.
    pub fn record_win(
        &self,
        agent_id: &str,
        config: &AgentConfig,
        request: &BidRequest,
        now: DateTime<Utc>,
    ) {
        if !config.blacklist.is_enabled() {
            return;
        }
        let Some(user) = user_key(request) else {
            return;
        };
        let site = match config.blacklist.kind {
            BlacklistKind::Off => return,
            BlacklistKind::User => None,
            BlacklistKind::UserSite => Some(request.host().to_string()),
        };
        let key = BlacklistKey {
            scope: scope_key(agent_id, config),
            user: user.to_string(),
            site,
        };
        let expiry = now + Duration::seconds(config.blacklist.duration_secs as i64);
        self.entries.insert(key, expiry);
    }

    /// Drop expired entries; called from the maintenance tick.
    pub fn purge_expired(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
