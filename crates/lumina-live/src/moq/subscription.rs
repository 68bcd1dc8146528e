//! Subscription lifecycle bookkeeping.
//!
//! A subscription is created when we send SUBSCRIBE, confirmed by
//! SUBSCRIBE_OK (which binds a track alias used on media streams) or rejected
//! by SUBSCRIBE_ERROR, and ended when we send UNSUBSCRIBE.

use std::collections::HashMap;

use super::error::MoqError;
use super::message::{
    FilterType, GroupOrder, Location, Subscribe, SubscribeError, SubscribeOk, Unsubscribe,
};

/// State of a track subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// SUBSCRIBE sent, no answer yet.
    Pending,
    /// Confirmed by the publisher.
    Active {
        track_alias: u64,
        largest: Option<Location>,
    },
    /// Refused by the publisher.
    Rejected { error_code: u64, reason: String },
}

/// A single track subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub request_id: u64,
    pub namespace: Vec<String>,
    pub track_name: String,
    pub priority: u8,
    pub group_order: GroupOrder,
    pub filter_type: FilterType,
    pub state: SubscriptionState,
}

impl Subscription {
    /// Returns the track alias once the subscription is active.
    pub fn track_alias(&self) -> Option<u64> {
        match self.state {
            SubscriptionState::Active { track_alias, .. } => Some(track_alias),
            _ => None,
        }
    }
}

/// Tracks all subscriptions of one control session.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    next_request_id: u64,
    /// Exclusive upper bound granted by the server, if any.
    max_request_id: Option<u64>,
    subscriptions: HashMap<u64, Subscription>,
    /// track alias -> request id
    aliases: HashMap<u64, u64>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the server's max-request-id grant.
    pub fn set_max_request_id(&mut self, max: u64) {
        self.max_request_id = Some(max);
    }

    /// Creates a pending subscription and returns the SUBSCRIBE to send.
    pub fn subscribe(
        &mut self,
        namespace: Vec<String>,
        track_name: impl Into<String>,
        priority: u8,
    ) -> Result<Subscribe, MoqError> {
        let request_id = self.next_request_id;
        if let Some(max) = self.max_request_id {
            if request_id >= max {
                return Err(MoqError::RequestIdsExhausted(max));
            }
        }
        self.next_request_id += 1;

        let msg = Subscribe {
            request_id,
            namespace,
            track_name: track_name.into(),
            priority,
            group_order: GroupOrder::Ascending,
            forward: true,
            filter_type: FilterType::LatestObject,
        };
        tracing::debug!(
            "MoQ: subscribing {}/{} (request {})",
            msg.namespace.join("/"),
            msg.track_name,
            request_id
        );
        self.subscriptions.insert(
            request_id,
            Subscription {
                request_id,
                namespace: msg.namespace.clone(),
                track_name: msg.track_name.clone(),
                priority,
                group_order: msg.group_order,
                filter_type: msg.filter_type,
                state: SubscriptionState::Pending,
            },
        );
        Ok(msg)
    }

    /// Confirms a pending subscription.
    pub fn on_subscribe_ok(&mut self, ok: &SubscribeOk) -> Result<&Subscription, MoqError> {
        if let Some(&other) = self.aliases.get(&ok.track_alias) {
            if other != ok.request_id {
                return Err(MoqError::Field(format!(
                    "SUBSCRIBE_OK: track alias {} already bound to request {}",
                    ok.track_alias, other
                )));
            }
        }
        let sub = self.pending_mut(ok.request_id, "SUBSCRIBE_OK")?;
        sub.state = SubscriptionState::Active {
            track_alias: ok.track_alias,
            largest: ok.largest,
        };
        tracing::debug!(
            "MoQ: subscription {} active (alias {}, largest {:?})",
            ok.request_id,
            ok.track_alias,
            ok.largest
        );
        self.aliases.insert(ok.track_alias, ok.request_id);
        Ok(&self.subscriptions[&ok.request_id])
    }

    /// Rejects a pending subscription and removes it.
    pub fn on_subscribe_error(&mut self, err: &SubscribeError) -> Result<Subscription, MoqError> {
        self.pending_mut(err.request_id, "SUBSCRIBE_ERROR")?;
        let mut sub = self
            .subscriptions
            .remove(&err.request_id)
            .ok_or_else(|| unknown_request("SUBSCRIBE_ERROR", err.request_id))?;
        tracing::debug!(
            "MoQ: subscription {} rejected: {} ({})",
            err.request_id,
            err.reason,
            err.error_code
        );
        sub.state = SubscriptionState::Rejected {
            error_code: err.error_code,
            reason: err.reason.clone(),
        };
        Ok(sub)
    }

    /// Ends a subscription, returning the UNSUBSCRIBE to send.
    ///
    /// Returns `None` for an unknown request ID.
    pub fn unsubscribe(&mut self, request_id: u64) -> Option<Unsubscribe> {
        let sub = self.subscriptions.remove(&request_id)?;
        if let Some(alias) = sub.track_alias() {
            self.aliases.remove(&alias);
        }
        tracing::debug!("MoQ: unsubscribing request {}", request_id);
        Some(Unsubscribe { request_id })
    }

    pub fn get(&self, request_id: u64) -> Option<&Subscription> {
        self.subscriptions.get(&request_id)
    }

    /// Looks up the active subscription a media stream's track alias belongs to.
    pub fn by_alias(&self, track_alias: u64) -> Option<&Subscription> {
        self.aliases
            .get(&track_alias)
            .and_then(|id| self.subscriptions.get(id))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drops every subscription and restarts request ID allocation.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn pending_mut(&mut self, request_id: u64, what: &str) -> Result<&mut Subscription, MoqError> {
        let sub = self
            .subscriptions
            .get_mut(&request_id)
            .ok_or_else(|| unknown_request(what, request_id))?;
        if sub.state != SubscriptionState::Pending {
            return Err(MoqError::Field(format!(
                "{what}: request {request_id} is not pending"
            )));
        }
        Ok(sub)
    }
}

fn unknown_request(what: &str, request_id: u64) -> MoqError {
    MoqError::Field(format!("{what}: unknown request {request_id}"))
}
