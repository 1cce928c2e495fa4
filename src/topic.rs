//!
//! Topic handles produced by resolution (subscribe side) or allocation (publish side).
//!
use crate::config::{TopicAttribute, TopicConfig};
use crate::context::Context;
use crate::error::{self, ClientError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Longest accepted topic name, in bytes.
pub const MAX_TOPIC_NAME_LEN: usize = 246;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publish,
    Subscribe,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publish => f.write_str("publish"),
            Role::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// A subject within a [`Context`], ready to be bound to exactly one
/// [`Source`](crate::source::Source) or [`Receiver`](crate::receiver::Receiver).
pub struct Topic {
    name: Arc<str>,
    role: Role,
    pub(crate) context_id: u64,
    pub(crate) config: TopicConfig,
    resolution: watch::Receiver<bool>,
}

impl Topic {
    /// Looks up a topic for subscribing.
    ///
    /// Returns immediately. Resolution completes in the background once a source for
    /// `name` is advertised in the context; a receiver may be bound right away and its
    /// deliveries begin when that happens.
    pub fn resolve(ctx: &Context, name: &str, attr: TopicAttribute) -> Result<Topic, ClientError> {
        error::track(Self::lookup(ctx, name, attr, Role::Subscribe))
    }

    /// Reserves a topic for publishing. Nothing waits on the network; subscribers
    /// still discover the source asynchronously.
    pub fn allocate(ctx: &Context, name: &str, attr: TopicAttribute) -> Result<Topic, ClientError> {
        error::track(Self::lookup(ctx, name, attr, Role::Publish))
    }

    fn lookup(ctx: &Context, name: &str, attr: TopicAttribute, role: Role) -> Result<Topic, ClientError> {
        validate_name(name)?;
        if attr.role() != role {
            return Err(ClientError::Resolution(format!(
                "{} topic `{}` needs a {} topic attribute",
                role,
                name,
                attr.role()
            )));
        }

        let shared = ctx.shared();
        shared
            .ensure_active()
            .map_err(|e| ClientError::Resolution(format!("topic `{}`: {}", name, e)))?;

        let config = attr.into_config()?;
        let resolution = shared.resolver.reserve(name);
        tracing::debug!(topic = name, %role, context = %shared.name, "topic ready");
        Ok(Topic {
            name: Arc::from(name),
            role,
            context_id: shared.id,
            config,
            resolution,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether at least one source for this topic has been seen in the context.
    pub fn is_resolved(&self) -> bool {
        *self.resolution.borrow()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("context_id", &self.context_id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), ClientError> {
    if name.is_empty() {
        return Err(ClientError::Resolution("topic name is empty".to_owned()));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(ClientError::Resolution(format!(
            "topic name is {} bytes long, limit is {}",
            name.len(),
            MAX_TOPIC_NAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(ClientError::Resolution("topic name contains NUL".to_owned()));
    }
    Ok(())
}
