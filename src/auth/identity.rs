//! Resolution of the connecting principal's identity

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use warp::http::HeaderMap;

use crate::config::IdentitySource;
use crate::core::envelope::UserId;
use crate::error::{Result, SignalError};

/// The already-authenticated principal behind a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub username: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
            username: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// The parts of an upgrade request an identity resolver may look at
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl ConnectionRequest {
    pub fn new(query: HashMap<String, String>, headers: HeaderMap) -> Self {
        Self { query, headers }
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.query
            .get(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// Trait for identity collaborators, invoked once per connection before a session exists
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, request: &ConnectionRequest) -> Result<Identity>;

    /// Name for logging
    fn resolver_name(&self) -> &'static str;
}

pub type SharedIdentityResolver = Arc<dyn IdentityResolver>;

fn parse_user_id(raw: Option<String>, source: &str) -> Result<UserId> {
    let raw = raw.ok_or_else(|| SignalError::AuthError(format!("missing {}", source)))?;
    raw.parse::<UserId>()
        .map_err(|_| SignalError::AuthError(format!("invalid {}: '{}'", source, raw)))
}

/// Reads `user_id`, `display_name` and `username` from the query string
pub struct QueryIdentityResolver;

#[async_trait]
impl IdentityResolver for QueryIdentityResolver {
    async fn resolve(&self, request: &ConnectionRequest) -> Result<Identity> {
        let user_id = parse_user_id(request.query_param("user_id"), "user_id query parameter")?;
        Ok(Identity {
            user_id,
            display_name: request.query_param("display_name"),
            username: request.query_param("username"),
        })
    }

    fn resolver_name(&self) -> &'static str {
        "query"
    }
}

/// Reads `x-user-id`, `x-display-name` and `x-username` set by an authenticating proxy
pub struct HeaderIdentityResolver;

#[async_trait]
impl IdentityResolver for HeaderIdentityResolver {
    async fn resolve(&self, request: &ConnectionRequest) -> Result<Identity> {
        let user_id = parse_user_id(request.header("x-user-id"), "x-user-id header")?;
        Ok(Identity {
            user_id,
            display_name: request.header("x-display-name"),
            username: request.header("x-username"),
        })
    }

    fn resolver_name(&self) -> &'static str {
        "header"
    }
}

/// Resolver matching the configured identity source
pub fn resolver_for(source: IdentitySource) -> SharedIdentityResolver {
    match source {
        IdentitySource::Query => Arc::new(QueryIdentityResolver),
        IdentitySource::Header => Arc::new(HeaderIdentityResolver),
    }
}
