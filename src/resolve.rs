//! Resolution of deferred connection values.
//!
//! Descriptors may carry [`Input::Deferred`] handles for values the
//! orchestrator has not produced yet. A [`Resolver`] turns handles into JSON
//! values; [`resolve_connection`] substitutes them into the wire form and
//! re-runs normal construction, so resolved values are type-checked and
//! defaulted exactly like literal input.

use crate::connection::{
    Connection, Deferred, Input, ProxyConnection, DEFAULT_DIAL_ERROR_LIMIT, DEFAULT_PER_DIAL_TIMEOUT,
    DEFAULT_PORT, DEFAULT_USER,
};
use crate::error::ConnectionError;
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Source of values for deferred handles.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, id: &str) -> anyhow::Result<Value>;
}

/// Map-backed resolver. Unknown ids are an error.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    values: HashMap<String, Value>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(id.into(), value.into());
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(id.into(), value.into());
    }
}

impl FromIterator<(String, Value)> for StaticResolver {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, id: &str) -> anyhow::Result<Value> {
        self.values
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no value registered for deferred `{}`", id))
    }
}

/// Endpoint settings with every value concrete and every default applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEndpoint {
    pub host: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
    pub port: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_socket_path: Option<String>,
    pub dial_error_limit: i64,
    pub per_dial_timeout: i64,
}

/// Serializes to the same camelCase shape as [`Connection`], with no
/// deferred handles left.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConnection {
    #[serde(flatten)]
    pub endpoint: ResolvedEndpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ResolvedEndpoint>,
}

impl ResolvedEndpoint {
    /// The port as a TCP port number. Fractional or out-of-range values fail.
    pub fn port_number(&self) -> Result<u16, ConnectionError> {
        let port = self.port;
        if port.fract() != 0.0 || !(1.0..=65535.0).contains(&port) {
            return Err(ConnectionError::InvalidPort(port));
        }
        Ok(port as u16)
    }

    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn socket_addr(&self) -> Result<String, ConnectionError> {
        Ok(format!("{}:{}", self.host, self.port_number()?))
    }
}

fn known<T: Clone>(field: &'static str, input: &Input<T>) -> Result<T, ConnectionError> {
    match input {
        Input::Value(v) => Ok(v.clone()),
        Input::Deferred(d) => Err(ConnectionError::Unresolved {
            field,
            id: d.id.clone(),
        }),
    }
}

fn known_opt<T: Clone>(
    field: &'static str,
    input: Option<&Input<T>>,
) -> Result<Option<T>, ConnectionError> {
    input.map(|i| known(field, i)).transpose()
}

impl ProxyConnection {
    /// Concrete settings, failing on the first deferred value.
    ///
    /// Defaulted fields cleared through a setter fall back to their defaults.
    pub fn resolved(&self) -> Result<ResolvedEndpoint, ConnectionError> {
        Ok(ResolvedEndpoint {
            host: known("host", self.host())?,
            user: known_opt("user", self.user())?.unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: known_opt("password", self.password())?,
            private_key: known_opt("privateKey", self.private_key())?,
            private_key_password: known_opt("privateKeyPassword", self.private_key_password())?,
            host_key: known_opt("hostKey", self.host_key())?,
            port: known_opt("port", self.port())?.unwrap_or(DEFAULT_PORT),
            agent_socket_path: known_opt("agentSocketPath", self.agent_socket_path())?,
            dial_error_limit: known_opt("dialErrorLimit", self.dial_error_limit())?
                .unwrap_or(DEFAULT_DIAL_ERROR_LIMIT),
            per_dial_timeout: known_opt("perDialTimeout", self.per_dial_timeout())?
                .unwrap_or(DEFAULT_PER_DIAL_TIMEOUT),
        })
    }
}

impl Connection {
    /// Concrete settings for the target and its bastion, failing on the
    /// first deferred value.
    pub fn resolved(&self) -> Result<ResolvedConnection, ConnectionError> {
        let proxy = match self.proxy() {
            None => None,
            Some(Input::Value(p)) => Some(p.resolved()?),
            Some(Input::Deferred(d)) => {
                return Err(ConnectionError::Unresolved {
                    field: "proxy",
                    id: d.id.clone(),
                })
            }
        };
        Ok(ResolvedConnection {
            endpoint: self.endpoint().resolved()?,
            proxy,
        })
    }
}

/// Resolve every deferred value in `conn`, including a deferred or partially
/// deferred bastion.
pub async fn resolve_connection<R>(
    conn: &Connection,
    resolver: &R,
) -> anyhow::Result<ResolvedConnection>
where
    R: Resolver + ?Sized,
{
    if conn.is_fully_known() {
        return Ok(conn.resolved()?);
    }

    let mut doc = into_object(conn.to_value()?)?;
    substitute(&mut doc, resolver).await?;
    if let Some(Value::Object(proxy)) = doc.get_mut("proxy") {
        substitute(proxy, resolver).await?;
    }

    let literal = Connection::from_value(Value::Object(doc))
        .context("resolved values do not form a valid connection")?;
    Ok(literal.resolved()?)
}

/// Resolve every deferred value in a standalone bastion descriptor.
pub async fn resolve_proxy_connection<R>(
    proxy: &ProxyConnection,
    resolver: &R,
) -> anyhow::Result<ResolvedEndpoint>
where
    R: Resolver + ?Sized,
{
    if proxy.is_fully_known() {
        return Ok(proxy.resolved()?);
    }

    let mut doc = into_object(proxy.to_value()?)?;
    substitute(&mut doc, resolver).await?;

    let literal = ProxyConnection::from_value(Value::Object(doc))
        .context("resolved values do not form a valid proxy connection")?;
    Ok(literal.resolved()?)
}

fn into_object(value: Value) -> anyhow::Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow::anyhow!("expected an object, got {}", other)),
    }
}

/// Replace top-level deferred entries of `map` with resolved values.
async fn substitute<R>(map: &mut Map<String, Value>, resolver: &R) -> anyhow::Result<()>
where
    R: Resolver + ?Sized,
{
    for (key, value) in map.iter_mut() {
        let Some(id) = Deferred::id_of(value).map(str::to_owned) else {
            continue;
        };
        log::debug!("Resolving `{}` from deferred {}", key, id);
        *value = resolver
            .resolve(&id)
            .await
            .with_context(|| format!("failed to resolve `{}` ({})", key, id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deferred_connection() -> Connection {
        Connection::from_value(json!({
            "host": {"deferred": "vm.ip"},
            "password": {"deferred": "vm.password"},
            "proxy": {"deferred": "bastion"},
        }))
        .unwrap()
    }

    #[test]
    fn test_resolved_literal() {
        let conn = Connection::new("10.1.2.3");
        let resolved = conn.resolved().unwrap();
        assert_eq!(resolved.endpoint.host, "10.1.2.3");
        assert_eq!(resolved.endpoint.user, "root");
        assert_eq!(resolved.endpoint.port, 22.0);
        assert_eq!(resolved.endpoint.dial_error_limit, 10);
        assert_eq!(resolved.endpoint.per_dial_timeout, 15);
        assert!(resolved.proxy.is_none());
    }

    #[test]
    fn test_resolved_rejects_deferred() {
        let err = deferred_connection().resolved().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Unresolved { field: "proxy", .. }
        ));

        let mut ep = ProxyConnection::new("h");
        ep.set_private_key(Some(Input::deferred("key")));
        let err = ep.resolved().unwrap_err();
        match err {
            ConnectionError::Unresolved { field, id } => {
                assert_eq!(field, "privateKey");
                assert_eq!(id, "key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cleared_default_falls_back() {
        let mut ep = ProxyConnection::new("h");
        ep.set_user(None);
        ep.set_port(None);
        let resolved = ep.resolved().unwrap();
        assert_eq!(resolved.user, "root");
        assert_eq!(resolved.port, 22.0);
    }

    #[test]
    fn test_socket_addr() {
        let mut resolved = ProxyConnection::new("db.internal").resolved().unwrap();
        assert_eq!(resolved.socket_addr().unwrap(), "db.internal:22");

        resolved.port = 2222.5;
        assert!(matches!(
            resolved.socket_addr(),
            Err(ConnectionError::InvalidPort(_))
        ));
        resolved.port = 0.0;
        assert!(resolved.port_number().is_err());
        resolved.port = 70000.0;
        assert!(resolved.port_number().is_err());
        resolved.port = 65535.0;
        assert_eq!(resolved.port_number().unwrap(), 65535);
    }

    #[tokio::test]
    async fn test_resolve_connection_with_deferred_proxy() {
        let resolver = StaticResolver::new()
            .with("vm.ip", "192.168.10.4")
            .with("vm.password", "s3cret")
            .with(
                "bastion",
                json!({"host": "bastion.example.com", "port": {"deferred": "bastion.port"}}),
            )
            .with("bastion.port", 2200);

        let resolved = resolve_connection(&deferred_connection(), &resolver)
            .await
            .unwrap();

        assert_eq!(resolved.endpoint.host, "192.168.10.4");
        assert_eq!(resolved.endpoint.password.as_deref(), Some("s3cret"));
        assert_eq!(resolved.endpoint.user, "root");

        let proxy = resolved.proxy.unwrap();
        assert_eq!(proxy.host, "bastion.example.com");
        assert_eq!(proxy.port, 2200.0);
        assert_eq!(proxy.dial_error_limit, 10);
    }

    #[tokio::test]
    async fn test_resolve_missing_id_fails() {
        let resolver = StaticResolver::new().with("vm.ip", "h");
        let err = resolve_connection(&deferred_connection(), &resolver)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("vm.password"));
    }

    #[tokio::test]
    async fn test_resolved_value_is_type_checked() {
        let mut ep = ProxyConnection::new("h");
        ep.set_dial_error_limit(Some(Input::deferred("limit")));
        let resolver = StaticResolver::new().with("limit", "lots");
        assert!(resolve_proxy_connection(&ep, &resolver).await.is_err());

        let resolver = StaticResolver::new().with("limit", -1);
        let resolved = resolve_proxy_connection(&ep, &resolver).await.unwrap();
        assert_eq!(resolved.dial_error_limit, -1);
    }

    #[tokio::test]
    async fn test_resolved_proxy_without_host_fails() {
        let resolver = StaticResolver::new()
            .with("vm.ip", "h")
            .with("vm.password", "p")
            .with("bastion", json!({"user": "jump"}));
        let err = resolve_connection(&deferred_connection(), &resolver)
            .await
            .unwrap_err();
        let cause = err.downcast_ref::<ConnectionError>().unwrap();
        assert!(matches!(
            cause,
            ConnectionError::MissingRequiredField { field: "proxy.host" }
        ));
    }

    #[tokio::test]
    async fn test_fully_known_skips_resolver() {
        let conn = Connection::new("h").with_proxy(ProxyConnection::new("b"));
        let resolved = resolve_connection(&conn, &StaticResolver::new()).await.unwrap();
        assert_eq!(resolved.proxy.unwrap().host, "b");
    }
}
