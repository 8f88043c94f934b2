//! Connection descriptors.
//!
//! A [`Connection`] describes how to reach a remote machine over SSH and may
//! carry one bastion hop as a [`ProxyConnection`]. Both are plain values built
//! from user configuration. Any field may hold an [`Input::Deferred`] handle
//! that an external orchestrator fills in later; this module only carries
//! such handles, see [`crate::resolve`] for turning them into values.

#[macro_use]
mod schema;
pub mod policy;

use crate::error::ConnectionError;
use serde::de::{self, DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PORT: f64 = 22.0;
pub const DEFAULT_DIAL_ERROR_LIMIT: i64 = 10;
pub const DEFAULT_PER_DIAL_TIMEOUT: i64 = 15;

/// A field value that is either known now or deferred to the orchestrator.
///
/// Literals are written as the bare value; deferred values as
/// `{"deferred": "<id>"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Input<T> {
    Deferred(Deferred),
    Value(T),
}

/// Opaque handle to a value resolved later by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Deferred {
    #[serde(rename = "deferred")]
    pub id: String,
}

impl Deferred {
    pub const WIRE_KEY: &'static str = "deferred";

    /// Returns the handle id if `value` is the wire form of a deferred value.
    pub fn id_of(value: &Value) -> Option<&str> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        map.get(Self::WIRE_KEY)?.as_str()
    }
}

impl<'de> Deserialize<'de> for Deferred {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DeferredVisitor;

        impl<'de> Visitor<'de> for DeferredVisitor {
            type Value = Deferred;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of the form {\"deferred\": \"<id>\"}")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Deferred, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut id = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key != Deferred::WIRE_KEY {
                        return Err(de::Error::unknown_field(&key, &[Deferred::WIRE_KEY]));
                    }
                    if id.is_some() {
                        return Err(de::Error::duplicate_field(Deferred::WIRE_KEY));
                    }
                    id = Some(map.next_value::<String>()?);
                }
                let id = id.ok_or_else(|| de::Error::missing_field(Deferred::WIRE_KEY))?;
                Ok(Deferred { id })
            }
        }

        deserializer.deserialize_map(DeferredVisitor)
    }
}

impl<T: DeserializeOwned> Input<T> {
    /// Reads one field value from its JSON form.
    ///
    /// An integral float is accepted where `T` wants an integer, so
    /// `"dialErrorLimit": 3.0` reads as `3`.
    pub fn from_json_value(value: Value) -> Result<Self, serde_json::Error> {
        if let Some(id) = Deferred::id_of(&value) {
            return Ok(Input::deferred(id));
        }
        match serde_json::from_value::<T>(value.clone()) {
            Ok(v) => Ok(Input::Value(v)),
            Err(e) => match integral(&value) {
                Some(n) => serde_json::from_value(Value::from(n))
                    .map(Input::Value)
                    .map_err(|_| e),
                None => Err(e),
            },
        }
    }
}

fn integral(value: &Value) -> Option<i64> {
    let n = value.as_f64()?;
    if value.is_f64() && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Input<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Input::from_json_value(value).map_err(de::Error::custom)
    }
}

/// Reads the value of the field named `wire` from `map`, prefixing any error
/// with the field name. `null` reads as unset.
pub(crate) fn field_value<'de, A, T>(map: &mut A, wire: &str) -> Result<Option<Input<T>>, A::Error>
where
    A: MapAccess<'de>,
    T: DeserializeOwned,
{
    let value: Value = map.next_value()?;
    if value.is_null() {
        return Ok(None);
    }
    Input::from_json_value(value)
        .map(Some)
        .map_err(|e| de::Error::custom(format_args!("`{}`: {}", wire, e)))
}

impl<T> Input<T> {
    pub fn deferred(id: impl Into<String>) -> Self {
        Input::Deferred(Deferred { id: id.into() })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Input::Value(v) => Some(v),
            Input::Deferred(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Input::Value(v) => Some(v),
            Input::Deferred(_) => None,
        }
    }

    pub fn deferred_id(&self) -> Option<&str> {
        match self {
            Input::Deferred(d) => Some(&d.id),
            Input::Value(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Input::Deferred(_))
    }
}

impl<T> From<T> for Input<T> {
    fn from(value: T) -> Self {
        Input::Value(value)
    }
}

impl From<&str> for Input<String> {
    fn from(value: &str) -> Self {
        Input::Value(value.to_string())
    }
}

/// One row of a descriptor's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Rust-side field name.
    pub name: &'static str,
    /// Name used in serialized documents.
    pub wire_name: &'static str,
    pub required: bool,
    /// Whether construction fills the field when it is omitted.
    pub has_default: bool,
}

endpoint_schema! {
    /// Settings for a bastion host. Has every field of [`Connection`]
    /// except `proxy`: a bastion cannot itself sit behind another bastion.
    pub struct ProxyConnection / ProxyConnectionArgs {
        /// SSH agent socket path. When unset the consumer falls back to
        /// `SSH_AUTH_SOCK`.
        agent_socket_path / set_agent_socket_path: String => "agentSocketPath",
        /// Max dial errors before giving up. `-1` means unlimited.
        dial_error_limit / set_dial_error_limit: i64 => "dialErrorLimit" = DEFAULT_DIAL_ERROR_LIMIT,
        /// Expected host key. When unset the server identity is not verified.
        host_key / set_host_key: String => "hostKey",
        password / set_password: String => "password",
        /// Seconds allowed per dial attempt. `0` means no timeout.
        per_dial_timeout / set_per_dial_timeout: i64 => "perDialTimeout" = DEFAULT_PER_DIAL_TIMEOUT,
        port / set_port: f64 => "port" = DEFAULT_PORT,
        /// Private key contents. Takes precedence over `password` when both are set.
        private_key / set_private_key: String => "privateKey",
        /// Passphrase for an encrypted private key.
        private_key_password / set_private_key_password: String => "privateKeyPassword",
        user / set_user: String => "user" = DEFAULT_USER.to_string(),
    }
}

/// Instructions for how to connect to a remote endpoint, optionally through
/// one bastion host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    #[serde(flatten)]
    endpoint: ProxyConnection,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<Input<ProxyConnection>>,
}

/// Raw construction input for a [`Connection`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectionArgs {
    #[serde(flatten)]
    pub endpoint: ProxyConnectionArgs,
    #[serde(default, deserialize_with = "proxy_field")]
    pub proxy: Option<Input<ProxyConnectionArgs>>,
}

fn proxy_field<'de, D>(deserializer: D) -> Result<Option<Input<ProxyConnectionArgs>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    Input::from_json_value(value)
        .map(Some)
        .map_err(|e| de::Error::custom(format_args!("`proxy`: {}", e)))
}

impl ConnectionArgs {
    pub fn with_host(host: impl Into<Input<String>>) -> Self {
        Self {
            endpoint: ProxyConnectionArgs::with_host(host),
            proxy: None,
        }
    }

    pub fn build(self) -> Result<Connection, ConnectionError> {
        let endpoint = self.endpoint.build()?;
        let proxy = match self.proxy {
            None => None,
            Some(Input::Deferred(d)) => Some(Input::Deferred(d)),
            Some(Input::Value(args)) => Some(Input::Value(args.build_at("proxy.host")?)),
        };
        Ok(Connection { endpoint, proxy })
    }
}

impl TryFrom<ConnectionArgs> for Connection {
    type Error = ConnectionError;

    fn try_from(args: ConnectionArgs) -> Result<Self, Self::Error> {
        args.build()
    }
}

impl<'de> Deserialize<'de> for Connection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        ConnectionArgs::deserialize(deserializer)?
            .build()
            .map_err(serde::de::Error::custom)
    }
}

impl Connection {
    /// A direct connection to `host` with every default applied.
    pub fn new(host: impl Into<Input<String>>) -> Self {
        Self::from_endpoint(ProxyConnection::new(host))
    }

    pub fn from_endpoint(endpoint: ProxyConnection) -> Self {
        Self {
            endpoint,
            proxy: None,
        }
    }

    /// The target's own settings, shared with [`ProxyConnection`].
    pub fn endpoint(&self) -> &ProxyConnection {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut ProxyConnection {
        &mut self.endpoint
    }

    /// The bastion hop, if any.
    pub fn proxy(&self) -> Option<&Input<ProxyConnection>> {
        self.proxy.as_ref()
    }

    pub fn set_proxy(&mut self, proxy: Option<Input<ProxyConnection>>) {
        self.proxy = proxy;
    }

    pub fn with_proxy(mut self, proxy: impl Into<Input<ProxyConnection>>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn is_fully_known(&self) -> bool {
        self.endpoint.is_fully_known()
            && match &self.proxy {
                None => true,
                Some(Input::Deferred(_)) => false,
                Some(Input::Value(p)) => p.is_fully_known(),
            }
    }

    pub fn from_json(json: &str) -> Result<Self, ConnectionError> {
        let args: ConnectionArgs = serde_json::from_str(json)?;
        args.build()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConnectionError> {
        let args: ConnectionArgs = serde_json::from_value(value)?;
        args.build()
    }

    pub fn to_json(&self) -> Result<String, ConnectionError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ConnectionError> {
        Ok(serde_json::to_value(self)?)
    }
}
