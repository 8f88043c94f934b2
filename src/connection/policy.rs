//! How a consumer should dial a resolved endpoint.
//!
//! Descriptors do not validate or interpret their values. These helpers turn
//! a [`ResolvedEndpoint`] into the dial budget, credential choice and host
//! key check a session layer needs.

use crate::error::ConnectionError;
use crate::resolve::ResolvedEndpoint;
use russh::keys::ssh_key::PublicKey;
use russh::keys::{decode_secret_key, PrivateKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

/// Retry budget for dialing one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
    /// `None` means a single attempt may take as long as it needs.
    pub per_dial_timeout: Option<Duration>,
}

impl DialPolicy {
    pub fn from_endpoint(endpoint: &ResolvedEndpoint) -> Self {
        let max_attempts = match endpoint.dial_error_limit {
            n if n < 0 => None,
            n => Some(u32::try_from(n).unwrap_or(u32::MAX).max(1)),
        };
        let per_dial_timeout = match endpoint.per_dial_timeout {
            n if n <= 0 => None,
            n => Some(Duration::from_secs(n as u64)),
        };
        Self {
            max_attempts,
            per_dial_timeout,
        }
    }

    /// Whether the 1-based `attempt` is still within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(max) => attempt <= max,
        }
    }
}

/// A way to authenticate against an endpoint.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    PrivateKey(Arc<PrivateKey>),
    Password(String),
    Agent(PathBuf),
}

impl AuthMethod {
    /// Every usable method in precedence order: private key, password, agent.
    ///
    /// `env_agent` is the fallback agent socket used when the endpoint does
    /// not name one.
    pub fn candidates(
        endpoint: &ResolvedEndpoint,
        env_agent: Option<&str>,
    ) -> Result<Vec<AuthMethod>, ConnectionError> {
        let mut methods = Vec::new();

        if let Some(key) = &endpoint.private_key {
            let key = decode_secret_key(key, endpoint.private_key_password.as_deref())
                .map_err(|e| ConnectionError::InvalidPrivateKey(e.to_string()))?;
            methods.push(AuthMethod::PrivateKey(Arc::new(key)));
        }

        if let Some(password) = &endpoint.password {
            methods.push(AuthMethod::Password(password.clone()));
        }

        let agent = endpoint
            .agent_socket_path
            .as_deref()
            .or(env_agent)
            .filter(|path| !path.is_empty());
        if let Some(path) = agent {
            methods.push(AuthMethod::Agent(PathBuf::from(path)));
        }

        Ok(methods)
    }

    /// The preferred method. Fails when the endpoint carries no credentials
    /// and no agent socket is known.
    pub fn select(
        endpoint: &ResolvedEndpoint,
        env_agent: Option<&str>,
    ) -> Result<AuthMethod, ConnectionError> {
        Self::candidates(endpoint, env_agent)?
            .into_iter()
            .next()
            .ok_or_else(|| ConnectionError::NoCredentials {
                user: endpoint.user.clone(),
                host: endpoint.host.clone(),
            })
    }

    /// [`select`](Self::select) with the agent fallback read from `SSH_AUTH_SOCK`.
    pub fn from_env(endpoint: &ResolvedEndpoint) -> Result<AuthMethod, ConnectionError> {
        let env_agent = std::env::var(AGENT_SOCKET_ENV).ok();
        Self::select(endpoint, env_agent.as_deref())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
            AuthMethod::Agent(_) => "agent",
        }
    }
}

/// Server identity check for one endpoint.
#[derive(Debug, Clone)]
pub enum HostKeyCheck {
    /// No expected key was configured; any server key is accepted.
    Ignore,
    Verify(PublicKey),
}

impl HostKeyCheck {
    /// Parses `host_key` in OpenSSH `authorized_keys` form
    /// (`<algorithm> <base64> [comment]`).
    pub fn from_endpoint(endpoint: &ResolvedEndpoint) -> Result<Self, ConnectionError> {
        match endpoint.host_key.as_deref().map(str::trim) {
            None | Some("") => Ok(HostKeyCheck::Ignore),
            Some(key) => PublicKey::from_openssh(key)
                .map(HostKeyCheck::Verify)
                .map_err(|e| ConnectionError::InvalidHostKey(e.to_string())),
        }
    }

    /// Comments are ignored; only the key material is compared.
    pub fn accepts(&self, server_key: &PublicKey) -> bool {
        match self {
            HostKeyCheck::Ignore => {
                log::warn!("Accepting server key without verification - no host key configured");
                true
            }
            HostKeyCheck::Verify(expected) => {
                let ok = expected.key_data() == server_key.key_data();
                if !ok {
                    log::warn!(
                        "Server key mismatch: expected {}, got {}",
                        expected.algorithm(),
                        server_key.algorithm()
                    );
                }
                ok
            }
        }
    }
}
