use url::Url;

use crate::config::SocketConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::packet::{ENGINE_QUERY, SOCKET_PATH};

const LOCAL_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Decides which server a chat surface connects to.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self) -> ChatResult<Url>;
}

/// A fixed endpoint.
impl EndpointResolver for Url {
    fn resolve(&self) -> ChatResult<Url> {
        Ok(self.clone())
    }
}

/// Maps the page origin to the API server for the current deployment.
///
/// Local origins talk to the dev server on `local_port`; everything else
/// goes to the production host with the origin's scheme.
#[derive(Debug, Clone)]
pub struct DeploymentResolver {
    pub origin: String,
    pub local_port: u16,
    pub production_host: String,
}

impl DeploymentResolver {
    pub fn new(
        origin: impl Into<String>,
        local_port: u16,
        production_host: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            local_port,
            production_host: production_host.into(),
        }
    }

    pub fn from_config(config: &SocketConfig) -> Self {
        Self::new(
            config.origin.clone(),
            config.local_port,
            config.production_host.clone(),
        )
    }
}

impl EndpointResolver for DeploymentResolver {
    fn resolve(&self) -> ChatResult<Url> {
        let origin = Url::parse(&self.origin)?;
        let host = origin
            .host_str()
            .ok_or_else(|| ChatError::InvalidEndpoint(format!("origin has no host: {}", origin)))?;

        let endpoint = if LOCAL_HOSTS.contains(&host) {
            format!("{}://localhost:{}", origin.scheme(), self.local_port)
        } else {
            format!("{}://{}", origin.scheme(), self.production_host)
        };
        Ok(Url::parse(&endpoint)?)
    }
}

/// Build the Engine.IO WebSocket URL for a resolved server endpoint.
pub fn socket_url(endpoint: &Url) -> ChatResult<Url> {
    let scheme = match endpoint.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    let host = endpoint
        .host_str()
        .ok_or_else(|| ChatError::InvalidEndpoint(format!("endpoint has no host: {}", endpoint)))?;
    let port = endpoint
        .port()
        .map(|port| format!(":{}", port))
        .unwrap_or_default();

    Ok(Url::parse(&format!(
        "{}://{}{}{}?{}",
        scheme, host, port, SOCKET_PATH, ENGINE_QUERY
    ))?)
}
