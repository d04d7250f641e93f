//! Client for the conversion pod's HTTP control surface
//!
//! The pod only starts listening once the disks are converted, so a
//! refused connection means "not ready yet". After `/shutdown` the server
//! exits, and the connection may drop before a response arrives.

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use ferry_common::{Error, Result, Settings};

/// Path serving the converted guest's configuration
pub const CONFIG_PATH: &str = "/ovf";
/// Path asking the conversion server to exit
pub const SHUTDOWN_PATH: &str = "/shutdown";

/// Failure talking to the control surface
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Nothing listening yet
    #[error("connection refused by {endpoint}")]
    Refused {
        /// URL that was called
        endpoint: String,
    },

    /// Connection dropped before a complete response
    #[error("connection to {endpoint} closed")]
    Closed {
        /// URL that was called
        endpoint: String,
    },

    /// Server answered with a non-success status
    #[error("{endpoint} returned HTTP {status}")]
    Http {
        /// URL that was called
        endpoint: String,
        /// Status code
        status: u16,
    },

    /// Any other transport failure (timeout, DNS, TLS, ...)
    #[error("request to {endpoint} failed: {message}")]
    Transport {
        /// URL that was called
        endpoint: String,
        /// Description of what failed
        message: String,
    },
}

impl ControlError {
    /// The URL the failing request went to
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Refused { endpoint }
            | Self::Closed { endpoint }
            | Self::Http { endpoint, .. }
            | Self::Transport { endpoint, .. } => endpoint,
        }
    }
}

impl From<ControlError> for Error {
    fn from(e: ControlError) -> Self {
        Error::network(e.endpoint().to_string(), e.to_string())
    }
}

/// Operations on a conversion pod's control surface
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConversionControl: Send + Sync {
    /// Fetch the converted guest's configuration document
    async fn fetch_config(&self, address: &str) -> std::result::Result<String, ControlError>;

    /// Ask the conversion server to exit
    async fn shutdown(&self, address: &str) -> std::result::Result<(), ControlError>;
}

/// reqwest-backed [`ConversionControl`]
#[derive(Clone)]
pub struct HttpConversionControl {
    client: reqwest::Client,
    port: u16,
}

impl HttpConversionControl {
    /// Client with the connect and request timeouts from `settings`
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_timeouts(
            settings.conversion_port,
            settings.conversion_connect_timeout,
            settings.conversion_request_timeout,
        )
    }

    /// Client for `port` with explicit timeouts
    pub fn with_timeouts(port: u16, connect: Duration, request: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .build()
            .map_err(|e| Error::network("conversion-control", e.to_string()))?;
        Ok(Self { client, port })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{}:{}{}", address, self.port, path)
    }
}

#[async_trait]
impl ConversionControl for HttpConversionControl {
    async fn fetch_config(&self, address: &str) -> std::result::Result<String, ControlError> {
        let endpoint = self.url(address, CONFIG_PATH);
        let resp = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| classify(&endpoint, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ControlError::Http {
                endpoint,
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(|e| classify(&endpoint, &e))
    }

    async fn shutdown(&self, address: &str) -> std::result::Result<(), ControlError> {
        let endpoint = self.url(address, SHUTDOWN_PATH);
        let resp = self
            .client
            .post(&endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| classify(&endpoint, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ControlError::Http {
                endpoint,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Map a reqwest failure onto the control error classes by walking its
/// source chain
fn classify(endpoint: &str, err: &reqwest::Error) -> ControlError {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                ErrorKind::ConnectionRefused => {
                    return ControlError::Refused {
                        endpoint: endpoint.to_string(),
                    }
                }
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
                | ErrorKind::BrokenPipe => {
                    return ControlError::Closed {
                        endpoint: endpoint.to_string(),
                    }
                }
                _ => {}
            }
        }
        let text = e.to_string();
        if text.contains("connection closed") || text.contains("IncompleteMessage") {
            return ControlError::Closed {
                endpoint: endpoint.to_string(),
            };
        }
        source = e.source();
    }
    ControlError::Transport {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;
    use tokio::net::TcpListener;

    fn control(port: u16) -> HttpConversionControl {
        HttpConversionControl::with_timeouts(port, Duration::from_secs(2), Duration::from_secs(5))
            .unwrap()
    }

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_config_is_fetched_and_shutdown_acknowledged() {
        let router = Router::new()
            .route(CONFIG_PATH, get(|| async { "<domain><os firmware=\"efi\"/></domain>" }))
            .route(SHUTDOWN_PATH, post(|| async { "" }));
        let control = control(serve(router).await);

        let body = control.fetch_config("127.0.0.1").await.unwrap();
        assert!(body.contains("firmware"));
        control.shutdown("127.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn test_nothing_listening_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = control(port).fetch_config("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, ControlError::Refused { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_dropped_connection_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let err = control(port).shutdown("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, ControlError::Closed { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let router = Router::new().route(
            CONFIG_PATH,
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let err = control(serve(router).await)
            .fetch_config("127.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::Http {
                endpoint: err.endpoint().to_string(),
                status: 503
            }
        );
    }

    #[test]
    fn test_control_errors_become_network_errors() {
        let err: Error = ControlError::Refused {
            endpoint: "http://10.0.0.1:8080/ovf".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Network { ref endpoint, .. } if endpoint.contains("10.0.0.1")));
    }
}
