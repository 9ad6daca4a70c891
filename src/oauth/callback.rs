//! Ephemeral loopback HTTP listener for OAuth redirects.
//!
//! Binds `127.0.0.1` (ephemeral port unless a fixed one is requested), serves
//! exactly one `GET <path>?code=..&state=..` and then shuts down. The listener
//! also shuts down on [`OAuthCallbackServer::stop`], on drop, and after its
//! timeout, so an abandoned flow never holds a port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AuthError, ProtocolError, Result};

/// How long `stop()` waits for in-flight connections before aborting the server
const STOP_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_PAGE: &str = "<html><body><h3>Authorization complete.</h3><p>You can close this window and return to Reins.</p></body></html>";
const DENIED_PAGE: &str = "<html><body><h3>Authorization was not granted.</h3><p>Return to Reins to try again.</p></body></html>";
const MISSING_CODE_PAGE: &str = "<html><body><h3>Missing authorization code.</h3></body></html>";
const ALREADY_HANDLED_PAGE: &str = "<html><body><h3>This sign-in link was already used.</h3></body></html>";

/// Listener settings
#[derive(Clone, Debug)]
pub struct CallbackServerOptions {
    /// Must be a loopback address
    pub host: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub path: String,
    /// Upper bound on both the wait and the listener lifetime
    pub timeout: Duration,
}

impl Default for CallbackServerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            path: "/callback".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Raw redirect query parameters
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Validated callback result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

struct ListenerState {
    sender: Mutex<Option<oneshot::Sender<CallbackQuery>>>,
    closed: watch::Sender<bool>,
}

/// Running loopback listener for one OAuth flow
pub struct OAuthCallbackServer {
    redirect_uri: String,
    local_addr: SocketAddr,
    timeout: Duration,
    deadline: Instant,
    state: Arc<ListenerState>,
    receiver: Mutex<Option<oneshot::Receiver<CallbackQuery>>>,
    finished: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OAuthCallbackServer {
    /// Binds the listener and starts serving in the background.
    pub async fn start(options: CallbackServerOptions) -> Result<Self> {
        if !options.host.is_loopback() {
            return Err(AuthError::validation(format!(
                "OAuth callback listener must bind a loopback address, got {}",
                options.host
            )));
        }

        let path = if options.path.starts_with('/') {
            options.path.clone()
        } else {
            format!("/{}", options.path)
        };

        let deadline = Instant::now().checked_add(options.timeout).ok_or_else(|| {
            AuthError::validation(format!(
                "OAuth callback timeout of {}s is out of range",
                options.timeout.as_secs()
            ))
        })?;

        let address = SocketAddr::new(options.host, options.port);
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ProtocolError::ListenerStart {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProtocolError::ListenerStart {
                address: address.to_string(),
                source,
            })?;

        let (sender, receiver) = oneshot::channel();
        let (closed, _) = watch::channel(false);
        let (finished_tx, finished) = watch::channel(false);

        let state = Arc::new(ListenerState {
            sender: Mutex::new(Some(sender)),
            closed,
        });

        let router = Router::new()
            .route(&path, get(handle_callback))
            .with_state(Arc::clone(&state));

        let timeout = options.timeout;
        let shutdown_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let mut closed_rx = shutdown_state.closed.subscribe();
            let shutdown = async move {
                tokio::select! {
                    _ = wait_until_set(&mut closed_rx) => {}
                    _ = tokio::time::sleep(timeout) => {
                        debug!("OAuth callback listener reached its timeout");
                        shutdown_state.closed.send_replace(true);
                    }
                }
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "OAuth callback listener exited with error");
            }

            finished_tx.send_replace(true);
        });

        let redirect_uri = format!("http://{}{}", local_addr, path);
        info!(redirect_uri = %redirect_uri, "OAuth callback listener started");

        Ok(Self {
            redirect_uri,
            local_addr,
            timeout,
            deadline,
            state,
            receiver: Mutex::new(Some(receiver)),
            finished,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.closed.borrow()
    }

    /// Waits for the redirect and validates it against `expected_state`.
    ///
    /// Only one caller may wait. Resolves with an error when the listener is
    /// stopped or times out first; the listener is stopped on every return.
    pub async fn wait_for_callback(&self, expected_state: &str) -> Result<CallbackParams> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or(ProtocolError::AlreadyAwaited)?;
        let mut closed_rx = self.state.closed.subscribe();

        enum Wake {
            Received(Option<CallbackQuery>),
            Closed,
        }

        let wake = tokio::select! {
            biased;
            result = &mut receiver => Wake::Received(result.ok()),
            _ = wait_until_set(&mut closed_rx) => Wake::Closed,
            _ = tokio::time::sleep_until(self.deadline) => Wake::Closed,
        };

        // The handler sends before flagging closed, so a late value is still queued
        let query = match wake {
            Wake::Received(query) => query,
            Wake::Closed => receiver.try_recv().ok(),
        };

        self.stop().await;

        let Some(query) = query else {
            if Instant::now() >= self.deadline {
                return Err(ProtocolError::CallbackTimeout {
                    seconds: self.timeout.as_secs(),
                }
                .into());
            }
            return Err(ProtocolError::Cancelled.into());
        };

        validate_callback(query, expected_state)
    }

    /// Stops the listener and waits until its port is released. Idempotent.
    pub async fn stop(&self) {
        let was_closed = self.state.closed.send_replace(true);
        let task = self.task.lock().await.take();

        let mut finished = self.finished.clone();
        let drained = tokio::time::timeout(STOP_GRACE, wait_until_set(&mut finished)).await;

        if drained.is_err() {
            if let Some(task) = task {
                warn!(redirect_uri = %self.redirect_uri, "OAuth callback listener did not drain, aborting");
                task.abort();
                let _ = task.await;
            }
        }

        if !was_closed {
            debug!(redirect_uri = %self.redirect_uri, "OAuth callback listener stopped");
        }
    }
}

impl Drop for OAuthCallbackServer {
    fn drop(&mut self) {
        // Server task exits on its own once flagged
        self.state.closed.send_replace(true);
    }
}

async fn handle_callback(
    State(state): State<Arc<ListenerState>>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, Html<&'static str>) {
    if query.code.is_none() && query.error.is_none() {
        return (StatusCode::BAD_REQUEST, Html(MISSING_CODE_PAGE));
    }

    let Some(sender) = state.sender.lock().await.take() else {
        return (StatusCode::GONE, Html(ALREADY_HANDLED_PAGE));
    };

    let denied = query.error.is_some();
    if sender.send(query).is_err() {
        debug!("OAuth callback arrived after the waiter went away");
    }
    state.closed.send_replace(true);

    if denied {
        (StatusCode::OK, Html(DENIED_PAGE))
    } else {
        (StatusCode::OK, Html(SUCCESS_PAGE))
    }
}

/// Checks a redirect against the state issued at initiate time.
pub(crate) fn validate_callback(query: CallbackQuery, expected_state: &str) -> Result<CallbackParams> {
    if let Some(error) = query.error {
        return Err(ProtocolError::ProviderDenied {
            error,
            description: query
                .error_description
                .unwrap_or_else(|| "no description".to_string()),
        }
        .into());
    }

    let state = query.state.ok_or(ProtocolError::MissingState)?;
    if state != expected_state {
        warn!("OAuth callback state mismatch");
        return Err(ProtocolError::StateMismatch {
            expected: expected_state.to_string(),
            received: state,
        }
        .into());
    }

    let code = query
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or(ProtocolError::MissingCode)?;

    Ok(CallbackParams { code, state })
}

async fn wait_until_set(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_options(timeout: Duration) -> CallbackServerOptions {
        CallbackServerOptions {
            timeout,
            ..CallbackServerOptions::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_callback_query_deserialization() {
        let query: CallbackQuery = serde_urlencoded::from_str("code=auth_code_123&state=csrf_456").unwrap();
        assert_eq!(query.code.as_deref(), Some("auth_code_123"));
        assert_eq!(query.state.as_deref(), Some("csrf_456"));
        assert!(query.error.is_none());

        let query: CallbackQuery =
            serde_urlencoded::from_str("error=access_denied&error_description=User+cancelled").unwrap();
        assert_eq!(query.error.as_deref(), Some("access_denied"));
        assert_eq!(query.error_description.as_deref(), Some("User cancelled"));
    }

    #[test]
    fn test_validate_callback_rules() {
        let ok = validate_callback(
            CallbackQuery {
                code: Some("xyz".into()),
                state: Some("abc".into()),
                ..Default::default()
            },
            "abc",
        )
        .unwrap();
        assert_eq!(ok.code, "xyz");

        let mismatch = validate_callback(
            CallbackQuery {
                code: Some("xyz".into()),
                state: Some("evil".into()),
                ..Default::default()
            },
            "abc",
        );
        assert!(matches!(
            mismatch,
            Err(AuthError::Protocol(ProtocolError::StateMismatch { .. }))
        ));

        let missing_state = validate_callback(
            CallbackQuery {
                code: Some("xyz".into()),
                ..Default::default()
            },
            "abc",
        );
        assert!(matches!(
            missing_state,
            Err(AuthError::Protocol(ProtocolError::MissingState))
        ));

        let empty_code = validate_callback(
            CallbackQuery {
                code: Some(" ".into()),
                state: Some("abc".into()),
                ..Default::default()
            },
            "abc",
        );
        assert!(matches!(
            empty_code,
            Err(AuthError::Protocol(ProtocolError::MissingCode))
        ));
    }

    #[tokio::test]
    async fn test_receives_callback_then_stops() {
        let server = OAuthCallbackServer::start(quick_options(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(server.redirect_uri().starts_with("http://127.0.0.1:"));
        assert!(server.redirect_uri().ends_with("/callback"));

        let url = format!("{}?code=xyz&state=abc", server.redirect_uri());
        let request = tokio::spawn(async move { reqwest::get(url).await.map(|r| r.status()) });

        let params = server.wait_for_callback("abc").await.unwrap();
        assert_eq!(
            params,
            CallbackParams {
                code: "xyz".to_string(),
                state: "abc".to_string()
            }
        );
        assert_eq!(request.await.unwrap().unwrap(), reqwest::StatusCode::OK);
        assert!(server.is_stopped());
    }

    #[tokio::test]
    async fn test_state_mismatch_is_hard_failure() {
        let server = OAuthCallbackServer::start(quick_options(Duration::from_secs(10)))
            .await
            .unwrap();

        let url = format!("{}?code=xyz&state=forged", server.redirect_uri());
        tokio::spawn(async move {
            let _ = reqwest::get(url).await;
        });

        let result = server.wait_for_callback("abc").await;
        assert!(matches!(
            result,
            Err(AuthError::Protocol(ProtocolError::StateMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_provider_error_redirect() {
        let server = OAuthCallbackServer::start(quick_options(Duration::from_secs(10)))
            .await
            .unwrap();

        let url = format!(
            "{}?error=access_denied&error_description=User+cancelled&state=abc",
            server.redirect_uri()
        );
        tokio::spawn(async move {
            let _ = reqwest::get(url).await;
        });

        let result = server.wait_for_callback("abc").await;
        assert!(matches!(
            result,
            Err(AuthError::Protocol(ProtocolError::ProviderDenied { .. }))
        ));
    }

    #[tokio::test]
    async fn test_request_without_code_is_not_consumed() {
        let server = OAuthCallbackServer::start(quick_options(Duration::from_secs(10)))
            .await
            .unwrap();

        let status = reqwest::get(server.redirect_uri()).await.unwrap().status();
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert!(!server.is_stopped());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_waiter() {
        let server = Arc::new(
            OAuthCallbackServer::start(quick_options(Duration::from_secs(30)))
                .await
                .unwrap(),
        );

        let waiter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.wait_for_callback("abc").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter hung after stop")
            .unwrap();
        assert!(matches!(
            result,
            Err(AuthError::Protocol(ProtocolError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_timeout_releases_wait() {
        let server = OAuthCallbackServer::start(quick_options(Duration::from_millis(200)))
            .await
            .unwrap();

        let result = server.wait_for_callback("abc").await;
        assert!(matches!(
            result,
            Err(AuthError::Protocol(ProtocolError::CallbackTimeout { .. }))
        ));
        assert!(server.is_stopped());
    }

    #[tokio::test]
    async fn test_second_wait_rejected() {
        let server = OAuthCallbackServer::start(quick_options(Duration::from_millis(100)))
            .await
            .unwrap();

        let _ = server.wait_for_callback("abc").await;
        let again = server.wait_for_callback("abc").await;
        assert!(matches!(
            again,
            Err(AuthError::Protocol(ProtocolError::AlreadyAwaited))
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_port() {
        let port = free_port();
        let options = CallbackServerOptions {
            port,
            ..quick_options(Duration::from_secs(30))
        };

        let first = OAuthCallbackServer::start(options.clone()).await.unwrap();
        assert_eq!(first.local_addr().port(), port);
        first.stop().await;
        first.stop().await;

        let second = OAuthCallbackServer::start(options).await.unwrap();
        assert_eq!(second.local_addr().port(), port);
        second.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_non_loopback_host() {
        let options = CallbackServerOptions {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..CallbackServerOptions::default()
        };
        let result = OAuthCallbackServer::start(options).await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_timeout() {
        let result = OAuthCallbackServer::start(quick_options(Duration::MAX)).await;
        assert!(matches!(result, Err(AuthError::Validation(_))));
    }
}
