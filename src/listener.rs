//! Handles to remote change listeners.
//!
//! A listener is registered by its stringified reference, which is also what the recovery file
//! stores. A [`ListenerConnector`] turns such a reference back into a live [`ChangeListener`].
//! The default transport treats references as callback URLs and delivers notifications as JSON
//! `POST` requests.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use url::Url;

/// Failure to reach a listener.
///
/// Any delivery failure marks the listener as dead.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DeliveryError {
    #[snafu(display("invalid listener reference '{reference}'"))]
    InvalidReference {
        reference: String,
        source: url::ParseError,
    },
    #[snafu(display("unsupported scheme in listener reference '{reference}'"))]
    UnsupportedScheme { reference: String },
    #[snafu(display("HTTP request failed"))]
    HttpRequest { source: reqwest::Error },
    #[snafu(display("listener answered with status {status}"))]
    Status { status: u16 },
}

/// A remote object interested in changes to configuration records.
#[async_trait]
pub trait ChangeListener: fmt::Debug + Send + Sync + 'static {
    /// The stringified reference this listener can be reconnected from.
    fn reference(&self) -> String;

    /// Tells the listener that the record at `curl` changed.
    async fn object_changed(&self, curl: &str) -> Result<(), DeliveryError>;
}

/// Turns stringified references into listener handles.
pub trait ListenerConnector: fmt::Debug + Send + Sync + 'static {
    /// Connects to the listener behind `reference`.
    fn connect(&self, reference: &str) -> Result<Arc<dyn ChangeListener>, DeliveryError>;
}

/// Body of a change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeNotification {
    /// The changed curl.
    pub curl: String,
}

/// A listener reached through an HTTP callback URL.
#[derive(Debug, Clone)]
pub struct HttpChangeListener {
    http_client: reqwest::Client,
    url: Url,
}

impl HttpChangeListener {
    /// Creates a listener posting to `url`.
    pub fn new(http_client: reqwest::Client, url: Url) -> Self {
        Self { http_client, url }
    }
}

#[async_trait]
impl ChangeListener for HttpChangeListener {
    fn reference(&self) -> String {
        self.url.to_string()
    }

    async fn object_changed(&self, curl: &str) -> Result<(), DeliveryError> {
        let response = self
            .http_client
            .post(self.url.clone())
            .json(&ChangeNotification {
                curl: curl.to_string(),
            })
            .send()
            .await
            .context(HttpRequestSnafu)?;
        let status = response.status();
        snafu::ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16()
            }
        );
        Ok(())
    }
}

/// Connects callback URLs to [`HttpChangeListener`]s sharing one HTTP client.
#[derive(Debug, Clone, Default)]
pub struct HttpListenerConnector {
    http_client: reqwest::Client,
}

impl ListenerConnector for HttpListenerConnector {
    fn connect(&self, reference: &str) -> Result<Arc<dyn ChangeListener>, DeliveryError> {
        let url = Url::parse(reference).context(InvalidReferenceSnafu { reference })?;
        snafu::ensure!(
            matches!(url.scheme(), "http" | "https"),
            UnsupportedSchemeSnafu { reference }
        );
        Ok(Arc::new(HttpChangeListener::new(
            self.http_client.clone(),
            url,
        )))
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use parking_lot::Mutex;
    use testresult::TestResult;

    use super::*;

    async fn serve(router: Router) -> TestResult<(Url, tokio::task::JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Ok((Url::parse(&format!("http://{addr}/changed"))?, task))
    }

    #[tokio::test]
    async fn delivers_json_notifications() -> TestResult {
        let received = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route(
                "/changed",
                post(
                    |State(received): State<Arc<Mutex<Vec<String>>>>,
                     Json(body): Json<ChangeNotification>| async move {
                        received.lock().push(body.curl);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(received.clone());
        let (url, task) = serve(router).await?;

        let connector = HttpListenerConnector::default();
        let listener = connector.connect(url.as_str())?;
        assert_eq!(listener.reference(), url.to_string());
        listener.object_changed("MACI/Managers/Manager").await?;
        assert_eq!(*received.lock(), vec!["MACI/Managers/Manager"]);
        task.abort();
        Ok(())
    }

    #[tokio::test]
    async fn error_status_is_a_delivery_fault() -> TestResult {
        let router = Router::new().route("/changed", post(|| async { StatusCode::GONE }));
        let (url, task) = serve(router).await?;

        let listener = HttpListenerConnector::default().connect(url.as_str())?;
        let err = listener.object_changed("A").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status { status: 410, .. }));
        task.abort();
        Ok(())
    }

    #[test]
    fn rejects_bad_references() {
        let connector = HttpListenerConnector::default();
        assert!(matches!(
            connector.connect("not a url"),
            Err(DeliveryError::InvalidReference { .. })
        ));
        assert!(matches!(
            connector.connect("IOR:000000000000"),
            Err(DeliveryError::UnsupportedScheme { .. })
        ));
    }
}
