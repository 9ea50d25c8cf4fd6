//! Client facade for the `pb.Motoko` service.
//!
//! `MotokoClient` hands out one [`StreamingSession`] per RPC method and adds
//! upload helpers that stream a [`ChunkSource`] through a session and collect
//! the service's answer.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::stream::proto::{
    infer_request, predict_response, InferRequest, InferResponse, LearnRequest, LearnResponse,
    Metadata, PredictRequest, PredictResponse, INFER, LEARN, PREDICT, WEB_INFER, WEB_LEARN,
};
use crate::stream::session::StreamingSession;
use crate::stream::transport::{CallMetadata, CallStatus, MethodDescriptor, Transport};
use crate::upload::pump::{ChunkPump, PumpError, PumpReport, SessionSink, DEFAULT_CHUNK_SIZE};
use crate::upload::source::ChunkSource;

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "https://localhost:9000";

/// Defaults applied when the caller leaves a setting unset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    /// Endpoint used without [`MotokoClient::with_endpoint`].
    pub const ENDPOINT: &'static str = DEFAULT_ENDPOINT;
    /// Upload chunk size in bytes.
    pub const CHUNK_SIZE: NonZeroUsize = DEFAULT_CHUNK_SIZE;
    /// Tolerated share of unparsable values in a numeric column.
    pub const NUMERIC_ERROR_THRESHOLD: f32 = 0.05;
    /// Most distinct values a column may have and still be categorical.
    pub const N_MAX_CATEGORIES: i32 = 25;
}

/// Options captured when the client is built.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Upper bound for the data carried by one request message.
    pub chunk_size: NonZeroUsize,
    /// Metadata sent with every call. Per-call entries with the same key win.
    pub default_metadata: CallMetadata,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            chunk_size: ClientDefaults::CHUNK_SIZE,
            default_metadata: CallMetadata::default(),
        }
    }
}

/// Errors returned by the upload helpers.
///
/// The session constructors themselves never fail.
#[derive(Debug, Error)]
pub enum MotokoClientError {
    /// Reading the source failed; the call was cancelled.
    #[error("upload failed: {0}")]
    Upload(#[from] PumpError),

    /// The service ended the call with a non-zero status.
    #[error("call failed with status {code}: {details}")]
    Status { code: i32, details: String },

    /// A JSON document in the response could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The call succeeded without producing the expected response message.
    #[error("call ended without a response message")]
    MissingResponse,

    /// The session was cancelled before it finished.
    #[error("call was cancelled")]
    Cancelled,
}

/// Result of [`MotokoClient::learn_source`].
#[derive(Clone, Debug, PartialEq)]
pub struct LearnOutcome {
    /// Key addressing the trained model in later predictions.
    pub learn_key: String,
    /// Performance metrics.
    pub evaluation: Value,
    /// Decisions taken while learning.
    pub decisions: Value,
}

/// Result of [`MotokoClient::predict_source`].
#[derive(Clone, Debug, PartialEq)]
pub struct Predictions {
    /// One prediction per input row.
    pub predictions: Value,
    /// Decisions taken while predicting, eg omitted rows.
    pub decisions: Value,
}

/// Builds inference parameters from optional settings.
///
/// Unset values fall back to [`ClientDefaults`].
pub fn inference_parameters(
    numeric_error_threshold: Option<f32>,
    n_max_categories: Option<i32>,
) -> infer_request::Parameters {
    infer_request::Parameters {
        numeric_error_threshold: numeric_error_threshold
            .unwrap_or(ClientDefaults::NUMERIC_ERROR_THRESHOLD),
        n_max_categories: n_max_categories.unwrap_or(ClientDefaults::N_MAX_CATEGORIES),
    }
}

/// Entry point for Motoko calls.
#[derive(Clone)]
pub struct MotokoClient {
    transport: Arc<dyn Transport>,
    endpoint_override: Option<String>,
    options: ClientOptions,
}

impl MotokoClient {
    /// Creates a client for [`DEFAULT_ENDPOINT`] over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            endpoint_override: None,
            options: ClientOptions::default(),
        }
    }

    /// Sets an explicit endpoint. Trailing whitespace is ignored.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Replaces every option at once.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Endpoint used for new sessions.
    pub fn endpoint(&self) -> &str {
        self.endpoint_override
            .as_deref()
            .unwrap_or(ClientDefaults::ENDPOINT)
    }

    /// Options captured at construction.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// `Infer`: streaming request, single response. Starts on first write.
    pub fn infer(&self, metadata: CallMetadata) -> StreamingSession<InferRequest, InferResponse> {
        self.open(INFER, metadata)
    }

    /// `Learn`: streaming request, single response. Starts on first write.
    pub fn learn(&self, metadata: CallMetadata) -> StreamingSession<LearnRequest, LearnResponse> {
        self.open(LEARN, metadata)
    }

    /// `Predict`: bidirectional. Starts immediately.
    ///
    /// Replies can reach the session before handlers registered on the
    /// returned value; use [`MotokoClient::prepare`] to register first.
    pub fn predict(
        &self,
        metadata: CallMetadata,
    ) -> StreamingSession<PredictRequest, PredictResponse> {
        self.open(PREDICT, metadata)
    }

    /// `WebInfer`: bidirectional variant of `Infer`. Starts immediately; see
    /// [`MotokoClient::prepare`] to register handlers first.
    pub fn web_infer(
        &self,
        metadata: CallMetadata,
    ) -> StreamingSession<InferRequest, InferResponse> {
        self.open(WEB_INFER, metadata)
    }

    /// `WebLearn`: bidirectional variant of `Learn`. Starts immediately; see
    /// [`MotokoClient::prepare`] to register handlers first.
    pub fn web_learn(
        &self,
        metadata: CallMetadata,
    ) -> StreamingSession<LearnRequest, LearnResponse> {
        self.open(WEB_LEARN, metadata)
    }

    /// Opens a session for any `pb.Motoko` method without starting it.
    ///
    /// The call starts on [`StreamingSession::start`] or the first write, so
    /// handlers registered in between see every event. `Req` and `Resp` must
    /// be the message types of `method`.
    pub fn prepare<Req, Resp>(
        &self,
        method: MethodDescriptor,
        metadata: CallMetadata,
    ) -> StreamingSession<Req, Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default + 'static,
    {
        let metadata = metadata.merged_over(&self.options.default_metadata);
        StreamingSession::open_unstarted(method, self.endpoint(), metadata, self.transport.as_ref())
    }

    /// Infers dataset metadata from `source` (CSV bytes).
    pub async fn infer_source<S>(
        &self,
        metadata: CallMetadata,
        source: &mut S,
        parameters: infer_request::Parameters,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<Metadata, MotokoClientError>
    where
        S: ChunkSource + Send + ?Sized,
    {
        let session: StreamingSession<InferRequest, InferResponse> = self.prepare(WEB_INFER, metadata);
        let response = first_response(&session);

        session.start().write(&InferRequest::parameters(parameters));
        self.pump(&session, source, |bytes| InferRequest::data(bytes.to_vec()), on_progress)
            .await?;
        finish(&session).await?;

        take(&response)
            .and_then(|response| response.metadata)
            .ok_or(MotokoClientError::MissingResponse)
    }

    /// Trains a model on `source` described by `dataset`.
    pub async fn learn_source<S>(
        &self,
        metadata: CallMetadata,
        source: &mut S,
        dataset: Metadata,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<LearnOutcome, MotokoClientError>
    where
        S: ChunkSource + Send + ?Sized,
    {
        let session: StreamingSession<LearnRequest, LearnResponse> = self.prepare(WEB_LEARN, metadata);
        let response = first_response(&session);

        session.start().write(&LearnRequest::metadata(dataset));
        self.pump(&session, source, |bytes| LearnRequest::data(bytes.to_vec()), on_progress)
            .await?;
        finish(&session).await?;

        let response = take(&response).ok_or(MotokoClientError::MissingResponse)?;
        Ok(LearnOutcome {
            evaluation: serde_json::from_str(&response.evaluation)?,
            decisions: serde_json::from_str(&response.decisions)?,
            learn_key: response.learn_key,
        })
    }

    /// Predicts on `source` with the model behind `learn_key`.
    ///
    /// The service streams predictions and decisions as JSON fragments; they
    /// are concatenated in arrival order before parsing.
    pub async fn predict_source<S>(
        &self,
        metadata: CallMetadata,
        source: &mut S,
        learn_key: impl Into<String>,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<Predictions, MotokoClientError>
    where
        S: ChunkSource + Send + ?Sized,
    {
        let session = self.prepare(PREDICT, metadata);
        let fragments = Arc::new(Mutex::new((String::new(), String::new())));
        {
            let fragments = Arc::clone(&fragments);
            session.on_data(move |response: &PredictResponse| {
                let mut fragments = fragments.lock().unwrap_or_else(PoisonError::into_inner);
                match &response.value {
                    Some(predict_response::Value::Predictions(part)) => fragments.0.push_str(part),
                    Some(predict_response::Value::Decisions(part)) => fragments.1.push_str(part),
                    None => {}
                }
            });
        }

        session.start().write(&PredictRequest::learn_key(learn_key));
        self.pump(&session, source, |bytes| PredictRequest::data(bytes.to_vec()), on_progress)
            .await?;
        finish(&session).await?;

        let (predictions, decisions) = std::mem::take(
            &mut *fragments.lock().unwrap_or_else(PoisonError::into_inner),
        );
        Ok(Predictions {
            predictions: serde_json::from_str(&predictions)?,
            decisions: serde_json::from_str(&decisions)?,
        })
    }

    fn open<Req, Resp>(
        &self,
        method: MethodDescriptor,
        metadata: CallMetadata,
    ) -> StreamingSession<Req, Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default + 'static,
    {
        let session = self.prepare(method, metadata);
        if method.is_bidirectional() {
            session.start();
        }
        session
    }

    async fn pump<Req, Resp, S, F>(
        &self,
        session: &StreamingSession<Req, Resp>,
        source: &mut S,
        to_request: F,
        on_progress: impl FnMut(f64) + Send,
    ) -> Result<PumpReport, MotokoClientError>
    where
        Req: prost::Message,
        S: ChunkSource + Send + ?Sized,
        F: FnMut(Bytes) -> Req + Send,
    {
        let mut sink = SessionSink::new(session, to_request).with_progress(on_progress);
        match ChunkPump::new(self.options.chunk_size)
            .run(source, &mut sink)
            .await
        {
            Ok(report) if !report.completed => {
                debug!(
                    event = "upload_stopped_by_server",
                    method = %session.method(),
                    bytes = report.bytes,
                    state = ?session.state()
                );
                Ok(report)
            }
            Ok(report) => {
                debug!(
                    event = "upload_completed",
                    method = %session.method(),
                    bytes = report.bytes,
                    chunks = report.chunks
                );
                Ok(report)
            }
            Err(err) => {
                session.cancel();
                Err(MotokoClientError::Upload(err))
            }
        }
    }
}

impl fmt::Debug for MotokoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotokoClient")
            .field("endpoint", &self.endpoint())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Keeps the first inbound message of a bidirectional session.
fn first_response<Req, Resp>(session: &StreamingSession<Req, Resp>) -> Slot<Resp>
where
    Req: prost::Message,
    Resp: Clone + Send + 'static,
{
    let slot: Slot<Resp> = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&slot);
    session.on_data(move |response: &Resp| {
        let mut slot = writer.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(response.clone());
        }
    });
    slot
}

fn take<T>(slot: &Slot<T>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

async fn finish<Req, Resp>(session: &StreamingSession<Req, Resp>) -> Result<CallStatus, MotokoClientError>
where
    Req: prost::Message,
{
    let status = session.finished().await.ok_or(MotokoClientError::Cancelled)?;
    if !status.is_ok() {
        return Err(MotokoClientError::Status {
            code: status.code,
            details: status.details,
        });
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::{inference_parameters, ClientOptions, MotokoClient, DEFAULT_ENDPOINT};
    use crate::stream::proto::{LearnRequest, PredictRequest, PredictResponse, PREDICT};
    use crate::stream::session::{SessionState, StreamingSession};
    use crate::stream::transport::{
        CallHandle, CallMetadata, MethodDescriptor, OpenCall, Transport, TransportEvent,
    };
    use crate::upload::pump::SessionSink;

    /// Accepts everything and never answers.
    #[derive(Default)]
    struct NullTransport {
        open: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    }

    struct NullHandle;

    impl CallHandle for NullHandle {
        fn start(&mut self, _metadata: &CallMetadata) {}
        fn send(&mut self, _message: Bytes) {}
        fn half_close(&mut self) {}
        fn abort(&mut self) {}
    }

    impl Transport for NullTransport {
        fn open_call(&self, _method: &MethodDescriptor, _endpoint: &str) -> OpenCall {
            let (tx, events) = mpsc::unbounded_channel();
            self.open.lock().unwrap().push(tx);
            OpenCall {
                handle: Box::new(NullHandle),
                events,
            }
        }
    }

    fn client() -> MotokoClient {
        MotokoClient::new(Arc::new(NullTransport::default()))
    }

    #[test]
    fn client_uses_default_endpoint() {
        assert_eq!(client().endpoint(), DEFAULT_ENDPOINT);
    }

    #[test]
    fn endpoint_override_is_trimmed() {
        let client = client().with_endpoint("https://motoko.example:9000  \n");
        assert_eq!(client.endpoint(), "https://motoko.example:9000");
    }

    #[test]
    fn optional_inference_parameters_fall_back_to_defaults() {
        let parameters = inference_parameters(None, Some(10));
        assert_eq!(parameters.numeric_error_threshold, 0.05);
        assert_eq!(parameters.n_max_categories, 10);
    }

    #[tokio::test]
    async fn constructors_match_method_shapes() {
        let client = client()
            .with_endpoint("https://motoko.example")
            .with_options(ClientOptions {
                default_metadata: CallMetadata::new().with("email", "batou@sector9.jp"),
                ..ClientOptions::default()
            });

        let learn = client.learn(CallMetadata::new().with("api_key", "k"));
        assert_eq!(learn.method().method, "Learn");
        assert_eq!(learn.state(), SessionState::Unstarted);
        assert_eq!(learn.endpoint(), "https://motoko.example");
        assert_eq!(learn.metadata().get("email"), Some("batou@sector9.jp"));
        assert_eq!(learn.metadata().get("api_key"), Some("k"));

        let infer = client.infer(CallMetadata::new());
        assert_eq!(infer.state(), SessionState::Unstarted);

        for state in [
            client.predict(CallMetadata::new()).state(),
            client.web_infer(CallMetadata::new()).state(),
            client.web_learn(CallMetadata::new()).state(),
        ] {
            assert_eq!(state, SessionState::Started);
        }
    }

    #[tokio::test]
    async fn prepared_sessions_wait_for_an_explicit_start() {
        let client = client().with_options(ClientOptions {
            default_metadata: CallMetadata::new().with("email", "togusa@sector9.jp"),
            ..ClientOptions::default()
        });

        let session: StreamingSession<PredictRequest, PredictResponse> =
            client.prepare(PREDICT, CallMetadata::new());
        assert_eq!(session.state(), SessionState::Unstarted);
        assert_eq!(session.metadata().get("email"), Some("togusa@sector9.jp"));

        session.start();
        assert_eq!(session.state(), SessionState::Started);
    }

    #[tokio::test]
    async fn session_sink_debug_names_the_method() {
        let session = client().learn(CallMetadata::new());
        let sink = SessionSink::new(&session, |bytes: Bytes| LearnRequest::data(bytes.to_vec()));

        let rendered = format!("{sink:?}");
        assert!(rendered.starts_with("SessionSink"));
        assert!(rendered.contains("\"Learn\""));
    }
}
