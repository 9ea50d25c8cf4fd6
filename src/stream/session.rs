//! Lifecycle wrapper around a single streaming RPC call.
//!
//! `StreamingSession` owns one transport [`CallHandle`] and a background task
//! that turns the transport's [`TransportEvent`]s into typed
//! [`SessionEvent`]s for registered handlers. Writes, half-close, and cancel
//! never fail; transport failures surface only as a non-zero terminal
//! [`CallStatus`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stream::listener::{EventKind, ListenerRegistry};
use crate::stream::transport::{
    CallHandle, CallMetadata, CallStatus, MethodDescriptor, Transport, TransportEvent,
    STATUS_INTERNAL, STATUS_UNKNOWN,
};

/// Lifecycle state of a session.
///
/// | from                 | input           | to          |
/// |----------------------|-----------------|-------------|
/// | `Unstarted`          | write, start    | `Started`   |
/// | `Started`            | write           | `Started`   |
/// | `Unstarted/Started`  | terminal status | `Ended`     |
/// | `Unstarted/Started`  | cancel          | `Cancelled` |
/// | `Ended/Cancelled`    | anything        | unchanged   |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Opened; the transport call has not been started yet.
    Unstarted,
    /// The transport call is running.
    Started,
    /// The transport reported a terminal status.
    Ended,
    /// Cancelled locally; no further events are delivered.
    Cancelled,
}

impl SessionState {
    /// True for `Ended` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled)
    }
}

/// Payload delivered to session handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent<R> {
    /// One decoded inbound message.
    Data(R),
    /// Terminal status, first delivery.
    Status(CallStatus),
    /// Terminal status, second delivery.
    End(CallStatus),
}

impl<R> SessionEvent<R> {
    /// The registry slot this event is dispatched to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Status(_) => EventKind::Status,
            Self::End(_) => EventKind::End,
        }
    }

    /// Returns the terminal status for `Status` and `End` events.
    pub fn status(&self) -> Option<&CallStatus> {
        match self {
            Self::Status(status) | Self::End(status) => Some(status),
            Self::Data(_) => None,
        }
    }
}

struct CallCore {
    state: SessionState,
    handle: Option<Box<dyn CallHandle>>,
    metadata: CallMetadata,
    half_closed: bool,
    final_status: Option<CallStatus>,
    /// Releases the dispatcher once the call has started.
    start_signal: Option<oneshot::Sender<()>>,
}

impl CallCore {
    /// `Unstarted -> Started`: starts the transport call with the stored
    /// metadata. Runs at most once per session.
    fn lazy_start(&mut self, method: &MethodDescriptor) {
        if self.state != SessionState::Unstarted {
            return;
        }
        self.state = SessionState::Started;
        if let Some(handle) = self.handle.as_mut() {
            handle.start(&self.metadata);
        }
        if let Some(signal) = self.start_signal.take() {
            let _ = signal.send(());
        }
        debug!(
            event = "session_started",
            method = %method,
            metadata_entries = self.metadata.len()
        );
    }

    /// `Unstarted/Started -> Cancelled`. Returns false when already terminal.
    fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Cancelled;
        self.start_signal = None;
        if let Some(mut handle) = self.handle.take() {
            handle.abort();
        }
        true
    }

    /// `Unstarted/Started -> Ended`. Releases the transport handle.
    fn end(&mut self, abort_transport: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SessionState::Ended;
        if let Some(mut handle) = self.handle.take() {
            if abort_transport {
                handle.abort();
            }
        }
    }
}

/// One in-flight streaming RPC call.
///
/// `Req` is encoded and `Resp` decoded with the external prost codec.
pub struct StreamingSession<Req, Resp> {
    method: MethodDescriptor,
    endpoint: String,
    core: Arc<Mutex<CallCore>>,
    listeners: ListenerRegistry<SessionEvent<Resp>>,
    dispatcher: JoinHandle<()>,
    _request: PhantomData<fn(&Req)>,
}

impl<Req, Resp> StreamingSession<Req, Resp>
where
    Req: prost::Message,
    Resp: prost::Message + Default + 'static,
{
    /// Opens a call for `method` against `endpoint`.
    ///
    /// Bidirectional calls start immediately. Client-streaming calls defer
    /// the start to the first [`StreamingSession::write`] so `metadata` can
    /// still be adjusted through [`StreamingSession::insert_metadata`].
    ///
    /// Events are dispatched from a spawned task, so a bidirectional reply can
    /// arrive before handlers registered after this returns. Use
    /// [`StreamingSession::open_unstarted`] when every message must be seen.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        method: MethodDescriptor,
        endpoint: impl Into<String>,
        metadata: CallMetadata,
        transport: &dyn Transport,
    ) -> Self {
        let session = Self::open_unstarted(method, endpoint, metadata, transport);
        if method.is_bidirectional() {
            session.start();
        }
        session
    }

    /// Opens a call without starting it, whatever the method kind.
    ///
    /// The transport call starts on [`StreamingSession::start`] or the first
    /// write, so handlers registered before that observe every event.
    pub fn open_unstarted(
        method: MethodDescriptor,
        endpoint: impl Into<String>,
        metadata: CallMetadata,
        transport: &dyn Transport,
    ) -> Self {
        let endpoint = endpoint.into();
        let call = transport.open_call(&method, &endpoint);
        let (start_signal, started) = oneshot::channel();
        let core = Arc::new(Mutex::new(CallCore {
            state: SessionState::Unstarted,
            handle: Some(call.handle),
            metadata,
            half_closed: false,
            final_status: None,
            start_signal: Some(start_signal),
        }));
        let listeners = ListenerRegistry::new();

        let dispatcher = tokio::spawn(dispatch_events::<Resp>(
            method,
            Arc::clone(&core),
            listeners.clone(),
            started,
            call.events,
        ));

        Self {
            method,
            endpoint,
            core,
            listeners,
            dispatcher,
            _request: PhantomData,
        }
    }
}

impl<Req, Resp> StreamingSession<Req, Resp> {
    /// Method this session calls.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Endpoint the call was opened against.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock_core().state
    }

    /// Adds request metadata. Ignored once the call has started.
    pub fn insert_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        let mut core = self.lock_core();
        if core.state != SessionState::Unstarted {
            debug!(event = "metadata_ignored_after_start", method = %self.method);
            return self;
        }
        core.metadata.insert(key, value);
        self
    }

    /// Current request metadata.
    pub fn metadata(&self) -> CallMetadata {
        self.lock_core().metadata.clone()
    }

    /// Starts the call explicitly. No-op once started or terminal.
    pub fn start(&self) -> &Self {
        self.lock_core().lazy_start(&self.method);
        self
    }

    /// Sends one request message, starting the call on first use.
    ///
    /// Writes after [`StreamingSession::end`] or after the session became
    /// terminal are dropped.
    pub fn write(&self, message: &Req) -> &Self
    where
        Req: prost::Message,
    {
        let mut core = self.lock_core();
        if core.state.is_terminal() {
            debug!(event = "write_after_close", method = %self.method, state = ?core.state);
            return self;
        }
        if core.half_closed {
            debug!(event = "write_after_half_close", method = %self.method);
            return self;
        }
        core.lazy_start(&self.method);

        let encoded = Bytes::from(message.encode_to_vec());
        if let Some(handle) = core.handle.as_mut() {
            handle.send(encoded);
        }
        self
    }

    /// Signals that no more request messages follow.
    ///
    /// The session stays open until the transport reports the terminal
    /// status. Repeated calls reach the transport once. An unstarted call is
    /// started first so the server observes an empty request stream.
    pub fn end(&self) {
        let mut core = self.lock_core();
        if core.state.is_terminal() || core.half_closed {
            return;
        }
        core.lazy_start(&self.method);
        core.half_closed = true;
        if let Some(handle) = core.handle.as_mut() {
            handle.half_close();
        }
        debug!(event = "session_half_closed", method = %self.method);
    }

    /// Aborts the call. No handler runs after this returns.
    ///
    /// Safe in any state; a no-op once the session is terminal.
    pub fn cancel(&self) {
        self.listeners.clear();
        let cancelled = self.lock_core().cancel();
        if cancelled {
            self.dispatcher.abort();
            debug!(event = "session_cancelled", method = %self.method);
        }
    }

    /// Registers `handler` for `kind` and returns `self` for chaining.
    ///
    /// [`EventKind::Data`] only fires for bidirectional methods.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> &Self
    where
        F: Fn(&SessionEvent<Resp>) + Send + Sync + 'static,
    {
        if kind == EventKind::Data && !self.method.is_bidirectional() {
            debug!(event = "data_listener_on_client_streaming", method = %self.method);
        }
        self.listeners.on(kind, handler);
        self
    }

    /// Registers a handler for each decoded inbound message.
    pub fn on_data<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Resp) + Send + Sync + 'static,
    {
        self.on(EventKind::Data, move |event| {
            if let SessionEvent::Data(message) = event {
                handler(message);
            }
        })
    }

    /// Registers a handler for the terminal status, run before end handlers.
    pub fn on_status<F>(&self, handler: F) -> &Self
    where
        F: Fn(&CallStatus) + Send + Sync + 'static,
    {
        self.on(EventKind::Status, move |event| {
            if let Some(status) = event.status() {
                handler(status);
            }
        })
    }

    /// Registers a handler for the terminal status, run after status handlers.
    pub fn on_end<F>(&self, handler: F) -> &Self
    where
        F: Fn(&CallStatus) + Send + Sync + 'static,
    {
        self.on(EventKind::End, move |event| {
            if let Some(status) = event.status() {
                handler(status);
            }
        })
    }

    /// Waits for the terminal status.
    ///
    /// Resolves to `None` when the session is cancelled first.
    pub async fn finished(&self) -> Option<CallStatus> {
        let rx = {
            let core = self.lock_core();
            match core.state {
                SessionState::Ended => return core.final_status.clone(),
                SessionState::Cancelled => return None,
                SessionState::Unstarted | SessionState::Started => {}
            }
            let (tx, rx) = oneshot::channel();
            let tx = Mutex::new(Some(tx));
            self.listeners.on(EventKind::End, move |event| {
                let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let (Some(sender), Some(status)) = (sender, event.status()) {
                    let _ = sender.send(status.clone());
                }
            });
            rx
        };

        match rx.await {
            Ok(status) => Some(status),
            // Handler dropped by a clear: either cancelled, or the status was
            // dispatched before the handler got registered.
            Err(_) => {
                let core = self.lock_core();
                match core.state {
                    SessionState::Cancelled => None,
                    _ => core.final_status.clone(),
                }
            }
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, CallCore> {
        lock(&self.core)
    }
}

impl<Req, Resp> Drop for StreamingSession<Req, Resp> {
    fn drop(&mut self) {
        if lock(&self.core).cancel() {
            debug!(event = "session_dropped_while_open", method = %self.method);
        }
        self.listeners.clear();
        self.dispatcher.abort();
    }
}

impl<Req, Resp> fmt::Debug for StreamingSession<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("state", &lock(&self.core).state)
            .field("listeners", &self.listeners)
            .finish()
    }
}

fn lock(core: &Mutex<CallCore>) -> MutexGuard<'_, CallCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch_events<Resp>(
    method: MethodDescriptor,
    core: Arc<Mutex<CallCore>>,
    listeners: ListenerRegistry<SessionEvent<Resp>>,
    started: oneshot::Receiver<()>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) where
    Resp: prost::Message + Default,
{
    // Nothing is dispatched before the call starts; a cancelled or dropped
    // session never releases the signal.
    if started.await.is_err() {
        return;
    }
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(bytes) => {
                if !method.is_bidirectional() {
                    debug!(
                        event = "inbound_message_discarded",
                        method = %method,
                        bytes = bytes.len()
                    );
                    continue;
                }
                match Resp::decode(bytes) {
                    Ok(message) => {
                        if lock(&core).state.is_terminal() {
                            return;
                        }
                        listeners.dispatch(EventKind::Data, &SessionEvent::Data(message));
                    }
                    Err(err) => {
                        warn!(event = "inbound_message_decode_failed", method = %method, error = %err);
                        let status = CallStatus::new(
                            STATUS_INTERNAL,
                            format!("failed to decode response message: {err}"),
                        );
                        finish(&method, &core, &listeners, status, true);
                        return;
                    }
                }
            }
            TransportEvent::Status(status) => {
                finish(&method, &core, &listeners, status, false);
                return;
            }
        }
    }

    let status = CallStatus::new(STATUS_UNKNOWN, "transport closed without status");
    finish(&method, &core, &listeners, status, false);
}

/// Delivers the terminal status pair, then moves the session to `Ended`.
fn finish<Resp>(
    method: &MethodDescriptor,
    core: &Mutex<CallCore>,
    listeners: &ListenerRegistry<SessionEvent<Resp>>,
    status: CallStatus,
    abort_transport: bool,
) {
    {
        let mut core = lock(core);
        if core.state.is_terminal() {
            return;
        }
        core.final_status = Some(status.clone());
    }
    debug!(
        event = "session_status",
        method = %method,
        code = status.code,
        details = %status.details
    );

    listeners.dispatch(EventKind::Status, &SessionEvent::Status(status.clone()));
    listeners.dispatch(EventKind::End, &SessionEvent::End(status));

    lock(core).end(abort_transport);
    listeners.clear();
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::{SessionState, StreamingSession};
    use crate::stream::listener::EventKind;
    use crate::stream::transport::{
        CallHandle, CallMetadata, CallStatus, MethodDescriptor, MethodKind, OpenCall, Transport,
        TransportEvent, STATUS_INTERNAL, STATUS_UNKNOWN,
    };

    const UPLOAD: MethodDescriptor =
        MethodDescriptor::new("test.Service", "Upload", MethodKind::ClientStreaming);
    const CHAT: MethodDescriptor =
        MethodDescriptor::new("test.Service", "Chat", MethodKind::Bidirectional);

    #[derive(Clone, PartialEq, prost::Message)]
    struct Note {
        #[prost(string, tag = "1")]
        text: String,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Op {
        Start(Option<String>),
        Send(Bytes),
        HalfClose,
        Abort,
    }

    #[derive(Default)]
    struct LoopbackTransport {
        ops: Arc<Mutex<Vec<Op>>>,
        events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    struct LoopbackHandle {
        ops: Arc<Mutex<Vec<Op>>>,
    }

    impl CallHandle for LoopbackHandle {
        fn start(&mut self, metadata: &CallMetadata) {
            let key = metadata.get("key").map(str::to_string);
            self.ops.lock().unwrap().push(Op::Start(key));
        }
        fn send(&mut self, message: Bytes) {
            self.ops.lock().unwrap().push(Op::Send(message));
        }
        fn half_close(&mut self) {
            self.ops.lock().unwrap().push(Op::HalfClose);
        }
        fn abort(&mut self) {
            self.ops.lock().unwrap().push(Op::Abort);
        }
    }

    impl Transport for LoopbackTransport {
        fn open_call(&self, _method: &MethodDescriptor, _endpoint: &str) -> OpenCall {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.lock().unwrap() = Some(tx);
            OpenCall {
                handle: Box::new(LoopbackHandle {
                    ops: Arc::clone(&self.ops),
                }),
                events: rx,
            }
        }
    }

    impl LoopbackTransport {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn emit(&self, event: TransportEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn close(&self) {
            self.events.lock().unwrap().take();
        }
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
        }
    }

    fn encoded(text: &str) -> Bytes {
        Bytes::from(prost::Message::encode_to_vec(&note(text)))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn client_streaming_start_is_deferred_to_first_write() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(UPLOAD, "local", CallMetadata::new(), &transport);
        assert_eq!(session.state(), SessionState::Unstarted);
        assert!(transport.ops().is_empty());

        session.insert_metadata("key", "late");
        session.write(&note("a")).write(&note("b"));
        session.insert_metadata("key", "ignored");

        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(
            transport.ops(),
            vec![
                Op::Start(Some("late".to_string())),
                Op::Send(encoded("a")),
                Op::Send(encoded("b")),
            ]
        );
    }

    #[tokio::test]
    async fn bidirectional_calls_start_at_construction() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(CHAT, "local", CallMetadata::new(), &transport);
        assert_eq!(session.state(), SessionState::Started);
        session.write(&note("x"));
        assert_eq!(transport.ops(), vec![Op::Start(None), Op::Send(encoded("x"))]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unstarted_bidirectional_session_keeps_replies_for_early_handlers() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open_unstarted(CHAT, "local", CallMetadata::new(), &transport);
        assert_eq!(session.state(), SessionState::Unstarted);
        assert!(transport.ops().is_empty());

        // Reply already queued before anything is registered or started.
        transport.emit(TransportEvent::Message(encoded("early")));
        transport.emit(TransportEvent::Status(CallStatus::ok()));
        settle().await;
        assert_eq!(session.state(), SessionState::Unstarted);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            session.on_data(move |message| seen.lock().unwrap().push(message.text.clone()));
        }
        session.start();

        assert_eq!(session.finished().await, Some(CallStatus::ok()));
        assert_eq!(transport.ops(), vec![Op::Start(None)]);
        assert_eq!(*seen.lock().unwrap(), vec!["early"]);
    }

    #[tokio::test]
    async fn end_reaches_transport_once_and_blocks_later_writes() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(UPLOAD, "local", CallMetadata::new(), &transport);
        session.write(&note("a"));
        session.end();
        session.end();
        session.write(&note("late"));

        assert_eq!(
            transport.ops(),
            vec![Op::Start(None), Op::Send(encoded("a")), Op::HalfClose]
        );
        assert_eq!(session.state(), SessionState::Started);
    }

    #[tokio::test]
    async fn data_precedes_status_which_precedes_end() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(CHAT, "local", CallMetadata::new(), &transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let data = Arc::clone(&seen);
            let status = Arc::clone(&seen);
            let end = Arc::clone(&seen);
            session
                .on_data(move |message| data.lock().unwrap().push(format!("data:{}", message.text)))
                .on_end(move |s| end.lock().unwrap().push(format!("end:{}", s.code)))
                .on_status(move |s| status.lock().unwrap().push(format!("status:{}", s.code)));
        }

        transport.emit(TransportEvent::Message(encoded("one")));
        transport.emit(TransportEvent::Message(encoded("two")));
        transport.emit(TransportEvent::Status(CallStatus::new(5, "not found")));
        transport.emit(TransportEvent::Message(encoded("late")));
        transport.emit(TransportEvent::Status(CallStatus::ok()));

        let status = session.finished().await.expect("terminal status");
        settle().await;

        assert_eq!(status.code, 5);
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["data:one", "data:two", "status:5", "end:5"]
        );
    }

    #[tokio::test]
    async fn client_streaming_methods_never_dispatch_data() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(UPLOAD, "local", CallMetadata::new(), &transport);
        let data = Arc::new(Mutex::new(0));
        {
            let data = Arc::clone(&data);
            session.on(EventKind::Data, move |_| *data.lock().unwrap() += 1);
        }
        session.write(&note("a"));
        transport.emit(TransportEvent::Message(encoded("reply")));
        transport.emit(TransportEvent::Status(CallStatus::ok()));

        assert_eq!(session.finished().await, Some(CallStatus::ok()));
        assert_eq!(*data.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn undecodable_message_ends_call_with_internal_status() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(CHAT, "local", CallMetadata::new(), &transport);
        transport.emit(TransportEvent::Message(Bytes::from_static(&[0xff, 0xff, 0xff])));

        let status = session.finished().await.expect("terminal status");
        assert_eq!(status.code, STATUS_INTERNAL);
        assert_eq!(transport.ops().last(), Some(&Op::Abort));
    }

    #[tokio::test]
    async fn closed_transport_without_status_reports_unknown() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(CHAT, "local", CallMetadata::new(), &transport);
        transport.close();

        let status = session.finished().await.expect("terminal status");
        assert_eq!(status.code, STATUS_UNKNOWN);
    }

    #[tokio::test]
    async fn cancel_before_any_write_silences_everything() {
        let transport = LoopbackTransport::default();
        let session: StreamingSession<Note, Note> =
            StreamingSession::open(UPLOAD, "local", CallMetadata::new(), &transport);
        let events = Arc::new(Mutex::new(0));
        for kind in [EventKind::Data, EventKind::Status, EventKind::End] {
            let events = Arc::clone(&events);
            session.on(kind, move |_| *events.lock().unwrap() += 1);
        }

        session.cancel();
        session.write(&note("after"));
        session.end();
        session.cancel();
        transport.emit(TransportEvent::Status(CallStatus::ok()));
        settle().await;

        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(*events.lock().unwrap(), 0);
        assert_eq!(transport.ops(), vec![Op::Abort]);
        assert_eq!(session.finished().await, None);
    }

    #[tokio::test]
    async fn cancel_from_status_handler_skips_end_handlers() {
        let transport = LoopbackTransport::default();
        let session: Arc<StreamingSession<Note, Note>> = Arc::new(StreamingSession::open(
            CHAT,
            "local",
            CallMetadata::new(),
            &transport,
        ));
        let ends = Arc::new(Mutex::new(0));
        {
            let handle = Arc::clone(&session);
            let ends = Arc::clone(&ends);
            session
                .on_status(move |_| handle.cancel())
                .on_end(move |_| *ends.lock().unwrap() += 1);
        }

        transport.emit(TransportEvent::Status(CallStatus::ok()));
        settle().await;

        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(*ends.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn dropping_an_open_session_aborts_the_call() {
        let transport = LoopbackTransport::default();
        {
            let session: StreamingSession<Note, Note> =
                StreamingSession::open(CHAT, "local", CallMetadata::new(), &transport);
            session.write(&note("a"));
        }
        assert_eq!(transport.ops().last(), Some(&Op::Abort));
    }
}
