//! Call Setup Coordinator
//!
//! Sequenziert den Verbindungsaufbau:
//! lokales Audio holen → Transport erzeugen → Offer/Answer erzeugen bzw.
//! übernehmen → auf `Connected` vom Transport warten → abbauen.
//!
//! Es gibt höchstens eine aktive Session pro Koordinator. Start, Accept und
//! Apply-Answer schließen sich gegenseitig aus; ein zweiter Aufruf während
//! eines laufenden Setups schlägt sofort mit `SetupInProgress` fehl.

use super::audio::{AudioError, CaptureHandle, CpalCapture, MediaCapture};
use super::transport::{
    PeerTransport, RemoteStream, TransportError, TransportEvent, TransportFactory,
    TransportObserver, TransportState, WebRtcTransportFactory,
};
use crate::config::CallConfig;
use crate::signaling::{CallRole, DescriptorError, DescriptorKind, SessionDescriptor};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Malformed session descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Role mismatch: {0}")]
    RoleMismatch(String),

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("Operation not allowed in state {0}")]
    InvalidState(ConnectionState),

    #[error("Another call setup is already in progress")]
    SetupInProgress,

    #[error("Call setup was cancelled")]
    Cancelled,
}

impl From<AudioError> for CallError {
    fn from(err: AudioError) -> Self {
        CallError::MediaAccessDenied(err.to_string())
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidSdp(msg) => CallError::MalformedDescriptor(msg),
            other => CallError::TransportFailed(other.to_string()),
        }
    }
}

impl From<DescriptorError> for CallError {
    fn from(err: DescriptorError) -> Self {
        match err {
            DescriptorError::Malformed(msg) => CallError::MalformedDescriptor(msg),
            DescriptorError::RoleMismatch(msg) => CallError::RoleMismatch(msg),
        }
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Aktueller Status des Verbindungsaufbaus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Noch kein Anruf
    Idle,
    /// Mikrofon und Transport werden geholt
    AwaitingLocalMedia,
    /// Caller wartet auf das eingefügte Answer
    AwaitingRemoteDescriptor,
    /// Descriptors ausgetauscht, ICE läuft
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Connected, Disconnected und Failed beenden das Warten
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AwaitingLocalMedia => "awaiting_local_media",
            ConnectionState::AwaitingRemoteDescriptor => "awaiting_remote_descriptor",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Events an den (einzigen) Beobachter des Koordinators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(ConnectionState),
    RemoteStream(RemoteStream),
    Error(CallError),
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ressourcen eines Anrufs, exklusiv im Besitz des Koordinators
struct CallSession {
    id: Uuid,
    role: CallRole,
    started_at: DateTime<Utc>,
    capture: Option<Box<dyn CaptureHandle>>,
    transport: Option<Arc<dyn PeerTransport>>,
    remote_stream: Option<RemoteStream>,
    local_descriptor: Option<SessionDescriptor>,
}

impl CallSession {
    fn new(role: CallRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            started_at: Utc::now(),
            capture: None,
            transport: None,
            remote_stream: None,
            local_descriptor: None,
        }
    }

    fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.remote_stream = None;
    }

    /// Gibt Mikrofon und Transport frei
    async fn release(mut self) {
        self.stop_capture();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.log_released();
    }

    /// Wie `release`, aber ohne zu warten (aus Transport-Callbacks heraus)
    fn release_detached(mut self) {
        self.stop_capture();
        if let Some(transport) = self.transport.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { transport.close().await });
                }
                Err(_) => tracing::warn!("No runtime available, transport not closed"),
            }
        }
        self.log_released();
    }

    fn log_released(&self) {
        let duration = Utc::now() - self.started_at;
        tracing::info!(
            "Session {} ({}) released after {}s",
            self.id,
            self.role,
            duration.num_seconds()
        );
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct Inner {
    state: ConnectionState,
    session: Option<CallSession>,
}

/// Zustand, den Koordinator und Transport-Observer gemeinsam nutzen
struct Shared {
    inner: Mutex<Inner>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
}

impl Shared {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Aktualisiert den State und sendet Event
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            tracing::info!("Call state: {} -> {}", inner.state, state);
            inner.state = state;
            self.emit(CallEvent::StateChanged(state));
        }
    }

    /// Legt eine neue Session an und gibt die vorherige zum Abbau zurück
    fn begin_session(&self, role: CallRole) -> (Uuid, Option<CallSession>) {
        let mut inner = self.inner.lock();
        let previous = inner.session.take();
        let session = CallSession::new(role);
        let id = session.id;
        inner.session = Some(session);
        self.set_state(&mut inner, ConnectionState::AwaitingLocalMedia);
        (id, previous)
    }

    fn attach_capture(&self, id: Uuid, mut capture: Box<dyn CaptureHandle>) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) if session.id == id => {
                session.capture = Some(capture);
                Ok(())
            }
            _ => {
                capture.stop();
                Err(CallError::Cancelled)
            }
        }
    }

    fn attach_transport(&self, id: Uuid, transport: Arc<dyn PeerTransport>) -> bool {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) if session.id == id => {
                session.transport = Some(transport);
                true
            }
            _ => false,
        }
    }

    /// Schließt einen Setup-Schritt ab. Der State wechselt nur, wenn der
    /// Transport ihn nicht schon weitergeschaltet hat.
    fn advance(
        &self,
        id: Uuid,
        from: ConnectionState,
        to: ConnectionState,
        local: Option<SessionDescriptor>,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        match inner.session.as_mut() {
            Some(session) if session.id == id => {
                if local.is_some() {
                    session.local_descriptor = local;
                }
            }
            _ => return Err(CallError::Cancelled),
        }
        if inner.state == from {
            self.set_state(&mut inner, to);
        }
        Ok(())
    }

    /// Ziel für ein Remote-Answer: nur Caller in `AwaitingRemoteDescriptor`
    fn answer_target(&self) -> Result<(Uuid, Arc<dyn PeerTransport>), CallError> {
        let inner = self.inner.lock();
        let session = inner.session.as_ref().ok_or(CallError::NoActiveCall)?;

        if session.role != CallRole::Caller {
            return Err(CallError::RoleMismatch(format!(
                "an answer can only be applied by the caller, this side is the {}",
                session.role
            )));
        }
        if inner.state != ConnectionState::AwaitingRemoteDescriptor {
            return Err(CallError::InvalidState(inner.state));
        }

        let transport = session
            .transport
            .clone()
            .ok_or(CallError::InvalidState(inner.state))?;
        Ok((session.id, transport))
    }

    /// Baut eine fehlgeschlagene Session ab und gibt den Fehler zurück
    async fn fail_session(&self, id: Uuid, error: CallError) -> CallError {
        let session = {
            let mut inner = self.inner.lock();
            if inner.session.as_ref().map(|s| s.id) != Some(id) {
                // Session wurde bereits beendet oder ersetzt
                return error;
            }
            let session = inner.session.take();
            self.set_state(&mut inner, ConnectionState::Failed);
            session
        };

        tracing::error!("Call setup failed: {}", error);
        self.emit(CallEvent::Error(error.clone()));

        if let Some(session) = session {
            session.release().await;
        }
        error
    }

    fn handle_transport_event(&self, id: Uuid, event: TransportEvent) {
        let mut inner = self.inner.lock();
        if inner.session.as_ref().map(|s| s.id) != Some(id) {
            tracing::debug!("Ignoring event from stale transport: {:?}", event);
            return;
        }

        match event {
            TransportEvent::StateChanged(state) => match state {
                TransportState::New | TransportState::Connecting => {}
                TransportState::Connected => {
                    self.set_state(&mut inner, ConnectionState::Connected);
                }
                TransportState::Disconnected | TransportState::Closed => {
                    self.set_state(&mut inner, ConnectionState::Disconnected);
                }
                TransportState::Failed => {
                    let session = inner.session.take();
                    self.set_state(&mut inner, ConnectionState::Failed);
                    drop(inner);

                    self.emit(CallEvent::Error(CallError::TransportFailed(
                        "peer connection failed".to_string(),
                    )));
                    if let Some(session) = session {
                        session.release_detached();
                    }
                }
            },
            TransportEvent::RemoteTrack(stream) => {
                tracing::info!("Remote stream {} ({})", stream.stream_id, stream.mime_type);
                if let Some(session) = inner.session.as_mut() {
                    session.remote_stream = Some(stream.clone());
                }
                self.emit(CallEvent::RemoteStream(stream));
            }
        }
    }
}

/// Observer, der an genau eine Session gebunden ist
struct SessionObserver {
    session_id: Uuid,
    shared: Weak<Shared>,
}

impl TransportObserver for SessionObserver {
    fn on_event(&self, event: TransportEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_transport_event(self.session_id, event);
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Koordiniert den Aufbau genau eines Anrufs mit manuellem Signaling
pub struct CallSetupCoordinator {
    config: CallConfig,
    capture: Arc<dyn MediaCapture>,
    transports: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    setup_lock: tokio::sync::Mutex<()>,
}

impl CallSetupCoordinator {
    /// Erstellt einen Koordinator und den Receiver für seine Events
    pub fn new(
        config: CallConfig,
        capture: Arc<dyn MediaCapture>,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config,
            capture,
            transports,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    session: None,
                }),
                event_tx,
            }),
            setup_lock: tokio::sync::Mutex::new(()),
        };

        (coordinator, event_rx)
    }

    /// Koordinator mit cpal-Mikrofon und webrtc-Transport
    pub fn with_webrtc(config: CallConfig) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        Self::new(
            config,
            Arc::new(CpalCapture),
            Arc::new(WebRtcTransportFactory),
        )
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Gibt den aktuellen Status zurück
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn role(&self) -> Option<CallRole> {
        self.shared.inner.lock().session.as_ref().map(|s| s.role)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.inner.lock().session.as_ref().map(|s| s.id)
    }

    pub fn has_active_session(&self) -> bool {
        self.shared.inner.lock().session.is_some()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.remote_stream.clone())
    }

    /// Zuletzt erzeugter lokaler Descriptor (Offer oder Answer)
    pub fn local_descriptor(&self) -> Option<SessionDescriptor> {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.local_descriptor.clone())
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Gibt das Offer zurück, das der Benutzer an den Peer schicken muss.
    pub async fn start_as_caller(&self) -> Result<SessionDescriptor, CallError> {
        let _setup = self
            .setup_lock
            .try_lock()
            .map_err(|_| CallError::SetupInProgress)?;

        tracing::info!("Starting call as caller");
        let id = self.begin(CallRole::Caller).await;

        match self.setup_caller(id).await {
            Ok(offer) => Ok(offer),
            Err(e) => Err(self.shared.fail_session(id, e).await),
        }
    }

    /// Akzeptiert ein eingefügtes Offer
    ///
    /// Gibt das Answer zurück, das an den Anrufer zurückgeschickt werden muss.
    pub async fn accept_as_callee(&self, remote_offer: &str) -> Result<SessionDescriptor, CallError> {
        let _setup = self
            .setup_lock
            .try_lock()
            .map_err(|_| CallError::SetupInProgress)?;

        // Parsen vor allem anderen, damit fehlerhafte Eingaben nichts verändern
        let offer = SessionDescriptor::parse(remote_offer, DescriptorKind::Offer)?;

        tracing::info!("Accepting call as callee");
        let id = self.begin(CallRole::Callee).await;

        match self.setup_callee(id, offer).await {
            Ok(answer) => Ok(answer),
            Err(e) => Err(self.shared.fail_session(id, e).await),
        }
    }

    /// Übernimmt das eingefügte Answer des Angerufenen
    pub async fn apply_remote_answer(&self, remote_answer: &str) -> Result<(), CallError> {
        let _setup = self
            .setup_lock
            .try_lock()
            .map_err(|_| CallError::SetupInProgress)?;

        let answer = SessionDescriptor::parse(remote_answer, DescriptorKind::Answer)?;
        let (id, transport) = self.shared.answer_target()?;

        match transport.apply_answer(answer.sdp).await {
            Ok(()) => {}
            // Unbrauchbare SDP: Session bleibt, der Benutzer kann erneut einfügen
            Err(TransportError::InvalidSdp(msg)) => {
                return Err(CallError::MalformedDescriptor(msg));
            }
            Err(e) => return Err(self.shared.fail_session(id, e.into()).await),
        }

        tracing::info!("Remote answer applied");
        self.shared.advance(
            id,
            ConnectionState::AwaitingRemoteDescriptor,
            ConnectionState::Negotiating,
            None,
        )
    }

    /// Beendet den aktuellen Anruf. Idempotent.
    pub async fn end_call(&self) {
        let session = {
            let mut inner = self.shared.inner.lock();
            let session = inner.session.take();
            self.shared.set_state(&mut inner, ConnectionState::Disconnected);
            session
        };

        if let Some(session) = session {
            tracing::info!("Ending call {}", session.id);
            session.release().await;
        }
    }

    /// Setzt Mute-Status
    pub fn set_muted(&self, muted: bool) {
        let inner = self.shared.inner.lock();
        if let Some(capture) = inner.session.as_ref().and_then(|s| s.capture.as_ref()) {
            capture.set_muted(muted);
        }
    }

    /// Gibt Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.capture.as_ref())
            .map(|c| c.is_muted())
            .unwrap_or(false)
    }

    /// Gibt Audio-Levels zurück (input, output)
    ///
    /// Ohne Wiedergabe ist der Output-Pegel immer 0.0.
    pub fn audio_levels(&self) -> (f32, f32) {
        (self.input_level(), 0.0)
    }

    /// Gibt den Mikrofon-Pegel zurück
    pub fn input_level(&self) -> f32 {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.capture.as_ref())
            .map(|c| c.input_level())
            .unwrap_or(0.0)
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Neue Session anlegen; eine vorherige wird zuerst abgebaut
    async fn begin(&self, role: CallRole) -> Uuid {
        let (id, previous) = self.shared.begin_session(role);
        if let Some(previous) = previous {
            tracing::info!("Tearing down previous session {}", previous.id);
            previous.release().await;
        }
        id
    }

    /// Mikrofon und Transport für die Session holen
    async fn prepare_session(&self, id: Uuid) -> Result<Arc<dyn PeerTransport>, CallError> {
        let capture = self.capture.acquire(&self.config.audio).await?;
        self.shared.attach_capture(id, capture)?;

        let observer: Arc<dyn TransportObserver> = Arc::new(SessionObserver {
            session_id: id,
            shared: Arc::downgrade(&self.shared),
        });
        let transport = self.transports.create(&self.config, observer).await?;

        if !self.shared.attach_transport(id, Arc::clone(&transport)) {
            transport.close().await;
            return Err(CallError::Cancelled);
        }
        Ok(transport)
    }

    async fn setup_caller(&self, id: Uuid) -> Result<SessionDescriptor, CallError> {
        let transport = self.prepare_session(id).await?;

        let offer = SessionDescriptor::offer(transport.create_offer().await?);

        self.shared.advance(
            id,
            ConnectionState::AwaitingLocalMedia,
            ConnectionState::AwaitingRemoteDescriptor,
            Some(offer.clone()),
        )?;
        Ok(offer)
    }

    async fn setup_callee(
        &self,
        id: Uuid,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, CallError> {
        let transport = self.prepare_session(id).await?;

        let answer = SessionDescriptor::answer(transport.accept_offer(offer.sdp).await?);

        self.shared.advance(
            id,
            ConnectionState::AwaitingLocalMedia,
            ConnectionState::Negotiating,
            Some(answer.clone()),
        )?;
        Ok(answer)
    }
}

impl Drop for CallSetupCoordinator {
    fn drop(&mut self) {
        let session = self.shared.inner.lock().session.take();
        if let Some(session) = session {
            session.release_detached();
        }
    }
}

impl fmt::Debug for CallSetupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSetupCoordinator")
            .field("state", &self.state())
            .field("role", &self.role())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConstraints;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeCapture {
        deny: bool,
        gate: Option<Arc<Notify>>,
        active: Arc<AtomicUsize>,
    }

    struct FakeHandle {
        active: Arc<AtomicUsize>,
        muted: AtomicBool,
        stopped: bool,
    }

    #[async_trait]
    impl MediaCapture for FakeCapture {
        async fn acquire(
            &self,
            _constraints: &AudioConstraints,
        ) -> Result<Box<dyn CaptureHandle>, AudioError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.deny {
                return Err(AudioError::StreamBuildError("permission denied".into()));
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                active: Arc::clone(&self.active),
                muted: AtomicBool::new(false),
                stopped: false,
            }))
        }
    }

    impl CaptureHandle for FakeHandle {
        fn set_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }

        fn is_muted(&self) -> bool {
            self.muted.load(Ordering::SeqCst)
        }

        fn input_level(&self) -> f32 {
            0.25
        }

        fn read_frame(&self) -> Option<Vec<f32>> {
            None
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct FakeTransportFactory {
        fail_offer: bool,
        observers: Mutex<Vec<Arc<dyn TransportObserver>>>,
        transports: Mutex<Vec<Arc<FakeTransport>>>,
    }

    struct FakeTransport {
        fail_offer: bool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl TransportFactory for FakeTransportFactory {
        async fn create(
            &self,
            _config: &CallConfig,
            observer: Arc<dyn TransportObserver>,
        ) -> Result<Arc<dyn PeerTransport>, TransportError> {
            let transport = Arc::new(FakeTransport {
                fail_offer: self.fail_offer,
                closed: AtomicBool::new(false),
            });
            self.observers.lock().push(observer);
            self.transports.lock().push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn create_offer(&self) -> Result<String, TransportError> {
            if self.fail_offer {
                return Err(TransportError::WebRTC("ice agent crashed".into()));
            }
            Ok("v=0 fake-offer".to_string())
        }

        async fn accept_offer(&self, offer_sdp: String) -> Result<String, TransportError> {
            if offer_sdp.contains("bad-sdp") {
                return Err(TransportError::InvalidSdp("unparsable".into()));
            }
            Ok(format!("v=0 answer-to {offer_sdp}"))
        }

        async fn apply_answer(&self, answer_sdp: String) -> Result<(), TransportError> {
            if answer_sdp.contains("bad-sdp") {
                return Err(TransportError::InvalidSdp("unparsable".into()));
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl FakeTransportFactory {
        fn observer(&self, index: usize) -> Arc<dyn TransportObserver> {
            Arc::clone(&self.observers.lock()[index])
        }

        fn transport(&self, index: usize) -> Arc<FakeTransport> {
            Arc::clone(&self.transports.lock()[index])
        }

        fn created(&self) -> usize {
            self.transports.lock().len()
        }
    }

    fn setup(
        capture: FakeCapture,
        factory: &Arc<FakeTransportFactory>,
    ) -> (CallSetupCoordinator, mpsc::UnboundedReceiver<CallEvent>) {
        CallSetupCoordinator::new(CallConfig::default(), Arc::new(capture), factory.clone())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn offer_text() -> String {
        SessionDescriptor::offer("v=0 remote-offer").to_json()
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_as_caller_produces_offer() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, mut events) = setup(FakeCapture::default(), &factory);

        let offer = coordinator.start_as_caller().await.unwrap();

        assert_eq!(offer.kind, DescriptorKind::Offer);
        assert_eq!(offer.role, CallRole::Caller);
        assert_eq!(offer.sdp, "v=0 fake-offer");
        assert_eq!(coordinator.state(), ConnectionState::AwaitingRemoteDescriptor);
        assert_eq!(coordinator.role(), Some(CallRole::Caller));
        assert_eq!(coordinator.local_descriptor(), Some(offer));
        assert_eq!(
            drain(&mut events),
            vec![
                CallEvent::StateChanged(ConnectionState::AwaitingLocalMedia),
                CallEvent::StateChanged(ConnectionState::AwaitingRemoteDescriptor),
            ]
        );
    }

    #[tokio::test]
    async fn test_accept_as_callee_produces_answer() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        let answer = coordinator.accept_as_callee(&offer_text()).await.unwrap();

        assert_eq!(answer.kind, DescriptorKind::Answer);
        assert_eq!(answer.role, CallRole::Callee);
        assert_eq!(answer.sdp, "v=0 answer-to v=0 remote-offer");
        assert_eq!(coordinator.state(), ConnectionState::Negotiating);
        assert_eq!(coordinator.role(), Some(CallRole::Callee));
    }

    #[tokio::test]
    async fn test_apply_answer_as_callee_is_role_mismatch() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        let answer = coordinator.accept_as_callee(&offer_text()).await.unwrap();
        let err = coordinator
            .apply_remote_answer(&answer.to_json())
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::RoleMismatch(_)));
        assert_eq!(coordinator.state(), ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_apply_answer_moves_caller_to_negotiating() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        coordinator.start_as_caller().await.unwrap();
        let answer = SessionDescriptor::answer("v=0 remote-answer").to_armored();
        coordinator.apply_remote_answer(&answer).await.unwrap();

        assert_eq!(coordinator.state(), ConnectionState::Negotiating);

        // Ein zweites Answer ist nicht mehr erlaubt
        let err = coordinator.apply_remote_answer(&answer).await.unwrap_err();
        assert_eq!(err, CallError::InvalidState(ConnectionState::Negotiating));
    }

    #[tokio::test]
    async fn test_apply_answer_without_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        let answer = SessionDescriptor::answer("v=0").to_json();
        let err = coordinator.apply_remote_answer(&answer).await.unwrap_err();

        assert_eq!(err, CallError::NoActiveCall);
        assert_eq!(coordinator.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_malformed_input_leaves_state_unchanged() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, mut events) = setup(FakeCapture::default(), &factory);

        coordinator.start_as_caller().await.unwrap();
        let session_id = coordinator.session_id();
        drain(&mut events);

        let err = coordinator.accept_as_callee("{ not json").await.unwrap_err();
        assert!(matches!(err, CallError::MalformedDescriptor(_)));

        let wrong_type = SessionDescriptor::offer("v=0").to_json();
        let err = coordinator.apply_remote_answer(&wrong_type).await.unwrap_err();
        assert!(matches!(err, CallError::MalformedDescriptor(_)));

        assert_eq!(coordinator.state(), ConnectionState::AwaitingRemoteDescriptor);
        assert_eq!(coordinator.session_id(), session_id);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_answer_sdp_keeps_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        coordinator.start_as_caller().await.unwrap();
        let bad = SessionDescriptor::answer("bad-sdp").to_json();
        let err = coordinator.apply_remote_answer(&bad).await.unwrap_err();

        assert!(matches!(err, CallError::MalformedDescriptor(_)));
        assert_eq!(coordinator.state(), ConnectionState::AwaitingRemoteDescriptor);
        assert!(!factory.transport(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let factory = Arc::new(FakeTransportFactory::default());
        let capture = FakeCapture::default();
        let active = Arc::clone(&capture.active);
        let (coordinator, _events) = setup(capture, &factory);

        coordinator.start_as_caller().await.unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 1);

        coordinator.end_call().await;
        coordinator.end_call().await;

        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(!coordinator.has_active_session());
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(factory.transport(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_end_call_without_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, mut events) = setup(FakeCapture::default(), &factory);

        coordinator.end_call().await;
        coordinator.end_call().await;

        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&mut events),
            vec![CallEvent::StateChanged(ConnectionState::Disconnected)]
        );
    }

    #[tokio::test]
    async fn test_media_denied_releases_everything() {
        let factory = Arc::new(FakeTransportFactory::default());
        let capture = FakeCapture {
            deny: true,
            ..Default::default()
        };
        let (coordinator, mut events) = setup(capture, &factory);

        let err = coordinator.start_as_caller().await.unwrap_err();

        assert!(matches!(err, CallError::MediaAccessDenied(_)));
        assert_eq!(coordinator.state(), ConnectionState::Failed);
        assert!(!coordinator.has_active_session());
        assert_eq!(factory.created(), 0);
        assert!(drain(&mut events).contains(&CallEvent::Error(err)));
    }

    #[tokio::test]
    async fn test_offer_failure_releases_capture_and_transport() {
        let factory = Arc::new(FakeTransportFactory {
            fail_offer: true,
            ..Default::default()
        });
        let capture = FakeCapture::default();
        let active = Arc::clone(&capture.active);
        let (coordinator, _events) = setup(capture, &factory);

        let err = coordinator.start_as_caller().await.unwrap_err();

        assert!(matches!(err, CallError::TransportFailed(_)));
        assert_eq!(coordinator.state(), ConnectionState::Failed);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(factory.transport(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_callee_invalid_offer_sdp_fails_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let capture = FakeCapture::default();
        let active = Arc::clone(&capture.active);
        let (coordinator, _events) = setup(capture, &factory);

        let offer = SessionDescriptor::offer("bad-sdp").to_json();
        let err = coordinator.accept_as_callee(&offer).await.unwrap_err();

        assert!(matches!(err, CallError::MalformedDescriptor(_)));
        assert_eq!(coordinator.state(), ConnectionState::Failed);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_states_map_to_connection_state() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        coordinator.accept_as_callee(&offer_text()).await.unwrap();
        let observer = factory.observer(0);

        observer.on_event(TransportEvent::StateChanged(TransportState::Connecting));
        assert_eq!(coordinator.state(), ConnectionState::Negotiating);

        observer.on_event(TransportEvent::StateChanged(TransportState::Connected));
        assert_eq!(coordinator.state(), ConnectionState::Connected);

        observer.on_event(TransportEvent::StateChanged(TransportState::Disconnected));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(coordinator.has_active_session());

        // Disconnected ist nicht endgültig
        observer.on_event(TransportEvent::StateChanged(TransportState::Connected));
        assert_eq!(coordinator.state(), ConnectionState::Connected);

        observer.on_event(TransportEvent::StateChanged(TransportState::Closed));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(coordinator.has_active_session());
        assert!(!factory.transport(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let capture = FakeCapture::default();
        let active = Arc::clone(&capture.active);
        let (coordinator, mut events) = setup(capture, &factory);

        coordinator.start_as_caller().await.unwrap();
        drain(&mut events);

        factory
            .observer(0)
            .on_event(TransportEvent::StateChanged(TransportState::Failed));
        settle().await;

        assert_eq!(coordinator.state(), ConnectionState::Failed);
        assert!(!coordinator.has_active_session());
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(factory.transport(0).closed.load(Ordering::SeqCst));

        let events = drain(&mut events);
        assert_eq!(events[0], CallEvent::StateChanged(ConnectionState::Failed));
        assert!(matches!(events[1], CallEvent::Error(CallError::TransportFailed(_))));
    }

    #[tokio::test]
    async fn test_remote_stream_is_tracked_and_cleared() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, mut events) = setup(FakeCapture::default(), &factory);

        coordinator.accept_as_callee(&offer_text()).await.unwrap();
        drain(&mut events);

        let stream = RemoteStream {
            stream_id: "peer".into(),
            track_id: "audio".into(),
            mime_type: "audio/opus".into(),
        };
        factory
            .observer(0)
            .on_event(TransportEvent::RemoteTrack(stream.clone()));

        assert_eq!(coordinator.remote_stream(), Some(stream.clone()));
        assert_eq!(drain(&mut events), vec![CallEvent::RemoteStream(stream)]);

        coordinator.end_call().await;
        assert_eq!(coordinator.remote_stream(), None);
    }

    #[tokio::test]
    async fn test_new_call_replaces_old_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let capture = FakeCapture::default();
        let active = Arc::clone(&capture.active);
        let (coordinator, _events) = setup(capture, &factory);

        coordinator.start_as_caller().await.unwrap();
        let first = coordinator.session_id();
        coordinator.accept_as_callee(&offer_text()).await.unwrap();

        assert_ne!(coordinator.session_id(), first);
        assert_eq!(coordinator.role(), Some(CallRole::Callee));
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(factory.transport(0).closed.load(Ordering::SeqCst));
        assert!(!factory.transport(1).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stale_transport_events_are_ignored() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        coordinator.start_as_caller().await.unwrap();
        coordinator.start_as_caller().await.unwrap();

        factory
            .observer(0)
            .on_event(TransportEvent::StateChanged(TransportState::Failed));
        settle().await;

        assert_eq!(coordinator.state(), ConnectionState::AwaitingRemoteDescriptor);
        assert!(coordinator.has_active_session());
        assert!(!factory.transport(1).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_setup_is_rejected() {
        let factory = Arc::new(FakeTransportFactory::default());
        let gate = Arc::new(Notify::new());
        let capture = FakeCapture {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let (coordinator, _events) = setup(capture, &factory);
        let coordinator = Arc::new(coordinator);

        let first = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.start_as_caller().await }
        });
        settle().await;
        assert_eq!(coordinator.state(), ConnectionState::AwaitingLocalMedia);

        let err = coordinator.accept_as_callee(&offer_text()).await.unwrap_err();
        assert_eq!(err, CallError::SetupInProgress);

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(coordinator.state(), ConnectionState::AwaitingRemoteDescriptor);
    }

    #[tokio::test]
    async fn test_end_call_during_setup_cancels() {
        let factory = Arc::new(FakeTransportFactory::default());
        let gate = Arc::new(Notify::new());
        let capture = FakeCapture {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let active = Arc::clone(&capture.active);
        let (coordinator, _events) = setup(capture, &factory);
        let coordinator = Arc::new(coordinator);

        let pending = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.start_as_caller().await }
        });
        settle().await;

        coordinator.end_call().await;
        gate.notify_one();

        assert_eq!(pending.await.unwrap().unwrap_err(), CallError::Cancelled);
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_mute_and_level_follow_capture() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        assert!(!coordinator.is_muted());
        assert_eq!(coordinator.input_level(), 0.0);

        coordinator.start_as_caller().await.unwrap();
        coordinator.set_muted(true);

        assert!(coordinator.is_muted());
        assert_eq!(coordinator.input_level(), 0.25);
    }

    #[tokio::test]
    async fn test_audio_levels_report_input_and_silent_output() {
        let factory = Arc::new(FakeTransportFactory::default());
        let (coordinator, _events) = setup(FakeCapture::default(), &factory);

        assert_eq!(coordinator.audio_levels(), (0.0, 0.0));

        coordinator.start_as_caller().await.unwrap();
        assert_eq!(coordinator.audio_levels(), (0.25, 0.0));

        coordinator.end_call().await;
        assert_eq!(coordinator.audio_levels(), (0.0, 0.0));
    }

    #[tokio::test]
    async fn test_drop_releases_active_session() {
        let factory = Arc::new(FakeTransportFactory::default());
        let capture = FakeCapture::default();
        let active = Arc::clone(&capture.active);
        let (coordinator, _events) = setup(capture, &factory);

        coordinator.start_as_caller().await.unwrap();
        drop(coordinator);
        settle().await;

        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(factory.transport(0).closed.load(Ordering::SeqCst));
    }
}
