//! Call Session Controller
//!
//! Zustandsmaschine eines Anrufs: `Idle → Ringing → Accepting → Connected →
//! Ended → Idle`. Eingaben kommen vom SignalingClient (Ereignisse), vom
//! Benutzer (annehmen, ablehnen, auflegen), von Timern und von der
//! Media-Verbindung. Alle Eingaben laufen nacheinander durch `dispatch`;
//! jeder Ausstieg aus einem Anruf geht durch `end_call`.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::media::MediaSession;
use super::mic::MicRelay;
use super::playback::PlaybackScheduler;
use crate::config::Config;
use crate::host::{HostServices, Notice, Screen};
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent};
use crate::transport::{Connector, TransportError};

/// Grund im `reject_call` nach abgelaufenem Annehmen
const REASON_TIMEOUT: &str = "timeout";

/// Antwort an `answer_push_call`/`start_ai_call`, sobald die Media-Verbindung steht
type MediaDone = oneshot::Sender<Result<(), CallError>>;

/// Grund im `reject_call` für einen zweiten Anruf
const REASON_BUSY: &str = "busy";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("No user identity available")]
    NoIdentity,

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call ended before the media connection was open")]
    Cancelled,

    #[error("Not possible while call is {0:?}")]
    InvalidState(CallState),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media connection failed: {0}")]
    Media(#[from] TransportError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// Kein aktiver Anruf
    #[default]
    Idle,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Angenommen, warte auf `call_ready`/`call_accepted` bzw. die Media-Verbindung
    Accepting,
    /// Media-Verbindung offen
    Connected,
    /// Anruf beendet (geht sofort in Idle über)
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Lesbarer Zustand für UI und Tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<String>,
    pub peer: Option<String>,
    pub direction: Option<CallDirection>,
    pub incoming_ui_shown: bool,
    /// Media-Verbindung wird gerade aufgebaut
    pub media_pending: bool,
    pub media_url: Option<String>,
}

/// Events die vom Controller ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    Notice(Notice),
}

/// Alle Eingaben der Zustandsmaschine
#[derive(Debug)]
enum CallInput {
    IncomingCall { from: String, ws_url: Option<String> },
    Accept,
    Reject,
    Ready { by: String, ws_url: String },
    Rejected { by: String, reason: Option<String> },
    RingTimeout { call_id: String },
    AcceptTimeout { call_id: String },
    MediaOpened {
        call_id: String,
        peer: String,
        ws_url: String,
        result: Result<MediaSession, TransportError>,
    },
    MediaClosed { call_id: String },
    Hangup,
    AnswerPush { caller: String, done: MediaDone },
    StartAi { peer: String, done: MediaDone },
}

#[derive(Default)]
struct CallCore {
    call: CallSnapshot,
    media: Option<MediaSession>,
    ring_timer: Option<JoinHandle<()>>,
    accept_timer: Option<JoinHandle<()>>,
    media_connect: Option<JoinHandle<()>>,
    media_watch: Option<JoinHandle<()>>,
}

struct ControllerInner {
    config: Config,
    signaling: SignalingClient,
    media_connector: Arc<dyn Connector>,
    host: HostServices,
    core: Mutex<CallCore>,
    snapshot: RwLock<CallSnapshot>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Steuert genau einen Anruf zur Zeit
#[derive(Clone)]
pub struct CallSessionController {
    inner: Arc<ControllerInner>,
}

impl CallSessionController {
    pub fn new(
        config: &Config,
        signaling: SignalingClient,
        media_connector: Arc<dyn Connector>,
        host: HostServices,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(ControllerInner {
                config: config.clone(),
                signaling,
                media_connector,
                host,
                core: Mutex::new(CallCore::default()),
                snapshot: RwLock::new(CallSnapshot::default()),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot.read().clone()
    }

    pub fn state(&self) -> CallState {
        self.inner.snapshot.read().state
    }

    /// Verarbeitet Signaling-Events, bis der Client verschwindet
    pub fn spawn_signal_listener(
        &self,
        mut events: broadcast::Receiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = this.handle_signal(event).await {
                            tracing::warn!("Call signal handling failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} signaling events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Übersetzt ein Signaling-Event in eine Eingabe
    pub async fn handle_signal(&self, event: SignalingEvent) -> Result<(), CallError> {
        let input = match event {
            SignalingEvent::IncomingCall { from, ws_url } => CallInput::IncomingCall { from, ws_url },
            SignalingEvent::CallAccepted { by, ws_url } | SignalingEvent::CallReady { by, ws_url } => {
                CallInput::Ready { by, ws_url }
            }
            SignalingEvent::CallRejected { by, reason } => CallInput::Rejected { by, reason },
            SignalingEvent::Connected | SignalingEvent::Disconnected => return Ok(()),
        };
        self.dispatch(input).await
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        self.dispatch(CallInput::Accept).await
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn reject(&self) -> Result<(), CallError> {
        self.dispatch(CallInput::Reject).await
    }

    /// Legt auf (oder bricht den Aufbau ab)
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.dispatch(CallInput::Hangup).await
    }

    /// Annehmen aus der Push-Benachrichtigung: direkt zur Media-Verbindung
    ///
    /// Klingelt bereits ein Anruf (App im Hintergrund), wird dieser
    /// übernommen. Kehrt zurück, sobald die Verbindung steht oder der Anruf
    /// vorher endet.
    pub async fn answer_push_call(&self, caller: &str) -> Result<(), CallError> {
        let (done, outcome) = oneshot::channel();
        self.dispatch(CallInput::AnswerPush {
            caller: caller.to_string(),
            done,
        })
        .await?;
        outcome.await.unwrap_or(Err(CallError::Cancelled))
    }

    /// Startet ein Gespräch mit dem AI-Assistenten
    pub async fn start_ai_call(&self, peer: &str) -> Result<(), CallError> {
        let (done, outcome) = oneshot::channel();
        self.dispatch(CallInput::StartAi {
            peer: peer.to_string(),
            done,
        })
        .await?;
        outcome.await.unwrap_or(Err(CallError::Cancelled))
    }

    // ========================================================================
    // STATE MACHINE
    // ========================================================================

    /// Verarbeitet eine Eingabe unter dem Call-Lock
    ///
    /// Boxed, weil Timer- und Media-Tasks selbst wieder `dispatch` aufrufen.
    /// Kein Handler wartet hier auf das Netz; der Media-Aufbau läuft in
    /// einem eigenen Task und meldet sich mit `MediaOpened` zurück.
    fn dispatch(&self, input: CallInput) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            let mut core = self.inner.core.lock().await;
            tracing::debug!("Call input {:?} in state {:?}", input, core.call.state);

            let result = match input {
                CallInput::IncomingCall { from, ws_url } => {
                    self.on_incoming_call(&mut core, from, ws_url);
                    Ok(())
                }
                CallInput::Accept => self.on_accept(&mut core),
                CallInput::Reject => self.on_reject(&mut core),
                CallInput::Ready { by, ws_url } => {
                    self.on_ready(&mut core, by, ws_url);
                    Ok(())
                }
                CallInput::Rejected { by, reason } => {
                    self.on_rejected(&mut core, by, reason);
                    Ok(())
                }
                CallInput::RingTimeout { call_id } => {
                    self.on_ring_timeout(&mut core, call_id);
                    Ok(())
                }
                CallInput::AcceptTimeout { call_id } => {
                    self.on_accept_timeout(&mut core, call_id);
                    Ok(())
                }
                CallInput::MediaOpened {
                    call_id,
                    peer,
                    ws_url,
                    result,
                } => self.on_media_opened(&mut core, call_id, peer, ws_url, result),
                CallInput::MediaClosed { call_id } => {
                    self.on_media_closed(&mut core, call_id);
                    Ok(())
                }
                CallInput::Hangup => self.on_hangup(&mut core),
                CallInput::AnswerPush { caller, done } => self.on_answer_push(&mut core, caller, done),
                CallInput::StartAi { peer, done } => self.on_start_ai(&mut core, peer, done),
            };

            self.publish(&core);
            result
        })
    }

    fn on_incoming_call(&self, core: &mut CallCore, from: String, ws_url: Option<String>) {
        if core.call.state != CallState::Idle {
            tracing::info!("Busy, rejecting incoming call from {}", from);
            // Der Anrufer kennt keine Call-ID von uns, daher eine neue
            let call_id = uuid::Uuid::new_v4().to_string();
            self.send_reject(&from, &call_id, Some(REASON_BUSY));
            return;
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Incoming call from {} ({})", from, call_id);

        core.call.call_id = Some(call_id.clone());
        core.call.peer = Some(from.clone());
        core.call.direction = Some(CallDirection::Incoming);
        core.call.media_url = ws_url.clone();

        let this = self.clone();
        let timeout = self.inner.config.call.ring_timeout();
        let timer_call_id = call_id.clone();
        core.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = this
                .dispatch(CallInput::RingTimeout {
                    call_id: timer_call_id,
                })
                .await;
        }));

        if self.inner.host.visibility.is_foreground() {
            self.inner.host.navigator.navigate(Screen::IncomingCall {
                call_id,
                caller: from,
                ws_url,
            });
            core.call.incoming_ui_shown = true;
        } else {
            tracing::info!("App in background, incoming call left to the push notification");
        }

        self.set_state(core, CallState::Ringing);
    }

    fn on_accept(&self, core: &mut CallCore) -> Result<(), CallError> {
        match core.call.state {
            CallState::Ringing => {}
            CallState::Accepting | CallState::Connected => {
                tracing::debug!("Call already accepted");
                return Ok(());
            }
            CallState::Idle | CallState::Ended => return Err(CallError::NoActiveCall),
        }

        let me = self.user_id()?;
        let (Some(peer), Some(call_id)) = (core.call.peer.clone(), core.call.call_id.clone()) else {
            return Err(CallError::NoActiveCall);
        };

        if let Some(timer) = core.ring_timer.take() {
            timer.abort();
        }

        if let Err(e) = self.inner.signaling.accept_call(me, peer, call_id.clone()) {
            // Kein Abbruch: ohne Antwort greift der Timeout
            tracing::warn!("accept_call not delivered: {}", e);
        }

        let this = self.clone();
        let timeout = self.inner.config.call.accept_timeout();
        core.accept_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = this.dispatch(CallInput::AcceptTimeout { call_id }).await;
        }));

        self.set_state(core, CallState::Accepting);
        Ok(())
    }

    fn on_reject(&self, core: &mut CallCore) -> Result<(), CallError> {
        match core.call.state {
            CallState::Ringing | CallState::Accepting => {}
            CallState::Connected => return Err(CallError::InvalidState(CallState::Connected)),
            CallState::Idle | CallState::Ended => return Err(CallError::NoActiveCall),
        }

        if let (Some(peer), Some(call_id)) = (core.call.peer.clone(), core.call.call_id.clone()) {
            tracing::info!("Rejecting call from {}", peer);
            self.send_reject(&peer, &call_id, None);
        }

        self.inner.host.navigator.navigate(Screen::Main);
        self.end_call(core);
        Ok(())
    }

    fn on_ready(&self, core: &mut CallCore, by: String, ws_url: String) {
        if core.call.state != CallState::Accepting || core.media_connect.is_some() {
            tracing::debug!("Ignoring ready from {} in state {:?}", by, core.call.state);
            return;
        }

        if let Some(timer) = core.accept_timer.take() {
            timer.abort();
        }

        tracing::info!("Call ready, opening media connection");
        self.connect_media(core, by, ws_url, None);
    }

    fn on_rejected(&self, core: &mut CallCore, by: String, reason: Option<String>) {
        if matches!(core.call.state, CallState::Idle | CallState::Ended) {
            tracing::debug!("Ignoring call_rejected from {} without active call", by);
            return;
        }

        tracing::info!("Call rejected by {} (reason: {:?})", by, reason);
        if core.call.incoming_ui_shown || core.call.state == CallState::Connected {
            self.inner.host.navigator.navigate(Screen::Main);
        }
        self.end_call(core);
    }

    fn on_ring_timeout(&self, core: &mut CallCore, call_id: String) {
        if core.call.state != CallState::Ringing || core.call.call_id.as_deref() != Some(call_id.as_str()) {
            return;
        }

        core.ring_timer = None;

        let peer = core.call.peer.clone().unwrap_or_default();
        tracing::info!("Call from {} not answered within {:?}", peer, self.inner.config.call.ring_timeout());
        self.send_reject(&peer, &call_id, Some(REASON_TIMEOUT));

        self.notify(Notice::new("Missed call", format!("Missed call from {peer}.")));
        if core.call.incoming_ui_shown {
            self.inner.host.navigator.navigate(Screen::Main);
        }
        self.end_call(core);
    }

    fn on_accept_timeout(&self, core: &mut CallCore, call_id: String) {
        if core.call.state != CallState::Accepting || core.call.call_id.as_deref() != Some(call_id.as_str()) {
            return;
        }

        // Der Timer-Task läuft gerade selbst; nicht abbrechen
        core.accept_timer = None;

        tracing::warn!("No ready signal within {:?}", self.inner.config.call.accept_timeout());
        if let Some(peer) = core.call.peer.clone() {
            self.send_reject(&peer, &call_id, Some(REASON_TIMEOUT));
        }

        self.notify(Notice::new("No response", "Caller did not respond."));
        self.inner.host.navigator.navigate(Screen::Main);
        self.end_call(core);
    }

    fn on_media_closed(&self, core: &mut CallCore, call_id: String) {
        if core.call.state != CallState::Connected || core.call.call_id.as_deref() != Some(call_id.as_str()) {
            return;
        }

        core.media_watch = None;

        tracing::info!("Media connection ended, closing call");
        self.inner.host.navigator.navigate(Screen::Main);
        self.end_call(core);
    }

    fn on_hangup(&self, core: &mut CallCore) -> Result<(), CallError> {
        match core.call.state {
            CallState::Idle | CallState::Ended => {
                tracing::debug!("Hangup without active call");
                Ok(())
            }
            CallState::Ringing => self.on_reject(core),
            CallState::Accepting | CallState::Connected => {
                tracing::info!("Hanging up");
                self.inner.host.navigator.navigate(Screen::Main);
                self.end_call(core);
                Ok(())
            }
        }
    }

    /// Push-Annahme: übernimmt einen klingelnden Anruf oder startet einen neuen
    fn on_answer_push(&self, core: &mut CallCore, caller: String, done: MediaDone) -> Result<(), CallError> {
        match core.call.state {
            CallState::Idle => {
                let url = self.inner.config.call.ai_media_url.clone();
                self.start_direct(core, caller, url, CallDirection::Incoming, done);
                Ok(())
            }
            CallState::Ringing => {
                if let Some(timer) = core.ring_timer.take() {
                    timer.abort();
                }

                let peer = core.call.peer.clone().unwrap_or_else(|| caller.clone());
                if peer != caller {
                    tracing::warn!("Push answer for {} while {} is ringing, answering {}", caller, peer, peer);
                }

                // Ohne ws_url im incoming_call antwortet der AI-Endpoint
                let url = core
                    .call
                    .media_url
                    .clone()
                    .unwrap_or_else(|| self.inner.config.call.ai_media_url.clone());

                tracing::info!("Answering ringing call from {} via push", peer);
                self.connect_media(core, peer, url, Some(done));
                self.set_state(core, CallState::Accepting);
                Ok(())
            }
            CallState::Accepting | CallState::Connected | CallState::Ended => Err(CallError::AlreadyInCall),
        }
    }

    fn on_start_ai(&self, core: &mut CallCore, peer: String, done: MediaDone) -> Result<(), CallError> {
        if core.call.state != CallState::Idle {
            return Err(CallError::AlreadyInCall);
        }

        let url = self.inner.config.call.ai_media_url.clone();
        self.start_direct(core, peer, url, CallDirection::Outgoing, done);
        Ok(())
    }

    /// Push-Annahme und AI-Anruf: ohne Signaling direkt verbinden
    fn start_direct(&self, core: &mut CallCore, peer: String, ws_url: String, direction: CallDirection, done: MediaDone) {
        let call_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Connecting {:?} call with {} ({})", direction, peer, call_id);

        core.call.call_id = Some(call_id);
        core.call.peer = Some(peer.clone());
        core.call.direction = Some(direction);

        self.connect_media(core, peer, ws_url, Some(done));
        self.set_state(core, CallState::Accepting);
    }

    /// Startet den Aufbau der Media-Verbindung außerhalb des Call-Locks
    ///
    /// Der Aufbau ist durch `media_connect_timeout` begrenzt; `end_call`
    /// bricht ihn ab.
    fn connect_media(&self, core: &mut CallCore, peer: String, ws_url: String, done: Option<MediaDone>) {
        let Some(call_id) = core.call.call_id.clone() else {
            if let Some(done) = done {
                let _ = done.send(Err(CallError::NoActiveCall));
            }
            return;
        };

        let playback = PlaybackScheduler::new(
            &self.inner.config.playback,
            Arc::clone(&self.inner.host.playback),
            Arc::clone(&self.inner.host.clips),
        );
        let connector = Arc::clone(&self.inner.media_connector);
        let encoding = self.inner.config.call.encoding;
        let limit = self.inner.config.call.media_connect_timeout();
        let this = self.clone();

        core.call.media_pending = true;
        core.media_connect = Some(tokio::spawn(async move {
            let opened = tokio::time::timeout(
                limit,
                MediaSession::open(connector.as_ref(), &ws_url, encoding, playback),
            )
            .await;
            let result = opened.unwrap_or_else(|_| {
                Err(TransportError::ConnectionFailed(format!(
                    "no connection within {:?}",
                    limit
                )))
            });

            let outcome = this
                .dispatch(CallInput::MediaOpened {
                    call_id,
                    peer,
                    ws_url,
                    result,
                })
                .await;
            if let Some(done) = done {
                let _ = done.send(outcome);
            }
        }));
    }

    /// Media-Verbindung steht (oder ist gescheitert): Mikrofon und Wiedergabe binden
    fn on_media_opened(
        &self,
        core: &mut CallCore,
        call_id: String,
        peer: String,
        ws_url: String,
        result: Result<MediaSession, TransportError>,
    ) -> Result<(), CallError> {
        if core.media_connect.is_none() || core.call.call_id.as_deref() != Some(call_id.as_str()) {
            // Eine bereits geöffnete Session wird beim Drop geschlossen
            tracing::debug!("Discarding media connection of ended call {}", call_id);
            return Err(CallError::Cancelled);
        }

        // Der Aufbau-Task läuft gerade selbst; nicht abbrechen
        core.media_connect = None;
        core.call.media_pending = false;

        let mut session = match result {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to open media connection: {}", e);
                self.notify(Notice::new("Call failed", "Could not connect to the call."));
                self.inner.host.navigator.navigate(Screen::Main);
                self.end_call(core);
                return Err(CallError::Media(e));
            }
        };

        let mic = MicRelay::new(Arc::clone(&self.inner.host.capture));
        if let Err(e) = session.attach_mic(mic, &self.inner.config.capture) {
            // Anruf läuft weiter, nur ohne Mikrofon
            tracing::warn!("Microphone unavailable, continuing receive-only: {}", e);
        }

        let closed = session.closed();
        let this = self.clone();
        core.media_watch = Some(tokio::spawn(async move {
            closed.await;
            let _ = this.dispatch(CallInput::MediaClosed { call_id }).await;
        }));

        core.media = Some(session);
        core.call.media_url = Some(ws_url.clone());
        core.call.incoming_ui_shown = false;

        self.inner
            .host
            .navigator
            .navigate(Screen::VoiceCall { ws_url, peer });
        self.set_state(core, CallState::Connected);
        Ok(())
    }

    /// Einziger Ausstieg aus einem Anruf
    ///
    /// Stoppt Timer und einen laufenden Media-Aufbau, Mikrofon und Wiedergabe,
    /// schließt die Media-Verbindung
    /// und setzt alle anruf-bezogenen Felder zurück.
    fn end_call(&self, core: &mut CallCore) {
        for timer in [
            core.ring_timer.take(),
            core.accept_timer.take(),
            core.media_connect.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        if let Some(watch) = core.media_watch.take() {
            watch.abort();
        }
        if let Some(mut media) = core.media.take() {
            media.close();
        }

        let was_connected = core.call.state == CallState::Connected;
        let call_id = core.call.call_id.take();
        core.call = CallSnapshot::default();

        if was_connected {
            self.set_state(core, CallState::Ended);
        }
        self.set_state(core, CallState::Idle);

        tracing::info!("Call {:?} ended", call_id);
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn set_state(&self, core: &mut CallCore, state: CallState) {
        core.call.state = state;
        self.publish(core);
        tracing::info!("Call state: {:?}", state);
        let _ = self.inner.event_tx.send(CallEvent::StateChanged(state));
    }

    fn publish(&self, core: &CallCore) {
        *self.inner.snapshot.write() = core.call.clone();
    }

    fn notify(&self, notice: Notice) {
        self.inner.host.notifier.notify(notice.clone());
        let _ = self.inner.event_tx.send(CallEvent::Notice(notice));
    }

    fn user_id(&self) -> Result<String, CallError> {
        self.inner.host.identity.user_id().ok_or(CallError::NoIdentity)
    }

    /// Best-effort `reject_call`; Fehler werden nur geloggt
    fn send_reject(&self, to: &str, call_id: &str, reason: Option<&str>) {
        let me = match self.user_id() {
            Ok(me) => me,
            Err(e) => {
                tracing::warn!("Cannot send reject_call: {}", e);
                return;
            }
        };

        if let Err(e) = self.inner.signaling.reject_call(
            me,
            to.to_string(),
            call_id.to_string(),
            reason.map(str::to_string),
        ) {
            tracing::warn!("reject_call not delivered: {}", e);
        }
    }
}

impl std::fmt::Debug for CallSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionController")
            .field("call", &*self.inner.snapshot.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::testing::{wait_until, MockConnector, MockPeer, TestHost};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        controller: CallSessionController,
        host: TestHost,
        config: Config,
        signal: MockPeer,
        media_connector: Arc<MockConnector>,
        media_peers: UnboundedReceiver<MockPeer>,
        _signal_peers: UnboundedReceiver<MockPeer>,
    }

    impl Harness {
        /// Gesendete Signaling-Frames ohne Heartbeats
        fn signals(&mut self) -> Vec<serde_json::Value> {
            self.signal
                .drain_json()
                .into_iter()
                .filter(|frame| frame["type"] != "ping")
                .collect()
        }
    }

    async fn harness(foreground: bool) -> Harness {
        let (signal_connector, mut signal_peers) = MockConnector::new();
        let signaling = SignalingClient::new(
            SignalingConfig {
                url: "ws://signal.test".to_string(),
                ..SignalingConfig::default()
            },
            signal_connector,
        );
        signaling.connect("alice").unwrap();
        let signal = signal_peers.recv().await.unwrap();
        assert!(wait_until(|| signaling.is_connected()).await);

        let (media_connector, media_peers) = MockConnector::new();
        let host = TestHost::new("alice", foreground);
        let config = Config::default();
        let controller = CallSessionController::new(
            &config,
            signaling.clone(),
            media_connector.clone(),
            host.services.clone(),
        );
        controller.spawn_signal_listener(signaling.subscribe());

        Harness {
            controller,
            host,
            config,
            signal,
            media_connector,
            media_peers,
            _signal_peers: signal_peers,
        }
    }

    async fn ring(h: &mut Harness, from: &str) {
        h.signal
            .send_json(serde_json::json!({ "event": "incoming_call", "from": from }));
        let controller = h.controller.clone();
        assert!(wait_until(|| controller.state() == CallState::Ringing).await);
    }

    async fn connect(h: &mut Harness) -> MockPeer {
        ring(h, "bob").await;
        h.controller.accept().await.unwrap();
        h.signal.send_json(
            serde_json::json!({ "event": "call_ready", "by": "bob", "ws_url": "wss://x" }),
        );
        let controller = h.controller.clone();
        assert!(wait_until(|| controller.state() == CallState::Connected).await);
        h.media_peers.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_accept_ready_connects() {
        let mut h = harness(true).await;

        ring(&mut h, "bob").await;
        let snapshot = h.controller.snapshot();
        let call_id = snapshot.call_id.clone().unwrap();
        assert_eq!(snapshot.peer.as_deref(), Some("bob"));
        assert!(snapshot.incoming_ui_shown);
        assert_eq!(
            h.host.navigator.screens(),
            vec![Screen::IncomingCall {
                call_id: call_id.clone(),
                caller: "bob".to_string(),
                ws_url: None,
            }]
        );

        h.controller.accept().await.unwrap();
        assert_eq!(h.controller.state(), CallState::Accepting);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            h.signals(),
            vec![serde_json::json!({ "type": "accept_call", "from": "alice", "to": "bob", "callId": call_id })]
        );

        h.signal
            .send_json(serde_json::json!({ "event": "call_ready", "by": "bob", "ws_url": "wss://x" }));
        let controller = h.controller.clone();
        assert!(wait_until(|| controller.state() == CallState::Connected).await);

        let mut media = h.media_peers.recv().await.unwrap();
        assert_eq!(media.url, "wss://x");
        let start = media.drain_json();
        assert_eq!(start[0]["event"], "start");

        let snapshot = h.controller.snapshot();
        assert!(!snapshot.incoming_ui_shown);
        assert_eq!(snapshot.media_url.as_deref(), Some("wss://x"));
        assert_eq!(
            h.host.navigator.screens().last(),
            Some(&Screen::VoiceCall {
                ws_url: "wss://x".to_string(),
                peer: "bob".to_string(),
            })
        );
        assert!(h.host.capture.is_running());

        // Timeout wurde abgebrochen
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.controller.state(), CallState::Connected);
        assert!(h.host.notifier.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_timeout_returns_to_idle() {
        let mut h = harness(true).await;
        ring(&mut h, "bob").await;
        let call_id = h.controller.snapshot().call_id.unwrap();

        h.controller.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(15_500)).await;

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.state, CallState::Idle);
        assert_eq!(snapshot.call_id, None);
        assert_eq!(snapshot.peer, None);

        let rejects: Vec<_> = h
            .signals()
            .into_iter()
            .filter(|frame| frame["type"] == "reject_call")
            .collect();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0]["reason"], "timeout");
        assert_eq!(rejects[0]["callId"], call_id.as_str());

        assert_eq!(
            h.host.notifier.notices(),
            vec![Notice::new("No response", "Caller did not respond.")]
        );
        assert_eq!(h.host.navigator.screens().last(), Some(&Screen::Main));

        // Ein später call_ready ändert nichts mehr
        h.signal
            .send_json(serde_json::json!({ "event": "call_ready", "by": "bob", "ws_url": "wss://x" }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.controller.state(), CallState::Idle);
        assert_eq!(h.media_connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_call_shows_no_ui() {
        let mut h = harness(false).await;
        ring(&mut h, "bob").await;

        assert!(h.host.navigator.screens().is_empty());
        assert!(!h.controller.snapshot().incoming_ui_shown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_from_ringing() {
        let mut h = harness(true).await;
        ring(&mut h, "bob").await;

        h.controller.reject().await.unwrap();
        assert_eq!(h.controller.snapshot(), CallSnapshot::default());
        assert_eq!(h.host.navigator.screens().last(), Some(&Screen::Main));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let signals = h.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0]["type"], "reject_call");
        assert!(signals[0].get("reason").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_accept_is_ignored() {
        let mut h = harness(true).await;
        ring(&mut h, "bob").await;

        h.controller.accept().await.unwrap();
        h.controller.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let accepts = h
            .signals()
            .into_iter()
            .filter(|frame| frame["type"] == "accept_call")
            .count();
        assert_eq!(accepts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_caller_gets_busy() {
        let mut h = harness(true).await;
        ring(&mut h, "bob").await;

        h.signal
            .send_json(serde_json::json!({ "event": "incoming_call", "from": "carol" }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let signals = h.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0]["to"], "carol");
        assert_eq!(signals[0]["reason"], "busy");
        assert_eq!(h.controller.snapshot().peer.as_deref(), Some("bob"));
        assert_eq!(h.controller.state(), CallState::Ringing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_reject_while_accepting() {
        let mut h = harness(true).await;
        ring(&mut h, "bob").await;
        h.controller.accept().await.unwrap();

        h.signal
            .send_json(serde_json::json!({ "event": "call_rejected", "by": "bob" }));
        let controller = h.controller.clone();
        assert!(wait_until(|| controller.state() == CallState::Idle).await);
        assert_eq!(h.host.navigator.screens().last(), Some(&Screen::Main));

        // Kein Timeout-Reject mehr
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(h.host.notifier.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_resets_everything() {
        let mut h = harness(true).await;
        let mut events = h.controller.subscribe();
        let mut media = connect(&mut h).await;

        h.controller.hangup().await.unwrap();
        assert_eq!(h.controller.snapshot(), CallSnapshot::default());
        assert!(!h.host.capture.is_running());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CallEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                CallState::Ringing,
                CallState::Accepting,
                CallState::Connected,
                CallState::Ended,
                CallState::Idle,
            ]
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        media.drain_json();
        assert!(matches!(media.outbound.try_next(), Ok(None)));

        // Ein neuer Anruf startet ohne Reste
        ring(&mut h, "carol").await;
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.peer.as_deref(), Some("carol"));
        assert_eq!(snapshot.media_url, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_media_close_ends_call() {
        let mut h = harness(true).await;
        let media = connect(&mut h).await;

        media.close();
        let controller = h.controller.clone();
        assert!(wait_until(|| controller.state() == CallState::Idle).await);
        assert!(!h.host.capture.is_running());
        assert_eq!(h.controller.snapshot().call_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_audio_is_played() {
        let mut h = harness(true).await;
        let media = connect(&mut h).await;

        let frame_bytes = h.config.playback.frame_bytes;
        let ulaw = vec![0xFFu8; frame_bytes / 2];
        media.send_json(serde_json::json!({
            "event": "media",
            "media": { "payload": BASE64.encode(&ulaw) }
        }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let clips = h.host.clips.written();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].len(), 44 + frame_bytes);
        assert_eq!(h.host.playback.played().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_answer_opens_ai_media() {
        let mut h = harness(false).await;

        h.controller.answer_push_call("bob").await.unwrap();
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.direction, Some(CallDirection::Incoming));
        assert_eq!(snapshot.peer.as_deref(), Some("bob"));

        let media = h.media_peers.recv().await.unwrap();
        assert_eq!(media.url, h.config.call.ai_media_url);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ai_call_is_outgoing() {
        let mut h = harness(true).await;

        h.controller.start_ai_call("AI").await.unwrap();
        assert_eq!(
            h.controller.snapshot().direction,
            Some(CallDirection::Outgoing)
        );
        let _media = h.media_peers.recv().await.unwrap();

        assert_eq!(
            h.controller.start_ai_call("AI").await,
            Err(CallError::AlreadyInCall)
        );
        assert_eq!(h.media_connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_failure_returns_to_idle() {
        let mut h = harness(true).await;
        h.media_connector.set_refuse(true);

        ring(&mut h, "bob").await;
        h.controller.accept().await.unwrap();
        h.signal.send_json(
            serde_json::json!({ "event": "call_accepted", "by": "bob", "ws_url": "wss://x" }),
        );

        let controller = h.controller.clone();
        assert!(wait_until(|| controller.state() == CallState::Idle).await);
        assert_eq!(h.host.notifier.notices().len(), 1);
        assert_eq!(h.controller.snapshot(), CallSnapshot::default());
    }

    /// Lässt virtuelle Zeit verstreichen und hält das Signaling mit `pong` am Leben
    async fn idle_with_pongs(h: &Harness, secs: u64) {
        for _ in 0..secs / 5 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.signal.send_json(serde_json::json!({ "type": "pong" }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_answer_takes_over_ringing_call() {
        let mut h = harness(false).await;
        ring(&mut h, "bob").await;
        let call_id = h.controller.snapshot().call_id.unwrap();

        h.controller.answer_push_call("bob").await.unwrap();
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.call_id.as_deref(), Some(call_id.as_str()));
        assert_eq!(snapshot.peer.as_deref(), Some("bob"));
        assert_eq!(snapshot.direction, Some(CallDirection::Incoming));
        assert!(!snapshot.media_pending);

        let mut media = h.media_peers.recv().await.unwrap();
        assert_eq!(media.url, h.config.call.ai_media_url);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(media.drain_json()[0]["event"], "start");

        // Der Klingel-Timer ist abgebrochen
        idle_with_pongs(&h, 60).await;
        assert_eq!(h.controller.state(), CallState::Connected);
        assert!(h.host.notifier.notices().is_empty());
        assert!(h.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_cancels_stalled_media_connect() {
        let h = harness(true).await;
        h.media_connector.set_stall(true);

        let controller = h.controller.clone();
        let call = tokio::spawn(async move { controller.start_ai_call("AI").await });

        let controller = h.controller.clone();
        assert!(wait_until(|| controller.snapshot().media_pending).await);
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.state, CallState::Accepting);
        assert_eq!(snapshot.direction, Some(CallDirection::Outgoing));
        assert!(snapshot.call_id.is_some());
        assert_eq!(
            h.controller.start_ai_call("AI").await,
            Err(CallError::AlreadyInCall)
        );

        tokio::time::timeout(Duration::from_secs(1), h.controller.hangup())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.controller.snapshot(), CallSnapshot::default());
        assert_eq!(call.await.unwrap(), Err(CallError::Cancelled));
        assert_eq!(h.media_connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_media_connect_times_out() {
        let mut h = harness(true).await;
        h.media_connector.set_stall(true);

        ring(&mut h, "bob").await;
        h.controller.accept().await.unwrap();
        h.signal
            .send_json(serde_json::json!({ "event": "call_ready", "by": "bob", "ws_url": "wss://x" }));
        let controller = h.controller.clone();
        assert!(wait_until(|| controller.snapshot().media_pending).await);

        // Signale werden während des Aufbaus weiter verarbeitet
        h.signal
            .send_json(serde_json::json!({ "event": "incoming_call", "from": "carol" }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rejects: Vec<_> = h
            .signals()
            .into_iter()
            .filter(|frame| frame["type"] == "reject_call")
            .collect();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0]["to"], "carol");
        assert_eq!(rejects[0]["reason"], "busy");
        assert_eq!(h.controller.state(), CallState::Accepting);

        tokio::time::sleep(h.config.call.media_connect_timeout()).await;
        assert_eq!(h.controller.snapshot(), CallSnapshot::default());
        assert_eq!(
            h.host.notifier.notices(),
            vec![Notice::new("Call failed", "Could not connect to the call.")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_stops_ringing() {
        let mut h = harness(false).await;
        ring(&mut h, "bob").await;
        let call_id = h.controller.snapshot().call_id.unwrap();

        idle_with_pongs(&h, 50).await;
        assert_eq!(h.controller.snapshot(), CallSnapshot::default());
        assert_eq!(
            h.host.notifier.notices(),
            vec![Notice::new("Missed call", "Missed call from bob.")]
        );
        assert!(h.host.navigator.screens().is_empty());

        let rejects: Vec<_> = h
            .signals()
            .into_iter()
            .filter(|frame| frame["type"] == "reject_call")
            .collect();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0]["to"], "bob");
        assert_eq!(rejects[0]["reason"], "timeout");
        assert_eq!(rejects[0]["callId"], call_id.as_str());

        // Der nächste Anrufer klingelt wieder normal
        ring(&mut h, "carol").await;
        assert_eq!(h.controller.snapshot().peer.as_deref(), Some("carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_without_call_fails() {
        let h = harness(true).await;
        assert_eq!(h.controller.accept().await, Err(CallError::NoActiveCall));
        assert_eq!(h.controller.reject().await, Err(CallError::NoActiveCall));
        assert_eq!(h.controller.hangup().await, Ok(()));
    }
}
