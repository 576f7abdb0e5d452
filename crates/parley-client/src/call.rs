//! Call lifecycle orchestration.
//!
//! Drives the media layer's [`PeerSession`] through the user-visible
//! call states and reconciles it with signaling pushed from the relay.
//! Every inbound signal and media event is guarded by the current state:
//! out-of-state transitions are ignored (with a log), which is what
//! resolves races like an offer arriving ahead of its invitation. At
//! most one call session exists; a second inbound call while one is
//! active is auto-declined rather than overwriting state.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_media::{CallConfig, CallError, CallEvent, MediaConstraints, PeerSession};
use parley_net::SocketCommand;
use parley_shared::events::{ClientEvent, ServerEvent};
use parley_shared::types::UserId;

#[derive(Error, Debug)]
pub enum CallCtrlError {
    #[error("A call is already active")]
    Busy,

    #[error("No call in a state that allows this action")]
    InvalidState,

    #[error("No retry budget left, start a new call")]
    RetriesExhausted,

    #[error(transparent)]
    Media(#[from] CallError),

    #[error("Socket channel closed")]
    SocketClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Outgoing, invitation sent, setting up media.
    Calling,
    /// Outgoing, offer sent, waiting for the remote side.
    Ringing,
    /// Inbound call awaiting accept/decline.
    Incoming,
    Connecting,
    Connected,
    Failed,
    /// The remote side declined our call.
    Declined,
}

impl CallState {
    /// A session exists (or is being set up) in this state.
    fn is_active(self) -> bool {
        matches!(
            self,
            CallState::Calling
                | CallState::Ringing
                | CallState::Incoming
                | CallState::Connecting
                | CallState::Connected
        )
    }

    /// States from which a fresh call may be started.
    fn can_start(self) -> bool {
        matches!(self, CallState::Idle | CallState::Failed | CallState::Declined)
    }
}

/// Fired by the optional ring timer; tagged with the call generation so
/// a timeout scheduled for an earlier call cannot touch a later one.
#[derive(Debug, Clone, Copy)]
pub struct RingTimeout {
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct CallControllerConfig {
    pub media: CallConfig,
    /// Auto-fail `Calling`/`Ringing` after this long with no answer.
    /// `None` (the default) keeps the call waiting indefinitely.
    pub ring_timeout: Option<Duration>,
}

impl Default for CallControllerConfig {
    fn default() -> Self {
        Self {
            media: CallConfig::default(),
            ring_timeout: None,
        }
    }
}

pub struct CallController {
    config: CallControllerConfig,
    session: PeerSession,
    media_events: Option<mpsc::UnboundedReceiver<CallEvent>>,
    cmd_tx: mpsc::Sender<SocketCommand>,
    state: CallState,
    peer: Option<UserId>,
    /// An offer that arrived before the user accepted; applied on accept.
    pending_offer: Option<Value>,
    /// Bumped on every new call attempt; stale timer events are dropped.
    generation: u64,
    timer_tx: mpsc::UnboundedSender<RingTimeout>,
    timer_rx: Option<mpsc::UnboundedReceiver<RingTimeout>>,
    ring_task: Option<JoinHandle<()>>,
    attempts: u32,
}

impl CallController {
    pub fn new(config: CallControllerConfig, cmd_tx: mpsc::Sender<SocketCommand>) -> Self {
        let (session, media_events) = PeerSession::new(config.media.clone());
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            config,
            session,
            media_events: Some(media_events),
            cmd_tx,
            state: CallState::Idle,
            peer: None,
            pending_offer: None,
            generation: 0,
            timer_tx,
            timer_rx: Some(timer_rx),
            ring_task: None,
            attempts: 0,
        }
    }

    /// The media event stream; taken once by the bridge loop and fed
    /// back through [`handle_media_event`](Self::handle_media_event).
    pub fn take_media_events(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.media_events.take()
    }

    /// The ring-timer stream; taken once by the bridge loop and fed
    /// back through [`handle_ring_timeout`](Self::handle_ring_timeout).
    pub fn take_timer_events(&mut self) -> Option<mpsc::UnboundedReceiver<RingTimeout>> {
        self.timer_rx.take()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.peer.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn diagnostics(&self) -> parley_media::Diagnostics {
        self.session.diagnostics()
    }

    /// Start an outgoing call: invitation, media setup, offer.
    pub async fn start_call(&mut self, peer: UserId) -> Result<(), CallCtrlError> {
        if !self.state.can_start() {
            return Err(CallCtrlError::Busy);
        }
        if self.state != CallState::Idle {
            // Failed/Declined leftovers from the previous attempt.
            self.teardown().await;
        }

        self.generation += 1;
        self.state = CallState::Calling;
        self.peer = Some(peer.clone());
        self.attempts = 0;

        info!(peer = %peer.short(), "Starting call");
        self.emit(ClientEvent::CallInvitation { to: peer.clone() })
            .await?;

        if let Err(e) = self.setup_outgoing_media().await {
            warn!(error = %e, "Call setup failed");
            self.state = CallState::Failed;
            return Err(e);
        }

        self.state = CallState::Ringing;
        self.arm_ring_timer();
        Ok(())
    }

    async fn setup_outgoing_media(&mut self) -> Result<(), CallCtrlError> {
        self.session.initialize(true).await?;
        self.session
            .acquire_local_media(MediaConstraints::default())
            .await?;
        // The resulting OfferCreated event carries the offer to the wire.
        self.session.create_offer().await?;
        Ok(())
    }

    /// Accept the inbound call.
    pub async fn accept(&mut self) -> Result<(), CallCtrlError> {
        if self.state != CallState::Incoming {
            return Err(CallCtrlError::InvalidState);
        }
        let peer = self.peer.clone().ok_or(CallCtrlError::InvalidState)?;

        self.generation += 1;
        self.state = CallState::Connecting;

        info!(peer = %peer.short(), "Accepting call");
        self.emit(ClientEvent::Accept { to: peer.clone() }).await?;

        let result: Result<(), CallCtrlError> = async {
            self.session.initialize(false).await?;
            self.session
                .acquire_local_media(MediaConstraints::default())
                .await?;

            if let Some(offer) = self.pending_offer.take() {
                self.session.handle_offer(offer).await?;
                // AnswerCreated carries the answer to the wire.
                self.session.create_answer().await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Accept failed");
            self.state = CallState::Failed;
            return Err(e);
        }
        Ok(())
    }

    /// Decline the inbound call. No media is ever acquired.
    pub async fn decline(&mut self) -> Result<(), CallCtrlError> {
        if self.state != CallState::Incoming {
            return Err(CallCtrlError::InvalidState);
        }
        let peer = self.peer.clone().ok_or(CallCtrlError::InvalidState)?;

        info!(peer = %peer.short(), "Declining call");
        self.emit(ClientEvent::Decline { to: peer }).await?;
        self.reset().await;
        Ok(())
    }

    /// Hang up the current call (any active state).
    pub async fn hangup(&mut self) -> Result<(), CallCtrlError> {
        if self.state == CallState::Idle {
            return Ok(());
        }

        if let Some(peer) = self.peer.clone() {
            let _ = self
                .emit(ClientEvent::CallEnded { to: peer.clone() })
                .await;
            info!(peer = %peer.short(), "Call ended locally");
        }
        self.reset().await;
        Ok(())
    }

    /// Manual recovery after a terminal failure, bounded by the same
    /// attempt counter as the automatic retries.
    pub async fn manual_retry(&mut self) -> Result<(), CallCtrlError> {
        if self.state != CallState::Failed {
            return Err(CallCtrlError::InvalidState);
        }
        if self.attempts >= self.config.media.max_retries {
            return Err(CallCtrlError::RetriesExhausted);
        }

        self.session.restart_ice().await?;
        self.state = CallState::Connecting;
        Ok(())
    }

    /// Flip local audio; returns the new enabled state.
    pub fn toggle_audio(&mut self) -> bool {
        self.session.toggle_audio()
    }

    /// Flip local video; returns the new enabled state.
    pub fn toggle_video(&mut self) -> bool {
        self.session.toggle_video()
    }

    /// Apply a call-related signal pushed from the relay.
    pub async fn handle_signal(&mut self, event: ServerEvent) -> Result<(), CallCtrlError> {
        match event {
            ServerEvent::CallInvitation { from } => {
                if self.state == CallState::Idle {
                    info!(peer = %from.short(), "Incoming call");
                    self.state = CallState::Incoming;
                    self.peer = Some(from);
                } else if self.peer.as_ref() == Some(&from) {
                    debug!("Duplicate invitation from the active peer, ignoring");
                } else {
                    // One call at a time: a second caller is declined
                    // without touching the active session.
                    info!(peer = %from.short(), "Busy, auto-declining second call");
                    self.emit(ClientEvent::Decline { to: from }).await?;
                }
            }

            ServerEvent::Offer { from, offer } => {
                self.handle_offer_signal(from, offer).await?;
            }

            ServerEvent::Answer { answer } => match self.state {
                CallState::Calling | CallState::Ringing => {
                    self.session.handle_answer(answer).await?;
                    self.state = CallState::Connecting;
                    self.disarm_ring_timer();
                }
                CallState::Connecting | CallState::Connected => {
                    // Answer to an ICE-restart offer.
                    self.session.handle_answer(answer).await?;
                }
                _ => debug!("Answer in inactive state, ignoring"),
            },

            ServerEvent::Candidate { candidate } => {
                if self.state.is_active() && self.session.is_initialized() {
                    // Early candidates are buffered by the session itself.
                    self.session.add_remote_candidate(candidate).await?;
                } else {
                    debug!("Candidate with no active session, ignoring");
                }
            }

            ServerEvent::CallAccept => match self.state {
                CallState::Calling | CallState::Ringing => {
                    debug!("Remote accepted, awaiting connection");
                    self.state = CallState::Connecting;
                    self.disarm_ring_timer();
                }
                _ => debug!("Accept in inactive state, ignoring"),
            },

            ServerEvent::CallDecline => match self.state {
                CallState::Calling | CallState::Ringing | CallState::Connecting => {
                    info!("Remote declined the call");
                    self.teardown().await;
                    self.state = CallState::Declined;
                }
                _ => debug!("Decline in inactive state, ignoring"),
            },

            ServerEvent::CallEnded => {
                if self.state.is_active() || self.state == CallState::Failed {
                    info!("Call ended by remote");
                    self.reset().await;
                }
            }

            other => {
                debug!(event = ?other, "Non-call event passed to call controller");
            }
        }
        Ok(())
    }

    async fn handle_offer_signal(
        &mut self,
        from: UserId,
        offer: Value,
    ) -> Result<(), CallCtrlError> {
        match self.state {
            // An unsolicited offer rings like an invitation; the offer is
            // kept until the user accepts.
            CallState::Idle => {
                info!(peer = %from.short(), "Incoming call (offer first)");
                self.state = CallState::Incoming;
                self.peer = Some(from);
                self.pending_offer = Some(offer);
            }

            CallState::Incoming if self.peer.as_ref() == Some(&from) => {
                debug!("Offer buffered for pending accept");
                self.pending_offer = Some(offer);
            }

            // Accepted before the offer arrived, or a remote ICE restart:
            // apply and answer right away.
            CallState::Connecting | CallState::Connected
                if self.peer.as_ref() == Some(&from) =>
            {
                self.session.handle_offer(offer).await?;
                self.session.create_answer().await?;
            }

            _ => {
                if self.peer.as_ref() != Some(&from) {
                    info!(peer = %from.short(), "Busy, auto-declining offer");
                    self.emit(ClientEvent::Decline { to: from }).await?;
                } else {
                    debug!("Offer in unexpected state, ignoring");
                }
            }
        }
        Ok(())
    }

    /// Apply an event from the media layer.
    pub async fn handle_media_event(&mut self, event: CallEvent) -> Result<(), CallCtrlError> {
        match event {
            CallEvent::OfferCreated(offer) => {
                if let (Some(peer), true) = (self.peer.clone(), self.state.is_active()) {
                    self.emit(ClientEvent::Offer { to: peer, offer }).await?;
                }
            }

            CallEvent::AnswerCreated(answer) => {
                if let (Some(peer), true) = (self.peer.clone(), self.state.is_active()) {
                    self.emit(ClientEvent::Answer { to: peer, answer }).await?;
                }
            }

            CallEvent::IceCandidate(candidate) => {
                if let (Some(peer), true) = (self.peer.clone(), self.state.is_active()) {
                    self.emit(ClientEvent::Candidate {
                        to: peer,
                        candidate,
                    })
                    .await?;
                }
            }

            CallEvent::Connected => {
                if self.state.is_active() {
                    info!("Call connected");
                    self.state = CallState::Connected;
                    self.disarm_ring_timer();
                }
            }

            CallEvent::Retrying { attempt, .. } => {
                self.attempts = attempt;
            }

            CallEvent::Failed { reason, attempts } => {
                if self.state.is_active() || self.state == CallState::Failed {
                    warn!(reason = %reason, attempts, "Call failed");
                    self.attempts = attempts;
                    self.state = CallState::Failed;
                }
            }

            CallEvent::Error { step, detail } => {
                // Negotiation-step errors surface but do not tear the
                // call down; the user may retry.
                warn!(step = ?step, detail = %detail, "Media error");
            }

            CallEvent::Initialized { .. }
            | CallEvent::LocalStream { .. }
            | CallEvent::RemoteStream { .. }
            | CallEvent::IceStateChange { .. }
            | CallEvent::ConnectionStateChange { .. }
            | CallEvent::IceRestart => {}
        }
        Ok(())
    }

    /// Apply a ring-timer firing. Stale generations are ignored.
    pub async fn handle_ring_timeout(&mut self, timeout: RingTimeout) {
        if timeout.generation != self.generation {
            debug!("Stale ring timeout, ignoring");
            return;
        }
        if !matches!(self.state, CallState::Calling | CallState::Ringing) {
            return;
        }

        warn!("Call setup timed out");
        if let Some(peer) = self.peer.clone() {
            let _ = self.emit(ClientEvent::CallEnded { to: peer }).await;
        }
        self.teardown().await;
        self.state = CallState::Failed;
    }

    fn arm_ring_timer(&mut self) {
        let Some(timeout) = self.config.ring_timeout else {
            return;
        };
        let timer_tx = self.timer_tx.clone();
        let generation = self.generation;
        self.ring_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(RingTimeout { generation });
        }));
    }

    fn disarm_ring_timer(&mut self) {
        if let Some(task) = self.ring_task.take() {
            task.abort();
        }
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), CallCtrlError> {
        self.cmd_tx
            .send(SocketCommand::Emit(event))
            .await
            .map_err(|_| CallCtrlError::SocketClosed)
    }

    async fn teardown(&mut self) {
        self.disarm_ring_timer();
        self.session.cleanup().await;
        self.pending_offer = None;
        self.attempts = 0;
    }

    async fn reset(&mut self) {
        self.teardown().await;
        self.state = CallState::Idle;
        self.peer = None;
    }
}
