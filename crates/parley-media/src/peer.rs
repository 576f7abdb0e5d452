//! Peer session: one media connection and its negotiation lifecycle.
//!
//! A [`PeerSession`] owns exactly one `RTCPeerConnection`. Direct calls
//! drive negotiation (offer/answer/candidates); everything asynchronous —
//! state changes, gathered candidates, inbound tracks, recovery — is
//! published on the session's [`CallEvent`] channel.
//!
//! Recovery: ICE `failed`/`disconnected` schedules a delayed ICE-restart
//! offer, at most [`CallConfig::max_retries`] times per session. Reaching
//! the cap emits a terminal `Failed` event; only `cleanup` resets the
//! counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use parley_shared::constants::{CALL_MAX_RETRIES, CALL_RETRY_DELAY_SECS};

use crate::capture::{self, AudioCapture, AudioConfig};
use crate::events::{CallEvent, ConnectionState, NegotiationStep};
use crate::ice::IceConfig;
use crate::retry::{RetryDecision, RetryPolicy, MAX_RETRIES_EXCEEDED};

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Media access failed: {0}")]
    MediaAccess(String),

    #[error("Failed to create offer: {0}")]
    CreateOffer(String),

    #[error("Failed to apply offer: {0}")]
    HandleOffer(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(String),

    #[error("Failed to apply answer: {0}")]
    HandleAnswer(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidate(String),

    #[error("ICE restart failed: {0}")]
    IceRestart(String),

    #[error("Peer connection not initialized")]
    NotInitialized,
}

/// Where local media samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Capture from the host's devices; a missing microphone is a
    /// terminal `MediaAccess` error.
    Device,
    /// The embedding application writes samples to the local tracks
    /// itself (headless use, tests).
    External,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice: IceConfig,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub capture: CaptureMode,
    pub audio: AudioConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            max_retries: CALL_MAX_RETRIES,
            retry_delay: Duration::from_secs(CALL_RETRY_DELAY_SECS),
            capture: CaptureMode::Device,
            audio: AudioConfig::default(),
        }
    }
}

/// Point-in-time snapshot for troubleshooting a call.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub connection_state: ConnectionState,
    pub ice_connection_state: String,
    pub is_initiator: bool,
    pub attempts: u32,
    pub has_peer_connection: bool,
    pub has_local_audio: bool,
    pub has_local_video: bool,
    pub pending_candidates: usize,
}

/// State shared with the connection observers and the watch task.
struct Shared {
    attempts: AtomicU32,
    connection_state: Mutex<ConnectionState>,
    ice_state: Mutex<String>,
}

impl Shared {
    fn new() -> Self {
        Self {
            attempts: AtomicU32::new(0),
            connection_state: Mutex::new(ConnectionState::Disconnected),
            ice_state: Mutex::new("new".to_string()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.connection_state.lock().expect("state lock") = state;
    }

    fn state(&self) -> ConnectionState {
        *self.connection_state.lock().expect("state lock")
    }
}

#[derive(Debug)]
pub(crate) enum WatchMsg {
    Failure,
    Connected,
    Cancel,
}

pub struct PeerSession {
    config: CallConfig,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    pc: Option<Arc<RTCPeerConnection>>,
    is_initiator: bool,
    remote_description_set: bool,
    /// Candidates that arrived before the remote description; flushed in
    /// arrival order once it is set.
    pending_candidates: Vec<RTCIceCandidateInit>,
    local_audio: Option<Arc<TrackLocalStaticSample>>,
    local_video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    audio_capture: Option<AudioCapture>,
    writer_task: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    watch_tx: Option<mpsc::UnboundedSender<WatchMsg>>,
    watch_task: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Create a session and the event stream its consumer subscribes to.
    pub fn new(config: CallConfig) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            events_tx,
            pc: None,
            is_initiator: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            local_audio: None,
            local_video: None,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            audio_capture: None,
            writer_task: None,
            shared: Arc::new(Shared::new()),
            watch_tx: None,
            watch_task: None,
        };
        (session, events_rx)
    }

    /// Allocate the peer connection and register the connection observers.
    ///
    /// Not safe to call twice on the same session: `cleanup` first.
    pub async fn initialize(&mut self, is_initiator: bool) -> Result<(), CallError> {
        if self.pc.is_some() {
            return Err(CallError::Initialization(
                "peer connection already exists, cleanup first".to_string(),
            ));
        }

        let pc = Arc::new(build_peer_connection(self.config.ice.rtc_configuration()).await?);

        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let watch_task = tokio::spawn(run_connection_watch(
            RetryPolicy::new(self.config.max_retries),
            self.config.retry_delay,
            watch_rx,
            self.events_tx.clone(),
            Arc::downgrade(&pc),
            self.shared.clone(),
        ));

        self.register_observers(&pc, watch_tx.clone());

        self.is_initiator = is_initiator;
        self.pc = Some(pc);
        self.watch_tx = Some(watch_tx);
        self.watch_task = Some(watch_task);

        info!(initiator = is_initiator, "Peer connection initialized");
        let _ = self.events_tx.send(CallEvent::Initialized { is_initiator });

        Ok(())
    }

    fn register_observers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        watch_tx: mpsc::UnboundedSender<WatchMsg>,
    ) {
        // ICE connection state drives the coarse state machine and recovery.
        let events = self.events_tx.clone();
        let shared = self.shared.clone();
        let watch = watch_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = events.clone();
            let shared = shared.clone();
            let watch = watch.clone();
            Box::pin(async move {
                debug!(state = %state, "ICE connection state changed");
                *shared.ice_state.lock().expect("ice state lock") = state.to_string();

                let attempts = shared.attempts.load(Ordering::Relaxed);
                let _ = events.send(CallEvent::IceStateChange {
                    state: state.to_string(),
                    attempts,
                });

                match state {
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        shared.set_state(ConnectionState::Connected);
                        let _ = watch.send(WatchMsg::Connected);
                        let _ = events.send(CallEvent::Connected);
                    }
                    RTCIceConnectionState::Checking => {
                        shared.set_state(ConnectionState::Connecting);
                    }
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected => {
                        shared.set_state(ConnectionState::Failed);
                        let _ = watch.send(WatchMsg::Failure);
                    }
                    _ => {}
                }
            })
        }));

        // Overall peer connection state, observable by the consumer.
        let events = self.events_tx.clone();
        let shared = self.shared.clone();
        let watch = watch_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let shared = shared.clone();
            let watch = watch.clone();
            Box::pin(async move {
                debug!(state = %state, "Peer connection state changed");
                let _ = events.send(CallEvent::ConnectionStateChange {
                    state: state.to_string(),
                });
                if state == RTCPeerConnectionState::Failed {
                    shared.set_state(ConnectionState::Failed);
                    let _ = watch.send(WatchMsg::Failure);
                }
            })
        }));

        // Locally gathered candidates, forwarded for transmission.
        let events = self.events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE candidate gathering completed");
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize ICE candidate");
                        return;
                    }
                };
                match serde_json::to_value(&init) {
                    Ok(value) => {
                        let _ = events.send(CallEvent::IceCandidate(value));
                    }
                    Err(e) => warn!(error = %e, "Failed to encode ICE candidate"),
                }
            })
        }));

        // Inbound media.
        let events = self.events_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let kind = track.kind().to_string();
                debug!(kind = %kind, "Received remote track");
                let _ = events.send(CallEvent::RemoteStream { kind });
            })
        }));
    }

    /// Set up the local tracks and attach them to the peer connection.
    ///
    /// In [`CaptureMode::Device`] this also starts microphone capture;
    /// a missing input device is a terminal `MediaAccess` error that must
    /// surface to the user, not retry.
    pub async fn acquire_local_media(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        if self.config.capture == CaptureMode::Device
            && constraints.audio
            && !capture::input_device_available()
        {
            return Err(CallError::MediaAccess(
                "no audio input device available".to_string(),
            ));
        }

        if constraints.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                "parley-stream".to_owned(),
            ));
            self.local_audio = Some(track);
        }

        if constraints.video {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                "parley-stream".to_owned(),
            ));
            self.local_video = Some(track);
        }

        if let Some(pc) = &self.pc {
            for track in [&self.local_audio, &self.local_video].into_iter().flatten() {
                pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| CallError::MediaAccess(e.to_string()))?;
            }
        }

        if self.config.capture == CaptureMode::Device {
            if let Some(track) = &self.local_audio {
                let mut audio_capture = AudioCapture::new(self.config.audio.clone());
                self.audio_enabled = audio_capture.enabled_flag();

                let (frame_tx, frame_rx) = mpsc::channel(32);
                audio_capture
                    .start_capture(frame_tx)
                    .map_err(|e| CallError::MediaAccess(e.to_string()))?;

                self.writer_task = Some(capture::spawn_track_writer(
                    Arc::clone(track),
                    frame_rx,
                    self.config.audio.clone(),
                ));
                self.audio_capture = Some(audio_capture);
            }
        }

        info!(
            audio = constraints.audio,
            video = constraints.video,
            "Local media ready"
        );
        let _ = self.events_tx.send(CallEvent::LocalStream {
            audio: constraints.audio,
            video: constraints.video,
        });

        Ok(())
    }

    /// Generate an offer and apply it as the local description.
    pub async fn create_offer(&mut self) -> Result<Value, CallError> {
        let pc = self.pc.as_ref().ok_or(CallError::NotInitialized)?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::CreateOffer(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::CreateOffer(e.to_string()))?;

        let value =
            serde_json::to_value(&offer).map_err(|e| CallError::CreateOffer(e.to_string()))?;

        debug!("Offer created and set as local description");
        let _ = self.events_tx.send(CallEvent::OfferCreated(value.clone()));

        Ok(value)
    }

    /// Apply a received offer as the remote description.
    pub async fn handle_offer(&mut self, offer: Value) -> Result<(), CallError> {
        let pc = self.pc.as_ref().ok_or(CallError::NotInitialized)?;

        let desc: RTCSessionDescription =
            serde_json::from_value(offer).map_err(|e| CallError::HandleOffer(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| CallError::HandleOffer(e.to_string()))?;

        debug!("Remote offer applied");
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        Ok(())
    }

    /// Generate an answer and apply it as the local description.
    pub async fn create_answer(&mut self) -> Result<Value, CallError> {
        let pc = self.pc.as_ref().ok_or(CallError::NotInitialized)?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::CreateAnswer(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::CreateAnswer(e.to_string()))?;

        let value =
            serde_json::to_value(&answer).map_err(|e| CallError::CreateAnswer(e.to_string()))?;

        debug!("Answer created and set as local description");
        let _ = self
            .events_tx
            .send(CallEvent::AnswerCreated(value.clone()));

        Ok(value)
    }

    /// Apply a received answer as the remote description.
    pub async fn handle_answer(&mut self, answer: Value) -> Result<(), CallError> {
        let pc = self.pc.as_ref().ok_or(CallError::NotInitialized)?;

        let desc: RTCSessionDescription =
            serde_json::from_value(answer).map_err(|e| CallError::HandleAnswer(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| CallError::HandleAnswer(e.to_string()))?;

        debug!("Remote answer applied");
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        Ok(())
    }

    /// Apply a remote candidate, buffering it if the remote description
    /// has not been set yet.
    pub async fn add_remote_candidate(&mut self, candidate: Value) -> Result<(), CallError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| CallError::AddIceCandidate(e.to_string()))?;

        if !self.remote_description_set {
            debug!("Buffering candidate received before remote description");
            self.pending_candidates.push(init);
            return Ok(());
        }

        let pc = self.pc.as_ref().ok_or(CallError::NotInitialized)?;
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| CallError::AddIceCandidate(e.to_string()))?;

        Ok(())
    }

    async fn flush_pending_candidates(&mut self) {
        let Some(pc) = self.pc.as_ref() else { return };

        for init in self.pending_candidates.drain(..) {
            if let Err(e) = pc.add_ice_candidate(init).await {
                warn!(error = %e, "Failed to apply buffered candidate");
                let _ = self.events_tx.send(CallEvent::Error {
                    step: NegotiationStep::AddIceCandidate,
                    detail: e.to_string(),
                });
            }
        }
    }

    /// Flip the local audio tracks' enabled state. No renegotiation.
    pub fn toggle_audio(&mut self) -> bool {
        if self.local_audio.is_none() {
            return false;
        }
        let enabled = !self.audio_enabled.load(Ordering::Relaxed);
        self.audio_enabled.store(enabled, Ordering::Relaxed);
        debug!(enabled, "Audio toggled");
        enabled
    }

    /// Flip the local video tracks' enabled state. No renegotiation.
    pub fn toggle_video(&mut self) -> bool {
        if self.local_video.is_none() {
            return false;
        }
        let enabled = !self.video_enabled.load(Ordering::Relaxed);
        self.video_enabled.store(enabled, Ordering::Relaxed);
        debug!(enabled, "Video toggled");
        enabled
    }

    /// Re-run connectivity negotiation on the existing connection.
    ///
    /// Used for manual recovery after a terminal failure; the automatic
    /// retry budget is not reset.
    pub async fn restart_ice(&mut self) -> Result<(), CallError> {
        let pc = self.pc.as_ref().ok_or(CallError::NotInitialized)?;

        let offer = ice_restart_offer(pc).await?;

        info!("Manual ICE restart");
        let _ = self.events_tx.send(CallEvent::IceRestart);
        let _ = self.events_tx.send(CallEvent::OfferCreated(offer));

        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.pc.is_some()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            connection_state: self.shared.state(),
            ice_connection_state: self
                .shared
                .ice_state
                .lock()
                .expect("ice state lock")
                .clone(),
            is_initiator: self.is_initiator,
            attempts: self.attempts(),
            has_peer_connection: self.pc.is_some(),
            has_local_audio: self.local_audio.is_some(),
            has_local_video: self.local_video.is_some(),
            pending_candidates: self.pending_candidates.len(),
        }
    }

    /// Release every resource and reset to the initial state.
    ///
    /// Safe to call from any state and any number of times.
    pub async fn cleanup(&mut self) {
        if let Some(watch_tx) = self.watch_tx.take() {
            let _ = watch_tx.send(WatchMsg::Cancel);
        }
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
        if let Some(mut audio_capture) = self.audio_capture.take() {
            audio_capture.stop();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                warn!(error = %e, "Error closing peer connection");
            }
        }

        self.local_audio = None;
        self.local_video = None;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.is_initiator = false;
        self.audio_enabled.store(true, Ordering::Relaxed);
        self.video_enabled.store(true, Ordering::Relaxed);
        self.shared.attempts.store(0, Ordering::Relaxed);
        self.shared.set_state(ConnectionState::Disconnected);
        *self.shared.ice_state.lock().expect("ice state lock") = "new".to_string();

        debug!("Peer session cleaned up");
    }
}

pub(crate) async fn build_peer_connection(
    config: RTCConfiguration,
) -> Result<RTCPeerConnection, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| CallError::Initialization(e.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| CallError::Initialization(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    api.new_peer_connection(config)
        .await
        .map_err(|e| CallError::Initialization(e.to_string()))
}

async fn ice_restart_offer(pc: &Arc<RTCPeerConnection>) -> Result<Value, CallError> {
    let options = RTCOfferOptions {
        ice_restart: true,
        ..Default::default()
    };

    let offer = pc
        .create_offer(Some(options))
        .await
        .map_err(|e| CallError::IceRestart(e.to_string()))?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(|e| CallError::IceRestart(e.to_string()))?;

    serde_json::to_value(&offer).map_err(|e| CallError::IceRestart(e.to_string()))
}

enum WatchStep {
    RetryDue,
    Msg(Option<WatchMsg>),
}

/// Recovery loop: turns failure notifications into delayed ICE restarts,
/// bounded by the retry policy. A `Connected` notification cancels a
/// pending restart; `Cancel` (or the session dropping the channel) ends
/// the loop.
pub(crate) async fn run_connection_watch(
    mut policy: RetryPolicy,
    retry_delay: Duration,
    mut watch_rx: mpsc::UnboundedReceiver<WatchMsg>,
    events: mpsc::UnboundedSender<CallEvent>,
    pc: Weak<RTCPeerConnection>,
    shared: Arc<Shared>,
) {
    let mut pending: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        let step = if let Some(sleep) = pending.as_mut() {
            tokio::select! {
                _ = sleep => WatchStep::RetryDue,
                msg = watch_rx.recv() => WatchStep::Msg(msg),
            }
        } else {
            WatchStep::Msg(watch_rx.recv().await)
        };

        match step {
            WatchStep::RetryDue => {
                pending = None;
                let Some(pc) = pc.upgrade() else { break };

                info!(attempt = policy.attempts(), "Attempting ICE restart");
                match ice_restart_offer(&pc).await {
                    Ok(offer) => {
                        let _ = events.send(CallEvent::IceRestart);
                        let _ = events.send(CallEvent::OfferCreated(offer));
                    }
                    Err(e) => {
                        warn!(error = %e, "ICE restart failed");
                        let _ = events.send(CallEvent::Error {
                            step: NegotiationStep::IceRestart,
                            detail: e.to_string(),
                        });
                    }
                }
            }

            WatchStep::Msg(Some(WatchMsg::Failure)) => {
                if pending.is_some() {
                    debug!("Retry already scheduled, ignoring failure");
                    continue;
                }
                match policy.on_failure() {
                    RetryDecision::Retry {
                        attempt,
                        max_retries,
                    } => {
                        shared.attempts.store(attempt, Ordering::Relaxed);
                        info!(attempt, max_retries, "Connection failed, scheduling ICE restart");
                        let _ = events.send(CallEvent::Retrying {
                            attempt,
                            max_retries,
                        });
                        pending = Some(Box::pin(tokio::time::sleep(retry_delay)));
                    }
                    RetryDecision::GiveUp => {
                        warn!(attempts = policy.attempts(), "Connection failed, retries exhausted");
                        let _ = events.send(CallEvent::Failed {
                            reason: MAX_RETRIES_EXCEEDED.to_string(),
                            attempts: policy.attempts(),
                        });
                    }
                    RetryDecision::Exhausted => {
                        debug!("Failure after terminal state, ignoring");
                    }
                }
            }

            WatchStep::Msg(Some(WatchMsg::Connected)) => {
                if pending.take().is_some() {
                    debug!("Connection recovered, cancelling pending retry");
                }
            }

            WatchStep::Msg(Some(WatchMsg::Cancel)) | WatchStep::Msg(None) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_config() -> CallConfig {
        CallConfig {
            ice: IceConfig::host_only(),
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            capture: CaptureMode::External,
            audio: AudioConfig::default(),
        }
    }

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<CallEvent>,
    ) -> CallEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Wait for the next event matching `pred`, skipping others.
    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<CallEvent>,
        pred: impl Fn(&CallEvent) -> bool,
    ) -> CallEvent {
        loop {
            let event = recv_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_initialize_twice_requires_cleanup() {
        let (mut session, _rx) = PeerSession::new(test_config());
        session.initialize(true).await.unwrap();
        assert!(matches!(
            session.initialize(true).await,
            Err(CallError::Initialization(_))
        ));

        session.cleanup().await;
        session.initialize(false).await.unwrap();
        session.cleanup().await;
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let (mut session, _rx) = PeerSession::new(test_config());
        assert!(matches!(
            session.create_offer().await,
            Err(CallError::NotInitialized)
        ));
        assert!(matches!(
            session.restart_ice().await,
            Err(CallError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (mut session, _rx) = PeerSession::new(test_config());
        session.initialize(true).await.unwrap();
        session
            .acquire_local_media(MediaConstraints::default())
            .await
            .unwrap();

        session.cleanup().await;
        let first = session.diagnostics();
        session.cleanup().await;
        let second = session.diagnostics();

        for d in [first, second] {
            assert!(!d.has_peer_connection);
            assert!(!d.has_local_audio);
            assert!(!d.has_local_video);
            assert_eq!(d.attempts, 0);
            assert_eq!(d.pending_candidates, 0);
            assert_eq!(d.connection_state, ConnectionState::Disconnected);
        }

        // Cleanup on a never-initialized session is also fine.
        let (mut fresh, _rx) = PeerSession::new(test_config());
        fresh.cleanup().await;
        fresh.cleanup().await;
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered_and_flushed() {
        let (mut caller, _caller_rx) = PeerSession::new(test_config());
        caller.initialize(true).await.unwrap();
        caller
            .acquire_local_media(MediaConstraints::default())
            .await
            .unwrap();
        let offer = caller.create_offer().await.unwrap();

        let (mut callee, _callee_rx) = PeerSession::new(test_config());
        callee.initialize(false).await.unwrap();

        // Candidate arrives before the offer: must buffer, not error.
        let candidate = serde_json::json!({
            "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        });
        callee.add_remote_candidate(candidate).await.unwrap();
        assert_eq!(callee.diagnostics().pending_candidates, 1);

        callee.handle_offer(offer).await.unwrap();
        assert_eq!(callee.diagnostics().pending_candidates, 0);

        caller.cleanup().await;
        callee.cleanup().await;
    }

    #[tokio::test]
    async fn test_toggle_without_media_reports_disabled() {
        let (mut session, _rx) = PeerSession::new(test_config());
        assert!(!session.toggle_audio());
        assert!(!session.toggle_video());
    }

    #[tokio::test]
    async fn test_toggles_flip_enabled_state() {
        let (mut session, _rx) = PeerSession::new(test_config());
        session.initialize(true).await.unwrap();
        session
            .acquire_local_media(MediaConstraints::default())
            .await
            .unwrap();

        assert!(!session.toggle_audio());
        assert!(session.toggle_audio());
        assert!(!session.toggle_video());
        assert!(session.toggle_video());

        session.cleanup().await;
    }

    #[tokio::test]
    async fn test_four_failures_give_three_retries_then_terminal() {
        let config = test_config();
        let pc = Arc::new(
            build_peer_connection(config.ice.rtc_configuration())
                .await
                .unwrap(),
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());

        let watch = tokio::spawn(run_connection_watch(
            RetryPolicy::new(3),
            Duration::from_millis(10),
            watch_rx,
            events_tx,
            Arc::downgrade(&pc),
            shared.clone(),
        ));

        for expected_attempt in 1..=3u32 {
            watch_tx.send(WatchMsg::Failure).unwrap();

            let event = wait_for(&mut events_rx, |e| {
                matches!(e, CallEvent::Retrying { .. })
            })
            .await;
            match event {
                CallEvent::Retrying {
                    attempt,
                    max_retries,
                } => {
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(max_retries, 3);
                }
                other => panic!("unexpected event: {other:?}"),
            }

            // Each scheduled retry performs an ICE restart before the
            // next failure is reported.
            wait_for(&mut events_rx, |e| matches!(e, CallEvent::IceRestart)).await;
            wait_for(&mut events_rx, |e| {
                matches!(e, CallEvent::OfferCreated(_))
            })
            .await;
        }

        // Fourth consecutive failure: terminal, no retry.
        watch_tx.send(WatchMsg::Failure).unwrap();
        let event = wait_for(&mut events_rx, |e| matches!(e, CallEvent::Failed { .. })).await;
        match event {
            CallEvent::Failed { reason, attempts } => {
                assert_eq!(reason, MAX_RETRIES_EXCEEDED);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Fifth failure: nothing further happens.
        watch_tx.send(WatchMsg::Failure).unwrap();
        assert!(
            timeout(Duration::from_millis(100), events_rx.recv())
                .await
                .is_err(),
            "no event expected after terminal failure"
        );

        watch_tx.send(WatchMsg::Cancel).unwrap();
        let _ = watch.await;
        let _ = pc.close().await;
    }

    #[tokio::test]
    async fn test_connected_cancels_pending_retry() {
        let config = test_config();
        let pc = Arc::new(
            build_peer_connection(config.ice.rtc_configuration())
                .await
                .unwrap(),
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());

        let watch = tokio::spawn(run_connection_watch(
            RetryPolicy::new(3),
            Duration::from_secs(2),
            watch_rx,
            events_tx,
            Arc::downgrade(&pc),
            shared.clone(),
        ));

        watch_tx.send(WatchMsg::Failure).unwrap();
        wait_for(&mut events_rx, |e| matches!(e, CallEvent::Retrying { .. })).await;

        // Recovery arrives before the backoff elapses: no restart fires.
        watch_tx.send(WatchMsg::Connected).unwrap();
        assert!(
            timeout(Duration::from_secs(3), events_rx.recv())
                .await
                .is_err(),
            "pending retry should have been cancelled"
        );

        watch_tx.send(WatchMsg::Cancel).unwrap();
        let _ = watch.await;
        let _ = pc.close().await;
    }
}
