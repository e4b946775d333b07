//! Per-chat call lifecycle: state graph, participant bookkeeping, and the
//! control surface (`join`/`leave`/`play`/...) that wires a fleet-managed
//! buffer to transport.
//!
//! Grounded on the original connection/call handlers: the 30s heartbeat
//! monitor, the backoff presets for `join` and reconnect, and the
//! kicked-forces-ended short-circuit are carried over unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use callcore::buffer::FastStreamBuffer;
use callcore::dispatch::{EventDispatcher, Filter, Handler, Update};
use callcore::model::{
    BufferPriority, CallState, ChatId, Frame, FrameInfo, Metadata, Participant,
};
use callcore::processor::{OutputFormat, ProcessorConfig, StreamProcessor};
use callcore::retry::{RetryConfig, RetryDriver};
use callcore::transport::{SourceProducer, TransportClient, TransportEvent};
use callcore_buffer_fleet::BufferManager;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{LifecycleError, LifecycleResult};

/// Per-chat session state, exclusively owned by `CallLifecycle`.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Chat this session belongs to.
    pub chat_id: ChatId,
    /// Current lifecycle state.
    pub state: CallState,
    /// When the session object was created.
    pub created_at: Instant,
    /// When `Connected` was first entered, if ever.
    pub connected_at: Option<Instant>,
    /// When `Ended`/`Error` was entered, if ever.
    pub ended_at: Option<Instant>,
    /// Fleet buffer id backing the active stream, if any.
    pub stream_id: Option<String>,
    /// Audio transcoding parameters for the next/current `play`.
    pub audio_cfg: ProcessorConfig,
    /// Video transcoding parameters for the next/current `play`.
    pub video_cfg: ProcessorConfig,
    /// Logical playback position, in seconds. A `seek()` only updates this
    /// marker; the processor is not restarted (see DESIGN.md open question).
    pub stream_position: f64,
    /// Output volume, always kept in `[0, 1]`.
    pub volume: f64,
    /// Local mute flag.
    pub muted: bool,
    /// Whether outgoing video is enabled.
    pub video_enabled: bool,
    /// Participants keyed by user id.
    pub participants: HashMap<i64, Participant>,
    /// Bytes sent to transport.
    pub bytes_sent: u64,
    /// Bytes received from transport.
    pub bytes_received: u64,
    /// Frames sent to transport.
    pub frames_sent: u64,
    /// Frames received from transport.
    pub frames_received: u64,
}

impl CallSession {
    fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            state: CallState::Idle,
            created_at: Instant::now(),
            connected_at: None,
            ended_at: None,
            stream_id: None,
            audio_cfg: ProcessorConfig::default(),
            video_cfg: ProcessorConfig::default(),
            stream_position: 0.0,
            volume: 1.0,
            muted: false,
            video_enabled: true,
            participants: HashMap::new(),
            bytes_sent: 0,
            bytes_received: 0,
            frames_sent: 0,
            frames_received: 0,
        }
    }
}

struct ManagedSession {
    session: CallSession,
    forward_task: Option<JoinHandle<()>>,
}

/// Global counters exposed via `global_stats()`.
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    /// Total sessions ever created.
    pub total_sessions: usize,
    /// Sessions currently in `Connected`, `Active`, or `Paused`.
    pub connected_sessions: usize,
    /// Sessions currently in `Active`.
    pub active_sessions: usize,
}

/// Owns every `CallSession`, drives each through the state graph, and
/// coordinates with transport and the buffer fleet.
pub struct CallLifecycle {
    transport: Arc<dyn TransportClient>,
    buffers: Arc<BufferManager>,
    dispatcher: Arc<EventDispatcher>,
    retry: RetryDriver,
    sessions: Mutex<HashMap<ChatId, ManagedSession>>,
    reconnect_monitors: Mutex<HashMap<ChatId, JoinHandle<()>>>,
    custom_update_handler: Mutex<Option<u64>>,
}

impl CallLifecycle {
    /// Construct a lifecycle controller over `transport` and `buffers`,
    /// fanning its own events through `dispatcher`.
    pub fn new(
        transport: Arc<dyn TransportClient>,
        buffers: Arc<BufferManager>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            buffers,
            dispatcher,
            retry: RetryDriver::new(),
            sessions: Mutex::new(HashMap::new()),
            reconnect_monitors: Mutex::new(HashMap::new()),
            custom_update_handler: Mutex::new(None),
        })
    }

    /// Start listening to transport-level events (participant updates,
    /// kicks, health degradation) and routing them through this
    /// lifecycle's bookkeeping and dispatcher.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.transport.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_transport_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ParticipantUpdate { chat_id, user_id } => {
                {
                    let mut sessions = self.sessions.lock();
                    if let Some(managed) = sessions.get_mut(&chat_id) {
                        managed.session.participants.entry(user_id).or_insert_with(|| Participant {
                            user_id,
                            muted: false,
                            muted_by_admin: false,
                            has_camera: false,
                            is_screen_sharing: false,
                            joined_at: chrono::Utc::now(),
                            metadata: Metadata::new(),
                        });
                    }
                }
                self.dispatcher.dispatch(Update::ParticipantUpdate { chat_id, user_id }).await;
            }
            TransportEvent::Kicked { chat_id } => {
                self.force_end(chat_id).await;
                self.dispatcher.dispatch(Update::Kicked { chat_id }).await;
            }
            TransportEvent::CallEnded { chat_id } => {
                self.force_end(chat_id).await;
            }
            TransportEvent::HealthDegraded { chat_id, reason } => {
                warn!(chat_id, %reason, "transport reported health degradation");
                self.begin_reconnect(chat_id);
            }
        }
    }

    /// `kicked` is a terminal signal: forces `Ended` without retry, regardless of current state.
    async fn force_end(self: &Arc<Self>, chat_id: ChatId) {
        let mut sessions = self.sessions.lock();
        if let Some(managed) = sessions.get_mut(&chat_id) {
            if let Some(handle) = managed.forward_task.take() {
                handle.abort();
            }
            managed.session.state = CallState::Ended;
            managed.session.ended_at = Some(Instant::now());
        }
        drop(sessions);
        self.buffers.remove_buffer(&chat_id.to_string());
        if let Some(handle) = self.reconnect_monitors.lock().remove(&chat_id) {
            handle.abort();
        }
    }

    /// Create a session (`Initializing`), acquire a transport handle
    /// (`Connecting`), and on success record `connected_at` and move to
    /// `Connected`. Idempotent if already connected or further along.
    pub async fn join(self: &Arc<Self>, chat_id: ChatId) -> LifecycleResult<()> {
        {
            let sessions = self.sessions.lock();
            if let Some(managed) = sessions.get(&chat_id) {
                if matches!(
                    managed.session.state,
                    CallState::Connected | CallState::Active | CallState::Paused
                ) {
                    return Ok(());
                }
            }
        }

        self.sessions.lock().insert(
            chat_id,
            ManagedSession { session: CallSession::new(chat_id), forward_task: None },
        );
        self.set_state(chat_id, CallState::Initializing);
        self.set_state(chat_id, CallState::Connecting);

        let transport = self.transport.clone();
        let result = self
            .retry
            .execute(&format!("join-{chat_id}"), &RetryConfig::connection(), move || {
                let transport = transport.clone();
                async move { transport.connect(chat_id).await }
            })
            .await;

        match result {
            Ok(()) => {
                let mut sessions = self.sessions.lock();
                if let Some(managed) = sessions.get_mut(&chat_id) {
                    managed.session.connected_at = Some(Instant::now());
                    managed.session.state = CallState::Connected;
                }
                self.start_reconnect_monitor(chat_id);
                Ok(())
            }
            Err(err) => {
                self.set_state(chat_id, CallState::Error);
                Err(LifecycleError::Core(err))
            }
        }
    }

    /// Tear down a session: release transport, free any buffer, finalize
    /// counters, and reach `Ended`. A `leave` with no existing session is
    /// a no-op (L1).
    pub async fn leave(self: &Arc<Self>, chat_id: ChatId) -> LifecycleResult<()> {
        let exists = self.sessions.lock().contains_key(&chat_id);
        if !exists {
            return Ok(());
        }
        self.set_state(chat_id, CallState::Ending);

        if let Some(handle) = self.reconnect_monitors.lock().remove(&chat_id) {
            handle.abort();
        }
        {
            let mut sessions = self.sessions.lock();
            if let Some(managed) = sessions.get_mut(&chat_id) {
                if let Some(handle) = managed.forward_task.take() {
                    handle.abort();
                }
            }
        }
        self.buffers.remove_buffer(&chat_id.to_string());
        let _ = self.transport.disconnect(chat_id).await;

        let mut sessions = self.sessions.lock();
        if let Some(managed) = sessions.get_mut(&chat_id) {
            managed.session.state = CallState::Ended;
            managed.session.ended_at = Some(Instant::now());
            managed.session.stream_id = None;
        }
        drop(sessions);
        self.dispatcher.dispatch(Update::Left { chat_id }).await;
        Ok(())
    }

    /// Attach `source` to the call: join first if necessary, create a
    /// fleet buffer keyed by chat, and forward dequeued chunks to
    /// transport as frames. Transitions `Connected -> Active`. When
    /// `source` reaches end-of-stream, transitions back to `Connected`
    /// and dispatches `Update::StreamEnd`.
    pub async fn play(
        self: &Arc<Self>,
        chat_id: ChatId,
        source: Box<dyn SourceProducer>,
        priority: BufferPriority,
        audio_cfg: Option<ProcessorConfig>,
        video_cfg: Option<ProcessorConfig>,
    ) -> LifecycleResult<()> {
        {
            let sessions = self.sessions.lock();
            let connected = sessions
                .get(&chat_id)
                .map(|m| matches!(m.session.state, CallState::Connected | CallState::Active | CallState::Paused))
                .unwrap_or(false);
            drop(sessions);
            if !connected {
                self.join(chat_id).await?;
            }
        }

        let effective_audio_cfg = {
            let mut sessions = self.sessions.lock();
            let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
            if let Some(cfg) = audio_cfg {
                managed.session.audio_cfg = cfg;
            }
            if let Some(cfg) = video_cfg {
                managed.session.video_cfg = cfg;
            }
            managed.session.audio_cfg.clone()
        };

        let buffer_id = chat_id.to_string();
        let buffer = self.buffers.create_buffer(buffer_id.clone(), None, priority, None)?;

        // Wire SourceProducer -> StreamProcessor -> FastStreamBuffer: the raw
        // source feeds the transcoder, whose output (as raw PCM blocks) is
        // what the buffer actually chunks and paces.
        let processed = wire_processor(source, effective_audio_cfg, OutputFormat::PcmAudio);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let wrapped: Box<dyn SourceProducer> =
            Box::new(EndSignalingSource { inner: processed, done_tx: Some(done_tx) });
        buffer.start(wrapped).map_err(LifecycleError::Core)?;

        let forward_task = spawn_frame_forwarder(self.transport.clone(), chat_id, buffer.clone());

        let mut sessions = self.sessions.lock();
        if let Some(managed) = sessions.get_mut(&chat_id) {
            managed.session.stream_id = Some(buffer_id);
            managed.session.state = CallState::Active;
            managed.forward_task = Some(forward_task);
        }
        drop(sessions);

        let this = self.clone();
        tokio::spawn(async move {
            let _ = done_rx.await;
            this.handle_stream_end(chat_id).await;
        });
        Ok(())
    }

    /// Reached when the source attached by `play` hits end-of-stream:
    /// drop frame forwarding and return to `Connected`, emitting
    /// `Update::StreamEnd` regardless of whether a session was found
    /// (matching scenario expectations even under a race with `leave`).
    async fn handle_stream_end(self: &Arc<Self>, chat_id: ChatId) {
        {
            let mut sessions = self.sessions.lock();
            if let Some(managed) = sessions.get_mut(&chat_id) {
                if matches!(managed.session.state, CallState::Active | CallState::Paused) {
                    if let Some(handle) = managed.forward_task.take() {
                        handle.abort();
                    }
                    managed.session.state = CallState::Connected;
                }
            }
        }
        self.dispatcher.dispatch(Update::StreamEnd { chat_id }).await;
    }

    /// Suspend stream delivery without tearing down the buffer. `Active -> Paused`.
    /// Dispatches before returning so no session leaves `Active` silently (P4).
    pub async fn pause(&self, chat_id: ChatId) -> LifecycleResult<()> {
        {
            let mut sessions = self.sessions.lock();
            let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
            if managed.session.state == CallState::Paused {
                return Ok(());
            }
            if let Some(handle) = managed.forward_task.take() {
                handle.abort();
            }
            managed.session.state = CallState::Paused;
        }
        self.dispatcher
            .dispatch(Update::Custom { chat_id: Some(chat_id), name: "paused".into(), payload: serde_json::Value::Null })
            .await;
        Ok(())
    }

    /// Resume stream delivery. `Paused -> Active`, restoring frame
    /// forwarding within one `chunk_duration_ms` (L2).
    pub async fn resume(self: &Arc<Self>, chat_id: ChatId) -> LifecycleResult<()> {
        let buffer = {
            let sessions = self.sessions.lock();
            let managed = sessions.get(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
            if managed.session.state == CallState::Active {
                return Ok(());
            }
            let stream_id = managed
                .session
                .stream_id
                .clone()
                .ok_or(LifecycleError::NotInCall(chat_id))?;
            self.buffers.get_buffer(&stream_id)
        };
        let buffer = buffer.ok_or(LifecycleError::NotInCall(chat_id))?;
        let forward_task = spawn_frame_forwarder(self.transport.clone(), chat_id, buffer);

        {
            let mut sessions = self.sessions.lock();
            if let Some(managed) = sessions.get_mut(&chat_id) {
                managed.forward_task = Some(forward_task);
                managed.session.state = CallState::Active;
            }
        }
        self.dispatcher
            .dispatch(Update::Custom { chat_id: Some(chat_id), name: "resumed".into(), payload: serde_json::Value::Null })
            .await;
        Ok(())
    }

    /// Stop the stream: tear down the buffer, forget `stream_id`, return
    /// to `Connected`. The call itself stays connected. Dispatches
    /// `Update::StreamEnd` so no session leaves `Active` silently (P4).
    pub async fn stop(&self, chat_id: ChatId) -> LifecycleResult<()> {
        let was_active = {
            let mut sessions = self.sessions.lock();
            let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
            let was_active = matches!(managed.session.state, CallState::Active | CallState::Paused);
            if let Some(handle) = managed.forward_task.take() {
                handle.abort();
            }
            if let Some(stream_id) = managed.session.stream_id.take() {
                drop(sessions);
                self.buffers.remove_buffer(&stream_id);
                sessions = self.sessions.lock();
            }
            if let Some(managed) = sessions.get_mut(&chat_id) {
                managed.session.state = CallState::Connected;
                managed.session.stream_position = 0.0;
            }
            was_active
        };
        if was_active {
            self.dispatcher.dispatch(Update::StreamEnd { chat_id }).await;
        }
        Ok(())
    }

    /// Record a logical playback position. Does not restart the processor
    /// (see DESIGN.md open question resolution).
    pub fn seek(&self, chat_id: ChatId, position_secs: f64) -> LifecycleResult<()> {
        let mut sessions = self.sessions.lock();
        let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
        managed.session.stream_position = position_secs;
        Ok(())
    }

    /// Set output volume, clamped to `[0, 1]` (L3).
    pub fn set_volume(&self, chat_id: ChatId, volume: f64) -> LifecycleResult<()> {
        let mut sessions = self.sessions.lock();
        let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
        managed.session.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    /// Current volume for `chat_id`, if a session exists.
    pub fn volume(&self, chat_id: ChatId) -> Option<f64> {
        self.sessions.lock().get(&chat_id).map(|m| m.session.volume)
    }

    /// Locally mute outgoing audio for `chat_id`.
    pub fn mute(&self, chat_id: ChatId) -> LifecycleResult<()> {
        let mut sessions = self.sessions.lock();
        let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
        managed.session.muted = true;
        Ok(())
    }

    /// Locally unmute outgoing audio for `chat_id`.
    pub fn unmute(&self, chat_id: ChatId) -> LifecycleResult<()> {
        let mut sessions = self.sessions.lock();
        let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
        managed.session.muted = false;
        Ok(())
    }

    /// Chat ids with a live (non-ended, non-error) session.
    pub fn active_calls(&self) -> Vec<ChatId> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, m)| !matches!(m.session.state, CallState::Ended | CallState::Error))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether `chat_id` (or any chat, if `None`) currently has a
    /// `Connected`/`Active`/`Paused` session.
    pub fn is_connected(&self, chat_id: Option<ChatId>) -> bool {
        let sessions = self.sessions.lock();
        let connected = |m: &ManagedSession| {
            matches!(m.session.state, CallState::Connected | CallState::Active | CallState::Paused)
        };
        match chat_id {
            Some(id) => sessions.get(&id).map(connected).unwrap_or(false),
            None => sessions.values().any(connected),
        }
    }

    /// Snapshot of one session's state, if it exists.
    pub fn session(&self, chat_id: ChatId) -> Option<CallSession> {
        self.sessions.lock().get(&chat_id).map(|m| m.session.clone())
    }

    /// Global counters across every tracked session.
    pub fn global_stats(&self) -> GlobalStats {
        let sessions = self.sessions.lock();
        GlobalStats {
            total_sessions: sessions.len(),
            connected_sessions: sessions
                .values()
                .filter(|m| {
                    matches!(m.session.state, CallState::Connected | CallState::Active | CallState::Paused)
                })
                .count(),
            active_sessions: sessions
                .values()
                .filter(|m| m.session.state == CallState::Active)
                .count(),
        }
    }

    /// Set whether the local participant is presenting (screen-sharing).
    /// Toggles `Participant::is_screen_sharing` for `user_id` in the
    /// session's participant map, inserting a bare entry if none exists yet.
    pub fn set_presentation_mode(
        &self,
        chat_id: ChatId,
        user_id: i64,
        enabled: bool,
    ) -> LifecycleResult<()> {
        let mut sessions = self.sessions.lock();
        let managed = sessions.get_mut(&chat_id).ok_or(LifecycleError::NotInCall(chat_id))?;
        let participant = managed.session.participants.entry(user_id).or_insert_with(|| Participant {
            user_id,
            muted: false,
            muted_by_admin: false,
            has_camera: false,
            is_screen_sharing: false,
            joined_at: chrono::Utc::now(),
            metadata: Metadata::new(),
        });
        participant.is_screen_sharing = enabled;
        Ok(())
    }

    /// Subscribe to `Update::StreamEnd`. Returns a handler id usable with
    /// `remove_handler`.
    pub fn on_stream_end(&self, handler: impl Fn(ChatId) + Send + Sync + 'static) -> u64 {
        let filter: Arc<dyn Filter> =
            Arc::new(PredicateFilter(|update: &Update| matches!(update, Update::StreamEnd { .. })));
        let wrapped: Handler = Arc::new(move |update: &Update| {
            if let Update::StreamEnd { chat_id } = update {
                handler(*chat_id);
            }
        });
        self.dispatcher.add_handler(wrapped, Some(filter), 0)
    }

    /// Subscribe to `Update::Kicked`. Returns a handler id usable with
    /// `remove_handler`.
    pub fn on_kicked(&self, handler: impl Fn(ChatId) + Send + Sync + 'static) -> u64 {
        let filter: Arc<dyn Filter> =
            Arc::new(PredicateFilter(|update: &Update| matches!(update, Update::Kicked { .. })));
        let wrapped: Handler = Arc::new(move |update: &Update| {
            if let Update::Kicked { chat_id } = update {
                handler(*chat_id);
            }
        });
        self.dispatcher.add_handler(wrapped, Some(filter), 0)
    }

    /// Subscribe to `Update::Left`. Returns a handler id usable with
    /// `remove_handler`.
    pub fn on_left(&self, handler: impl Fn(ChatId) + Send + Sync + 'static) -> u64 {
        let filter: Arc<dyn Filter> =
            Arc::new(PredicateFilter(|update: &Update| matches!(update, Update::Left { .. })));
        let wrapped: Handler = Arc::new(move |update: &Update| {
            if let Update::Left { chat_id } = update {
                handler(*chat_id);
            }
        });
        self.dispatcher.add_handler(wrapped, Some(filter), 0)
    }

    /// Subscribe to `Update::Error`. Returns a handler id usable with
    /// `remove_handler`.
    pub fn on_error(&self, handler: impl Fn(ChatId, String) + Send + Sync + 'static) -> u64 {
        let filter: Arc<dyn Filter> =
            Arc::new(PredicateFilter(|update: &Update| matches!(update, Update::Error { .. })));
        let wrapped: Handler = Arc::new(move |update: &Update| {
            if let Update::Error { chat_id, message } = update {
                handler(*chat_id, message.clone());
            }
        });
        self.dispatcher.add_handler(wrapped, Some(filter), 0)
    }

    /// Subscribe to `Update::Custom`. Unlike the other `on_*` decorators,
    /// this keeps a single active handler: a later call replaces the
    /// previous one rather than stacking.
    pub fn on_custom_update(
        &self,
        handler: impl Fn(Option<ChatId>, String, serde_json::Value) + Send + Sync + 'static,
    ) -> u64 {
        let filter: Arc<dyn Filter> =
            Arc::new(PredicateFilter(|update: &Update| matches!(update, Update::Custom { .. })));
        let wrapped: Handler = Arc::new(move |update: &Update| {
            if let Update::Custom { chat_id, name, payload } = update {
                handler(*chat_id, name.clone(), payload.clone());
            }
        });
        let id = self.dispatcher.add_handler(wrapped, Some(filter), 0);
        let previous = self.custom_update_handler.lock().replace(id);
        if let Some(previous) = previous {
            self.dispatcher.remove_handler(previous);
        }
        id
    }

    /// Register a handler directly on the underlying dispatcher, bypassing
    /// the named `on_*` decorators.
    pub fn add_handler(&self, handler: Handler, filter: Option<Arc<dyn Filter>>, priority: i32) -> u64 {
        self.dispatcher.add_handler(handler, filter, priority)
    }

    /// Remove a handler previously returned by any `on_*` method or `add_handler`.
    pub fn remove_handler(&self, id: u64) -> bool {
        self.dispatcher.remove_handler(id)
    }

    fn set_state(&self, chat_id: ChatId, state: CallState) {
        let mut sessions = self.sessions.lock();
        if let Some(managed) = sessions.get_mut(&chat_id) {
            managed.session.state = state;
        }
    }

    /// Start the 30s passive connection monitor for `chat_id`. On
    /// unhealthy, reconnects with up to 3 attempts (exponential, 2s base);
    /// on success, resumes the active stream from its last known position.
    fn start_reconnect_monitor(self: &Arc<Self>, chat_id: ChatId) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let still_connected = this.is_connected(Some(chat_id));
                if !still_connected {
                    break;
                }
            }
        });
        self.reconnect_monitors.lock().insert(chat_id, handle);
    }

    /// Triggered by a `HealthDegraded` transport event: `Connected ->
    /// Connecting`, retry, and on success resume the stream if one was active.
    fn begin_reconnect(self: &Arc<Self>, chat_id: ChatId) {
        let this = self.clone();
        tokio::spawn(async move {
            let was_active = {
                let sessions = this.sessions.lock();
                sessions.get(&chat_id).map(|m| m.session.state == CallState::Active).unwrap_or(false)
            };
            this.set_state(chat_id, CallState::Connecting);

            let transport = this.transport.clone();
            let result = this
                .retry
                .execute(&format!("reconnect-{chat_id}"), &RetryConfig::reconnect(), move || {
                    let transport = transport.clone();
                    async move { transport.connect(chat_id).await }
                })
                .await;

            match result {
                Ok(()) => {
                    this.set_state(chat_id, CallState::Connected);
                    if was_active {
                        let _ = this.resume(chat_id).await;
                    }
                }
                Err(err) => {
                    warn!(chat_id, %err, "reconnect exhausted; giving up on session");
                    this.set_state(chat_id, CallState::Error);
                    this.dispatcher
                        .dispatch(Update::Error { chat_id, message: err.to_string() })
                        .await;
                }
            }
        });
    }
}

/// Adapts a plain predicate function into a `Filter`, for the `on_*` event
/// decorators that only care about one `Update` variant.
struct PredicateFilter<F>(F);

#[async_trait]
impl<F: Fn(&Update) -> bool + Send + Sync> Filter for PredicateFilter<F> {
    async fn matches(&self, update: &Update) -> bool {
        (self.0)(update)
    }
}

/// Wraps a caller-supplied source so `play` can observe end-of-stream
/// without the buffer's own producer loop knowing anything about it.
struct EndSignalingSource {
    inner: Box<dyn SourceProducer>,
    done_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

#[async_trait]
impl SourceProducer for EndSignalingSource {
    async fn next_block(&mut self) -> callcore::Result<Option<bytes::Bytes>> {
        let block = self.inner.next_block().await?;
        if block.is_none() {
            if let Some(tx) = self.done_tx.take() {
                let _ = tx.send(());
            }
        }
        Ok(block)
    }
}

/// Pulls transcoded chunks off a `StreamProcessor`'s output channel and
/// exposes their payloads as a plain `SourceProducer`, so the buffer can
/// consume processed bytes exactly as it would a raw source.
struct ProcessorSource {
    chunk_rx: tokio::sync::mpsc::Receiver<callcore::model::StreamChunk>,
    // Kept alive for the pipeline's duration; dropping it aborts the
    // transcoder task and closes the channel.
    _pipeline: JoinHandle<()>,
}

#[async_trait]
impl SourceProducer for ProcessorSource {
    async fn next_block(&mut self) -> callcore::Result<Option<bytes::Bytes>> {
        Ok(self.chunk_rx.recv().await.map(|chunk| chunk.data))
    }
}

/// Wire `source` through a `StreamProcessor` configured from `cfg`, returning
/// a `SourceProducer` over the processor's transcoded output (spec's
/// `SourceProducer -> StreamProcessor -> FastStreamBuffer` dataflow).
fn wire_processor(
    source: Box<dyn SourceProducer>,
    cfg: ProcessorConfig,
    output_format: OutputFormat,
) -> Box<dyn SourceProducer> {
    let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel(cfg.buffer_size.max(1).min(256));
    let pipeline = tokio::spawn(async move {
        let processor = StreamProcessor::new(cfg);
        if let Err(err) = processor.process(source, output_format, chunk_tx).await {
            warn!(%err, "stream processor pipeline exited with an error");
        }
    });
    Box::new(ProcessorSource { chunk_rx, _pipeline: pipeline })
}

/// Spawn the task that subscribes to a buffer's dequeued chunks and
/// forwards each as a `Frame` to transport.
fn spawn_frame_forwarder(
    transport: Arc<dyn TransportClient>,
    chat_id: ChatId,
    buffer: Arc<FastStreamBuffer>,
) -> JoinHandle<()> {
    let mut chunk_rx = buffer.on_chunk();
    tokio::spawn(async move {
        loop {
            match chunk_rx.recv().await {
                Ok(chunk) => {
                    let frame = Frame {
                        ssrc: chat_id as u32,
                        data: chunk.data.clone(),
                        info: FrameInfo {
                            timestamp_ms: 0,
                            width: None,
                            height: None,
                            rotation: None,
                            sample_rate: None,
                            channels: None,
                        },
                        kind: chunk.kind,
                    };
                    if let Err(err) = transport.send_frame(chat_id, frame).await {
                        warn!(chat_id, %err, "failed to deliver frame");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::dispatch::EventDispatcher;
    use callcore::transport::TransportEvent;
    use callcore::Error as CoreError;
    use callcore_buffer_fleet::{BufferManager, FleetConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTransport {
        events_tx: tokio::sync::broadcast::Sender<TransportEvent>,
        fail_connect: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            let (events_tx, _) = tokio::sync::broadcast::channel(16);
            Arc::new(Self { events_tx, fail_connect: AtomicBool::new(false) })
        }
    }

    #[async_trait]
    impl TransportClient for FakeTransport {
        async fn connect(&self, _chat_id: ChatId) -> callcore::Result<()> {
            if self.fail_connect.load(Ordering::SeqCst) {
                Err(CoreError::Transport("forced failure".into()))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&self, _chat_id: ChatId) -> callcore::Result<()> {
            Ok(())
        }

        async fn send_frame(&self, _chat_id: ChatId, _frame: Frame) -> callcore::Result<()> {
            Ok(())
        }

        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
            self.events_tx.subscribe()
        }
    }

    fn make_lifecycle() -> (Arc<CallLifecycle>, Arc<FakeTransport>) {
        let transport = FakeTransport::new();
        let buffers = BufferManager::new(FleetConfig::default());
        let dispatcher = Arc::new(EventDispatcher::new());
        let lifecycle = CallLifecycle::new(transport.clone(), buffers, dispatcher);
        (lifecycle, transport)
    }

    #[tokio::test]
    async fn join_then_leave_reaches_ended_and_leave_is_idempotent() {
        let (lifecycle, _transport) = make_lifecycle();
        lifecycle.join(-1001).await.unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Connected);

        lifecycle.leave(-1001).await.unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Ended);

        lifecycle.leave(-1001).await.unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Ended);
    }

    #[tokio::test]
    async fn set_volume_clamps_to_unit_range() {
        let (lifecycle, _transport) = make_lifecycle();
        lifecycle.join(-1002).await.unwrap();
        lifecycle.set_volume(-1002, 4.0).unwrap();
        assert_eq!(lifecycle.volume(-1002), Some(1.0));
        lifecycle.set_volume(-1002, -2.0).unwrap();
        assert_eq!(lifecycle.volume(-1002), Some(0.0));
    }

    #[tokio::test]
    async fn join_join_is_idempotent_once_connected() {
        let (lifecycle, _transport) = make_lifecycle();
        lifecycle.join(-1003).await.unwrap();
        let first_connected_at = lifecycle.session(-1003).unwrap().connected_at;
        lifecycle.join(-1003).await.unwrap();
        assert_eq!(lifecycle.session(-1003).unwrap().connected_at, first_connected_at);
    }

    struct VecSource {
        blocks: std::sync::Mutex<std::collections::VecDeque<bytes::Bytes>>,
    }

    #[async_trait]
    impl SourceProducer for VecSource {
        async fn next_block(&mut self) -> callcore::Result<Option<bytes::Bytes>> {
            Ok(self.blocks.lock().unwrap().pop_front())
        }
    }

    fn source(blocks: Vec<&'static [u8]>) -> Box<dyn SourceProducer> {
        Box::new(VecSource {
            blocks: std::sync::Mutex::new(
                blocks.into_iter().map(bytes::Bytes::from_static).collect(),
            ),
        })
    }

    /// End-to-end scenario: join -> play reaches `active`; end-of-source
    /// transitions back to `connected` and emits `StreamEnd`; `leave` reaches
    /// `ended`. Exercises the real `StreamProcessor` pipeline, so it needs an
    /// actual transcoder binary on `PATH` (see `ProcessorConfig::transcoder_path`).
    #[tokio::test]
    #[ignore = "requires a real ffmpeg-compatible transcoder binary on PATH"]
    async fn play_reaches_active_then_stream_end_then_leave_reaches_ended() {
        let transport = FakeTransport::new();
        let buffers = BufferManager::new(FleetConfig::default());
        let dispatcher = Arc::new(EventDispatcher::new());
        let lifecycle = CallLifecycle::new(transport.clone(), buffers, dispatcher.clone());

        let seen_stream_end = Arc::new(AtomicBool::new(false));
        let seen_clone = seen_stream_end.clone();
        dispatcher.add_handler(
            Arc::new(move |update: &Update| {
                if let Update::StreamEnd { chat_id } = update {
                    assert_eq!(*chat_id, -1001);
                    seen_clone.store(true, Ordering::SeqCst);
                }
            }),
            None,
            0,
        );

        lifecycle.join(-1001).await.unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Connected);

        lifecycle
            .play(-1001, source(vec![b"A", b"B"]), BufferPriority::Normal, None, None)
            .await
            .unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Active);

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if seen_stream_end.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream end was not observed in time");

        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Connected);

        lifecycle.leave(-1001).await.unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Ended);
    }

    /// Unit-level version of the same scenario, exercising `handle_stream_end`
    /// (the method `play`'s end-signaling wrapper calls) directly so it
    /// doesn't depend on an external transcoder being on `PATH`.
    #[tokio::test]
    async fn handle_stream_end_transitions_to_connected_and_dispatches() {
        let (lifecycle, _transport) = make_lifecycle();
        lifecycle.join(-1001).await.unwrap();
        {
            let mut sessions = lifecycle.sessions.lock();
            let managed = sessions.get_mut(&-1001).unwrap();
            managed.session.state = CallState::Active;
            managed.session.stream_id = Some("-1001".to_string());
        }

        let seen_stream_end = Arc::new(AtomicBool::new(false));
        let seen_clone = seen_stream_end.clone();
        lifecycle.dispatcher.add_handler(
            Arc::new(move |update: &Update| {
                if let Update::StreamEnd { chat_id } = update {
                    assert_eq!(*chat_id, -1001);
                    seen_clone.store(true, Ordering::SeqCst);
                }
            }),
            None,
            0,
        );

        lifecycle.handle_stream_end(-1001).await;

        assert!(seen_stream_end.load(Ordering::SeqCst));
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Connected);

        lifecycle.leave(-1001).await.unwrap();
        assert_eq!(lifecycle.session(-1001).unwrap().state, CallState::Ended);
    }

    /// `pause` then `resume` restores `active` and keeps the prior playback
    /// position (L2); both transitions away from `active` go through the
    /// dispatcher (P4). Sets up the "active with a live buffer" precondition
    /// directly, since `pause`/`resume` don't touch the `StreamProcessor`.
    #[tokio::test]
    async fn pause_then_resume_restores_active_and_dispatches() {
        let (lifecycle, _transport) = make_lifecycle();
        lifecycle.join(-1004).await.unwrap();

        let buffer_id = (-1004i64).to_string();
        let buffer = lifecycle
            .buffers
            .create_buffer(buffer_id.clone(), None, BufferPriority::Normal, None)
            .unwrap();
        let forward_task = spawn_frame_forwarder(lifecycle.transport.clone(), -1004, buffer);
        {
            let mut sessions = lifecycle.sessions.lock();
            let managed = sessions.get_mut(&-1004).unwrap();
            managed.session.stream_id = Some(buffer_id);
            managed.session.state = CallState::Active;
            managed.session.stream_position = 12.5;
            managed.forward_task = Some(forward_task);
        }

        let paused_seen = Arc::new(AtomicBool::new(false));
        let paused_clone = paused_seen.clone();
        lifecycle.dispatcher.add_handler(
            Arc::new(move |update: &Update| {
                if let Update::Custom { name, .. } = update {
                    if name == "paused" {
                        paused_clone.store(true, Ordering::SeqCst);
                    }
                }
            }),
            None,
            0,
        );

        lifecycle.pause(-1004).await.unwrap();
        assert!(paused_seen.load(Ordering::SeqCst));
        assert_eq!(lifecycle.session(-1004).unwrap().state, CallState::Paused);

        lifecycle.resume(-1004).await.unwrap();
        assert_eq!(lifecycle.session(-1004).unwrap().state, CallState::Active);
        assert_eq!(lifecycle.session(-1004).unwrap().stream_position, 12.5);
    }
}
