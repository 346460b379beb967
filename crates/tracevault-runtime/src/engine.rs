use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::warn;

use tracevault_engine::{AnalyticsEngine, ExportConfig, ExportMetadata, ExportService};
use tracevault_store::{
    IntegrityReport, IntegrityService, PressureLevel, ResourceManager, Store,
};
use tracevault_types::{
    AuditContext, AuditOp, EndRequest, EngineConfig, ErrorRecord, ErrorRequest, ErrorSeverity,
    EventFilter, EventRecord, EventType, ExportFilter, Result, SessionFilter, SessionRecord,
    SessionStatus, StartRequest, StoreStatistics, StreamRequest, METADATA_SCHEMA_VERSION,
};

use crate::batch::{BatchQueue, CompletionHook};
use crate::buffers::StreamBuffers;
use crate::monitor::{PerformanceMonitor, Thresholds};
use crate::timer::RepeatingTimer;

/// The telemetry engine handle: explicit construction, explicit shutdown.
///
/// Ingest follows the best-effort policy: validation and audit failures
/// propagate to the caller, raw persistence failures are logged, counted
/// in `events_dropped`, and swallowed so a storage hiccup never reaches
/// the calling agent's execution path.
pub struct TelemetryEngine {
    store: Store,
    integrity: IntegrityService,
    analytics: Arc<AnalyticsEngine>,
    export: ExportService,
    buffers: Arc<StreamBuffers>,
    queue: Arc<BatchQueue<EventRecord>>,
    monitor: Arc<PerformanceMonitor>,
    events_dropped: AtomicU64,
    timers: Mutex<Vec<RepeatingTimer>>,
}

impl TelemetryEngine {
    pub fn new(path: &Path, config: EngineConfig) -> Result<Self> {
        Self::with_store(Store::open(path, config)?)
    }

    /// In-memory engine, mainly for tests and ephemeral runs.
    pub fn new_in_memory(config: EngineConfig) -> Result<Self> {
        Self::with_store(Store::open_in_memory(config)?)
    }

    fn with_store(store: Store) -> Result<Self> {
        let resources = Arc::clone(store.resources());
        let integrity = IntegrityService::new(Arc::clone(&resources))?;
        let analytics = Arc::new(AnalyticsEngine::new(store.clone()));
        let export = ExportService::new(store.clone());
        let buffers = Arc::new(StreamBuffers::new(store.clone()));

        let batch_store = store.clone();
        let gate_resources = Arc::clone(&resources);
        let queue = Arc::new(BatchQueue::with_memory_gate(
            resources.config().clone(),
            move |events: &[EventRecord]| {
                batch_store.insert_event_batch(events)?;
                Ok(())
            },
            move || gate_resources.metrics().pressure != PressureLevel::Normal,
        ));

        let monitor = Arc::new(PerformanceMonitor::new(
            Arc::clone(&resources),
            Thresholds::default(),
            true,
        ));

        let engine = Self {
            store,
            integrity,
            analytics,
            export,
            buffers,
            queue,
            monitor,
            events_dropped: AtomicU64::new(0),
            timers: Mutex::new(Vec::new()),
        };
        engine.start_timers(&resources);
        Ok(engine)
    }

    fn start_timers(&self, resources: &Arc<ResourceManager>) {
        let config = resources.config();
        let mut timers = Vec::with_capacity(3);

        let flush_buffers = Arc::clone(&self.buffers);
        let flush_queue = Arc::clone(&self.queue);
        timers.push(RepeatingTimer::spawn(
            "tracevault-flush",
            config.buffer_flush_interval(),
            move || {
                flush_buffers.flush_stale();
                flush_queue.flush();
            },
        ));

        let cleanup_resources = Arc::clone(resources);
        let cleanup_analytics = Arc::clone(&self.analytics);
        timers.push(RepeatingTimer::spawn(
            "tracevault-cleanup",
            config.cleanup_interval(),
            move || {
                cleanup_resources.routine_cleanup();
                cleanup_analytics.refresh_cache();
            },
        ));

        let monitor_resources = Arc::clone(resources);
        let monitor = Arc::clone(&self.monitor);
        let monitored_queue = Arc::clone(&self.queue);
        timers.push(RepeatingTimer::spawn(
            "tracevault-monitor",
            config.monitor_interval(),
            move || {
                monitor_resources.sample_memory();
                monitor.sample(monitored_queue.occupancy());
            },
        ));

        *lock(&self.timers) = timers;
    }

    // ---- ingest -------------------------------------------------------

    /// Open a session and persist its `start` event immediately.
    pub fn start(&self, request: StartRequest) -> Result<()> {
        let session = SessionRecord {
            id: request.session_id.clone(),
            agent_type: request.agent_type.clone(),
            mode: request.mode.clone(),
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            event_count: 0,
            stream_event_count: 0,
            error_count: 0,
            sandbox_id: request.sandbox_id.clone(),
            repo_url: request.repo_url.clone(),
            metadata: request.metadata.clone(),
            version: 1,
            schema_version: METADATA_SCHEMA_VERSION.to_string(),
        };
        let event = EventRecord {
            id: 0,
            session_id: request.session_id.clone(),
            event_type: EventType::Start,
            agent_type: request.agent_type,
            mode: request.mode,
            prompt: request.prompt,
            stream_data: None,
            sandbox_id: request.sandbox_id,
            repo_url: request.repo_url,
            metadata: request.metadata,
            timestamp: Utc::now(),
            created_at: Utc::now(),
        };

        self.integrity
            .validate("sessions", &serde_json::to_value(&session)?)?;
        self.integrity
            .validate("events", &serde_json::to_value(&event)?)?;

        let previous = self.store.get_session(&session.id)?;
        let operation = if previous.is_some() {
            AuditOp::Update
        } else {
            AuditOp::Insert
        };
        self.integrity.record_audit(
            "sessions",
            &session.id,
            operation,
            previous.map(|p| serde_json::to_value(&p)).transpose()?.as_ref(),
            Some(&serde_json::to_value(&session)?),
            &ingest_context(&session.id),
        )?;

        if let Err(e) = self
            .store
            .upsert_session(&session)
            .and_then(|()| self.store.insert_event(&event))
        {
            self.drop_events(1, &session.id, "start persistence failed", &e);
        }
        self.analytics.invalidate_cache();
        Ok(())
    }

    /// Buffer a stream chunk; flushes once the buffer reaches the
    /// configured threshold.
    pub fn stream(&self, request: StreamRequest) -> Result<()> {
        let event = EventRecord {
            id: 0,
            session_id: request.session_id.clone(),
            event_type: EventType::Stream,
            agent_type: request.agent_type,
            mode: request.mode,
            prompt: request.prompt,
            stream_data: Some(request.stream_data),
            sandbox_id: None,
            repo_url: None,
            metadata: request.metadata,
            timestamp: Utc::now(),
            created_at: Utc::now(),
        };

        self.integrity
            .validate("events", &serde_json::to_value(&event)?)?;

        let session_id = event.session_id.clone();
        if let Err(e) = self.buffers.append(event) {
            self.drop_events(1, &session_id, "stream buffering failed", &e);
        }
        Ok(())
    }

    /// Close a session. The session's buffers flush first so the terminal
    /// event observes all prior stream data in storage.
    pub fn end(&self, request: EndRequest) -> Result<()> {
        self.finish_session(
            request.session_id,
            request.agent_type,
            request.mode,
            request.prompt,
            request.metadata,
            SessionStatus::Completed,
            EventType::End,
            None,
        )
    }

    /// Record a session failure: same flush ordering as `end`, plus an
    /// error record.
    pub fn error(&self, request: ErrorRequest) -> Result<()> {
        self.finish_session(
            request.session_id,
            request.agent_type,
            request.mode,
            request.prompt,
            request.metadata,
            SessionStatus::Failed,
            EventType::Error,
            Some(request.error_message),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_session(
        &self,
        session_id: String,
        agent_type: String,
        mode: String,
        prompt: String,
        metadata: Option<String>,
        status: SessionStatus,
        event_type: EventType,
        error_message: Option<String>,
    ) -> Result<()> {
        let event = EventRecord {
            id: 0,
            session_id: session_id.clone(),
            event_type,
            agent_type,
            mode,
            prompt,
            stream_data: None,
            sandbox_id: None,
            repo_url: None,
            metadata,
            timestamp: Utc::now(),
            created_at: Utc::now(),
        };
        self.integrity
            .validate("events", &serde_json::to_value(&event)?)?;

        let previous = self.store.get_session(&session_id)?;
        if let Some(previous) = &previous {
            let mut updated = serde_json::to_value(previous)?;
            updated["status"] = serde_json::to_value(status)?;
            self.integrity.record_audit(
                "sessions",
                &session_id,
                AuditOp::Update,
                Some(&serde_json::to_value(previous)?),
                Some(&updated),
                &ingest_context(&session_id),
            )?;
        }

        // Flush before persisting the terminal event so it observes all
        // prior stream data for the session in storage.
        let pending = self.buffers.pending_events(&session_id, &event.agent_type) as u64;
        if let Err(e) = self.buffers.flush_session(&session_id) {
            self.drop_events(pending, &session_id, "terminal flush failed", &e);
        }

        let persisted = self
            .store
            .insert_event(&event)
            .and_then(|_| self.store.set_session_status(&session_id, status))
            .and_then(|()| self.store.update_session_stats(&session_id));
        if let Err(e) = persisted {
            self.drop_events(1, &session_id, "terminal event persistence failed", &e);
        }

        if let Some(message) = error_message {
            let record = ErrorRecord {
                id: 0,
                session_id: Some(session_id.clone()),
                event_id: None,
                error_type: "session_error".to_string(),
                message,
                stack: None,
                severity: ErrorSeverity::High,
                resolved: false,
                timestamp: Utc::now(),
            };
            self.integrity
                .validate("errors", &serde_json::to_value(&record)?)?;
            if let Err(e) = self.store.insert_error(&record) {
                warn!(session_id = %session_id, error = %e, "error record persistence failed");
            }
        }

        self.analytics.invalidate_cache();
        Ok(())
    }

    /// Enqueue an event on the priority batch queue, for write paths that
    /// tolerate deferred persistence. The optional hook fires exactly once
    /// with the final outcome.
    pub fn enqueue_event(
        &self,
        event: EventRecord,
        priority: i64,
        hook: Option<CompletionHook>,
    ) -> Result<()> {
        self.integrity
            .validate("events", &serde_json::to_value(&event)?)?;
        self.queue.enqueue_with_hook(event, priority, hook)
    }

    fn drop_events(&self, count: u64, session_id: &str, what: &str, error: &dyn std::fmt::Display) {
        self.events_dropped.fetch_add(count.max(1), Ordering::Relaxed);
        warn!(session_id = %session_id, error = %error, "{}", what);
    }

    /// Events lost to the best-effort persistence policy since startup.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    // ---- query / analytics / export -----------------------------------

    pub fn query_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        self.store.query_sessions(filter)
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        self.store.query_events(filter)
    }

    pub fn analytics(&self) -> &AnalyticsEngine {
        &self.analytics
    }

    pub fn export(&self, filter: &ExportFilter, config: &ExportConfig) -> Result<ExportMetadata> {
        self.export.export(filter, config)
    }

    /// Store counters, overlaid with the engine's own dropped-event count.
    pub fn statistics(&self) -> Result<StoreStatistics> {
        let mut stats = self.store.get_statistics()?;
        stats.events_dropped = self.events_dropped();
        Ok(stats)
    }

    pub fn validate_database_integrity(&self) -> Result<IntegrityReport> {
        self.integrity.validate_database_integrity()
    }

    pub fn clear_all_data(&self) -> Result<()> {
        self.store.clear_all_data()?;
        self.analytics.invalidate_cache();
        Ok(())
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stop background timers and flush whatever is still buffered.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let mut timers = std::mem::take(&mut *lock(&self.timers));
        for timer in &mut timers {
            timer.stop();
        }

        let residual = self.buffers.buffer_count();
        if residual > 0 {
            warn!(buffers = residual, "flushing residual buffers at shutdown");
        }
        if let Err(e) = self.buffers.flush_all() {
            warn!(error = %e, "shutdown flush failed");
        }
        self.queue.flush();
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ingest_context(session_id: &str) -> AuditContext {
    AuditContext {
        actor: Some("telemetry-engine".to_string()),
        session_id: Some(session_id.to_string()),
        reason: None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
