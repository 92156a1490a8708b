#![warn(missing_docs)]

//! # kiln-engine
//!
//! The session and execution engine behind the Kiln broker.
//!
//! [`Broker`] wires the components together and is the single entry point the
//! tool surface talks to: admission (rate limit), policy screening, session
//! lifecycle, workspace provisioning, subprocess execution, helper children
//! for web-IDE and browser sessions, and health/metrics reporting.
//!
//! Request path for `execute_code`:
//! admission → policy screener → session resolve/create → workspace ensure →
//! execution engine → touch + metrics → (transient teardown) → report.

pub mod exec;
pub mod health;
pub mod kinds;
pub mod metrics;
pub mod policy;
pub mod ports;
pub mod sessions;
pub mod workspace;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiln_admission::{RateLimitConfig, RateLimitDecision, RateLimiter};
use kiln_config::KilnConfig;
use kiln_error::BrokerError;
use kiln_model::{ExecOutcome, ExecRequest, LanguageId, Session, SessionKind, SessionStatus};
use kiln_store::{RedisTier, SessionStore};
use tokio::process::Child;

pub use exec::{ExecConfig, ExecutionEngine};
pub use health::{HealthReport, HealthStatus};
pub use metrics::Metrics;
pub use policy::PolicyScreener;
pub use ports::PortPool;
pub use sessions::SessionManager;
pub use workspace::Provisioner;

/// Result of one `execute_code` call: the outcome plus which session ran it.
#[derive(Debug)]
pub struct ExecutionReport {
    /// The session the code ran in.
    pub session_id: String,
    /// Whether the session was created and destroyed around this call.
    pub transient: bool,
    /// Captured output, exit code, timing, memory.
    pub outcome: ExecOutcome,
}

/// Everything a fresh browser-automation session exposes to its caller.
#[derive(Debug)]
pub struct PlaywrightInfo {
    /// The session record.
    pub session: Session,
    /// Chosen browser engine.
    pub browser: String,
    /// Whether the browser runs headless.
    pub headless: bool,
    /// Viewport (width, height).
    pub viewport: (u32, u32),
    /// Browser context id (equals the session id).
    pub context_id: String,
    /// Initial page URL.
    pub initial_page: String,
}

/// The assembled broker.
pub struct Broker {
    config: KilnConfig,
    sessions: SessionManager,
    provisioner: Arc<Provisioner>,
    screener: PolicyScreener,
    limiter: RateLimiter,
    engine: ExecutionEngine,
    ports: PortPool,
    metrics: Arc<Metrics>,
    monitor: health::HealthMonitor,
    redis: Option<Arc<RedisTier>>,
    helpers: Mutex<std::collections::HashMap<String, Child>>,
}

impl Broker {
    /// Wire a broker from configuration and an optional durable tier.
    pub fn new(config: KilnConfig, redis: Option<Arc<RedisTier>>) -> Arc<Self> {
        let store = Arc::new(SessionStore::new(
            redis.clone().map(|r| r as Arc<dyn kiln_store::SessionTier>),
        ));
        let sessions = SessionManager::new(store, config.sessions.max_per_client);
        let provisioner = Arc::new(Provisioner::new(config.data_root.clone()));
        let limiter = RateLimiter::new(RateLimitConfig {
            points: config.rate_limit.points,
            window: Duration::from_secs(config.rate_limit.window_secs),
            block: Duration::from_secs(config.rate_limit.block_secs),
        });
        let engine = ExecutionEngine::new(ExecConfig {
            max_concurrent: config.execution.max_concurrent,
            queue_wait: config.execution.queue_wait(),
            dispatch_burst_per_sec: config.execution.dispatch_burst_per_sec,
            ..ExecConfig::default()
        });

        Arc::new(Self {
            config,
            sessions,
            provisioner,
            screener: PolicyScreener::new(),
            limiter,
            engine,
            ports: PortPool::default(),
            metrics: Arc::new(Metrics::new()),
            monitor: health::HealthMonitor::new(),
            redis,
            helpers: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// One-time startup: provision base workspaces and sweep leftovers from
    /// earlier runs.
    pub async fn startup(&self) {
        let swept = self
            .provisioner
            .sweep_stale(self.config.sessions.timeout())
            .await;
        if swept > 0 {
            tracing::info!(swept, "removed stale session workspaces at startup");
        }
    }

    /// Provision base workspaces. Separate from [`Broker::startup`] so tests
    /// and fast boots can skip toolchain downloads.
    pub async fn provision_languages(&self) {
        self.provisioner.ensure_base_workspaces().await;
    }

    /// The metric surface, for export endpoints.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The broker configuration.
    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    /// Admission check: one token per request per caller identity.
    fn admit(&self, identity: &str) -> Result<(), BrokerError> {
        match self.limiter.consume(identity, 1) {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Blocked { retry_after } => {
                self.metrics.record_error("RATE_LIMITED");
                Err(BrokerError::RateLimited {
                    retry_after_secs: retry_after.as_secs().max(1),
                })
            }
        }
    }

    /// Run code, creating a transient session when none is named.
    pub async fn execute_code(
        &self,
        identity: &str,
        req: ExecRequest,
    ) -> Result<ExecutionReport, BrokerError> {
        self.admit(identity)?;

        if req.code.trim().is_empty() {
            return Err(BrokerError::BadRequest {
                reason: "code must not be empty".into(),
            });
        }

        // Hard policy gate before any resource is touched.
        let verdict = self.screener.screen(req.language, &req.code);
        if !verdict.valid {
            self.metrics.record_error("POLICY_REJECTED");
            return Err(BrokerError::PolicyRejected {
                reason: verdict.reason.unwrap_or("policy").to_string(),
            });
        }

        let (session, transient) = match &req.session_id {
            Some(id) => (self.sessions.get_live(id).await?, false),
            None => {
                let session = self
                    .sessions
                    .create_session(
                        SessionKind::Execution,
                        Some(req.language),
                        "1g",
                        identity,
                        self.provisioner.sessions_root(),
                    )
                    .await?;
                self.metrics.record_session_op("create");
                (session, true)
            }
        };

        let result = self.execute_in_session(&session, &req).await;

        if transient {
            // The transient workspace lives exactly as long as the call.
            if let Err(e) = self.destroy_by_record(&session.id).await {
                tracing::warn!(session_id = %session.id, error = %e, "transient teardown failed");
            }
        } else {
            let _ = self.sessions.touch(&session.id).await;
        }

        match result {
            Ok(outcome) => {
                self.metrics
                    .record_execution(req.language.as_str(), outcome.wall_time_ms as f64);
                Ok(ExecutionReport {
                    session_id: session.id,
                    transient,
                    outcome,
                })
            }
            Err(e) => {
                self.metrics.record_error(e.code());
                Err(e)
            }
        }
    }

    async fn execute_in_session(
        &self,
        session: &Session,
        req: &ExecRequest,
    ) -> Result<ExecOutcome, BrokerError> {
        // Make sure the workspace exists (transient sessions, or a session
        // whose directory was swept while idle).
        let workspace = self
            .provisioner
            .session_workspace(&session.id)
            .await
            .map_err(BrokerError::internal)?;
        debug_assert_eq!(workspace, session.workspace_dir);

        if session.status == SessionStatus::Creating {
            // First use promotes a freshly provisioned session.
            let _ = self
                .sessions
                .update_status(&session.id, SessionStatus::Running)
                .await;
        }

        let base = if self.provisioner.is_degraded(req.language) {
            None
        } else {
            self.provisioner.base_workspace(req.language)
        };

        self.engine.execute(session, base.as_deref(), req).await
    }

    /// Create a web-IDE session: workspace, template skeleton, helper on a
    /// pooled port when the helper binary is available.
    pub async fn create_vscode_session(
        &self,
        identity: &str,
        language: Option<LanguageId>,
        template: &str,
        memory: &str,
    ) -> Result<Session, BrokerError> {
        self.admit(identity)?;

        if !kinds::VSCODE_TEMPLATES.contains(&template) {
            return Err(BrokerError::BadRequest {
                reason: format!(
                    "unknown template '{template}' (expected one of {})",
                    kinds::VSCODE_TEMPLATES.join(", ")
                ),
            });
        }
        if !kinds::VSCODE_MEMORY.contains(&memory) {
            return Err(BrokerError::BadRequest {
                reason: format!(
                    "unknown memory budget '{memory}' (expected one of {})",
                    kinds::VSCODE_MEMORY.join(", ")
                ),
            });
        }

        let session = self
            .sessions
            .create_session(
                SessionKind::Vscode,
                language,
                memory,
                identity,
                self.provisioner.sessions_root(),
            )
            .await?;
        self.metrics.record_session_op("create");

        let workspace = match self.provisioner.session_workspace(&session.id).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = self
                    .sessions
                    .update_status(&session.id, SessionStatus::Error)
                    .await;
                return Err(BrokerError::internal(e));
            }
        };

        if let Err(e) = kinds::scaffold_template(&workspace, template, language).await {
            let _ = self
                .sessions
                .update_status(&session.id, SessionStatus::Error)
                .await;
            return Err(BrokerError::internal(e));
        }

        // Helper is optional: without a port or binary the session stays
        // workspace-only with no endpoint.
        if let Some(port) = self.ports.acquire() {
            match kinds::spawn_vscode_helper(&workspace, port) {
                Ok(child) => {
                    let pid = child.id().map(|p| p.to_string());
                    self.helpers
                        .lock()
                        .expect("helper registry lock poisoned")
                        .insert(session.id.clone(), child);
                    self.metrics.record_container_op("spawn");
                    self.metrics.ports_in_use.set(self.ports.in_use_count() as i64);

                    let url = format!("http://{}:{}", self.config.vscode.host, port);
                    self.sessions
                        .set_endpoints(
                            &session.id,
                            [("vscode".to_string(), url)],
                            Some(port),
                            pid,
                        )
                        .await?;
                }
                Err(e) => {
                    self.ports.release(port);
                    tracing::warn!(
                        session_id = %session.id,
                        error = %e,
                        "web-IDE helper unavailable, session is workspace-only"
                    );
                }
            }
        } else {
            tracing::warn!(session_id = %session.id, "no free helper port, session is workspace-only");
        }

        self.sessions
            .update_status(&session.id, SessionStatus::Running)
            .await
    }

    /// Create a browser-automation session. The Playwright install is
    /// best-effort and runs in the background.
    pub async fn create_playwright_session(
        &self,
        identity: &str,
        browser: &str,
        headless: bool,
        viewport: (u32, u32),
        memory: &str,
    ) -> Result<PlaywrightInfo, BrokerError> {
        self.admit(identity)?;

        if !kinds::BROWSERS.contains(&browser) {
            return Err(BrokerError::BadRequest {
                reason: format!(
                    "unknown browser '{browser}' (expected one of {})",
                    kinds::BROWSERS.join(", ")
                ),
            });
        }
        if !kinds::PLAYWRIGHT_MEMORY.contains(&memory) {
            return Err(BrokerError::BadRequest {
                reason: format!(
                    "unknown memory budget '{memory}' (expected one of {})",
                    kinds::PLAYWRIGHT_MEMORY.join(", ")
                ),
            });
        }
        if !kinds::VIEWPORT_WIDTH.contains(&viewport.0)
            || !kinds::VIEWPORT_HEIGHT.contains(&viewport.1)
        {
            return Err(BrokerError::BadRequest {
                reason: format!("viewport {}x{} out of range", viewport.0, viewport.1),
            });
        }

        let session = self
            .sessions
            .create_session(
                SessionKind::Playwright,
                None,
                memory,
                identity,
                self.provisioner.sessions_root(),
            )
            .await?;
        self.metrics.record_session_op("create");

        let workspace = match self.provisioner.session_workspace(&session.id).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = self
                    .sessions
                    .update_status(&session.id, SessionStatus::Error)
                    .await;
                return Err(BrokerError::internal(e));
            }
        };

        {
            let browser = browser.to_string();
            tokio::spawn(async move {
                kinds::install_playwright(&workspace, &browser).await;
            });
        }

        let session = self
            .sessions
            .update_status(&session.id, SessionStatus::Running)
            .await?;

        Ok(PlaywrightInfo {
            context_id: session.id.clone(),
            session,
            browser: browser.to_string(),
            headless,
            viewport,
            initial_page: kinds::INITIAL_PAGE.to_string(),
        })
    }

    /// Sessions owned by the calling identity.
    pub async fn list_sessions(&self, identity: &str) -> Result<Vec<Session>, BrokerError> {
        self.admit(identity)?;
        self.metrics.record_session_op("list");
        self.sessions.list_sessions(Some(identity)).await
    }

    /// One session by id, owner-scoped.
    pub async fn get_session(&self, identity: &str, id: &str) -> Result<Session, BrokerError> {
        self.admit(identity)?;
        self.metrics.record_session_op("get");
        let session = self
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                session_id: id.to_string(),
            })?;
        if session.owner_client_id != identity {
            return Err(BrokerError::NotFound {
                session_id: id.to_string(),
            });
        }
        Ok(session)
    }

    /// Destroy a session and everything it holds. Idempotent.
    pub async fn destroy_session(&self, identity: &str, id: &str) -> Result<bool, BrokerError> {
        self.admit(identity)?;

        if let Some(session) = self.sessions.get(id).await? {
            if session.owner_client_id != identity {
                return Err(BrokerError::NotFound {
                    session_id: id.to_string(),
                });
            }
        }

        let destroyed = self.destroy_by_record(id).await?;
        if destroyed {
            self.metrics.record_session_op("destroy");
        }
        Ok(destroyed)
    }

    /// Teardown shared by destroy, transient cleanup, and expiry: record
    /// removal, helper reap, port release, workspace removal, lock cleanup.
    async fn destroy_by_record(&self, id: &str) -> Result<bool, BrokerError> {
        let Some(session) = self.sessions.destroy_session(id).await? else {
            return Ok(false);
        };

        let helper = self
            .helpers
            .lock()
            .expect("helper registry lock poisoned")
            .remove(id);
        if let Some(mut child) = helper {
            stop_helper(&mut child).await;
            self.metrics.record_container_op("kill");
        }

        if let Some(port) = session.bound_port {
            self.ports.release(port);
            self.metrics.ports_in_use.set(self.ports.in_use_count() as i64);
        }

        self.provisioner.destroy_session_workspace(id).await;
        self.engine.forget_session(id);
        Ok(true)
    }

    /// Remove sessions idle past the configured threshold. Returns how many
    /// were destroyed.
    pub async fn cleanup_expired(&self) -> usize {
        let threshold = self.config.sessions.timeout();
        let expired = match self.sessions.expired_sessions(threshold).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!(error = %e, "expiry scan failed");
                return 0;
            }
        };

        let mut destroyed = 0;
        for session in expired {
            match self.destroy_by_record(&session.id).await {
                Ok(true) => {
                    destroyed += 1;
                    self.metrics.record_session_op("expire");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "expiry teardown failed");
                }
            }
        }
        if destroyed > 0 {
            tracing::info!(destroyed, "expired sessions cleaned up");
        }
        destroyed
    }

    /// Periodic near-cache eviction plus limiter pruning.
    pub fn background_tick(&self) {
        let evicted = self.sessions.store().evict_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "near-cache entries expired");
        }
        self.limiter.prune_idle(Duration::from_secs(3600));
    }

    /// Sweep stale workspaces left by dead sessions.
    pub async fn sweep_stale_workspaces(&self) -> usize {
        self.provisioner
            .sweep_stale(self.config.sessions.timeout())
            .await
    }

    /// Assemble the health document.
    pub async fn health(&self, detailed: bool) -> HealthReport {
        let started = Instant::now();
        let store_health = self.sessions.store().health().await;
        let sessions = self
            .sessions
            .list_sessions(None)
            .await
            .unwrap_or_default();

        let mut breakers = self.engine.breaker_snapshots();
        if let Some(redis) = &self.redis {
            breakers.push(("redis".to_string(), redis.breaker().snapshot()));
        }

        self.metrics.active_sessions.set(
            sessions
                .iter()
                .filter(|s| !s.status.is_terminal())
                .count() as i64,
        );
        self.metrics
            .execution_slots_free
            .set(self.engine.available_slots() as i64);

        let report = self.monitor.report(
            &store_health,
            &self.provisioner.degraded_languages(),
            &sessions,
            &breakers,
            self.engine.available_slots(),
            self.ports.in_use_count(),
            detailed,
        );
        self.metrics
            .record_request("system_health", started.elapsed().as_millis() as f64);
        report
    }

    /// Prometheus text export.
    pub fn export_metrics(&self) -> String {
        self.metrics.export_text()
    }

    /// Execution-time quantiles for the detailed health view.
    pub fn execution_quantiles(&self) -> Option<metrics::Quantiles> {
        self.metrics.quantiles("execution_duration_ms")
    }

    /// Supported language descriptors, for tool schemas and reports.
    pub fn languages(&self) -> BTreeMap<&'static str, &'static str> {
        kiln_model::LanguageSpec::all()
            .iter()
            .map(|spec| (spec.id.as_str(), spec.display_name))
            .collect()
    }
}

/// Stop a helper child: polite signal, short grace, forceful kill.
async fn stop_helper(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a valid signal on a pid we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
