#![warn(missing_docs)]

//! # kiln-server
//!
//! MCP server for the Kiln code-execution broker.
//!
//! Exposes exactly five tools to agents:
//! - `execute_code` — run a snippet in an isolated language workspace
//! - `create_vscode_session` — provision a web-IDE workspace
//! - `create_playwright_session` — provision a browser-automation workspace
//! - `manage_sessions` — list, inspect, and destroy sessions
//! - `system_health` — broker liveness, resource use, session statistics
//!
//! Every tool body is the same pipeline: resolve the caller identity, hand
//! the request to the [`Broker`], and render the result as a uniform text
//! report (or a structured error report on failure).

use std::sync::Arc;
use std::time::Instant;

use kiln_engine::Broker;
use kiln_error::BrokerError;
use kiln_model::{ExecRequest, LanguageId, Session};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars::JsonSchema;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Deserialize;

/// The identity attributed to stdio callers. The stdio transport carries no
/// peer address, so every caller on one connection shares a bucket.
const STDIO_IDENTITY: &str = "local";

/// The Kiln MCP server handler.
#[derive(Clone)]
pub struct KilnServer {
    broker: Arc<Broker>,
    identity: String,
    tool_router: ToolRouter<Self>,
}

impl KilnServer {
    /// Create a server over a wired broker, using the stdio identity.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self::with_identity(broker, STDIO_IDENTITY)
    }

    /// Create a server with an explicit caller identity (tests, embedding).
    pub fn with_identity(broker: Arc<Broker>, identity: impl Into<String>) -> Self {
        Self {
            broker,
            identity: identity.into(),
            tool_router: Self::tool_router(),
        }
    }

    fn render_error(&self, err: &BrokerError) -> String {
        self.broker.metrics().record_error(err.code());
        let known: Vec<&str> = LanguageId::ALL.iter().map(|l| l.as_str()).collect();
        let structured = err.to_structured(Some(&known));
        let mut report = format!("Error [{}]: {}", err.code(), err);
        if let Some(fix) = structured.get("suggested_fix").and_then(|v| v.as_str()) {
            report.push_str(&format!("\n{fix}"));
        }
        if err.retryable() {
            report.push_str("\nThis error is retryable.");
        }
        report
    }
}

/// Input for the `execute_code` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeInput {
    /// Language id: python, javascript, typescript, java, c, cpp, csharp,
    /// rust, go, php, perl, ruby, lua, swift, or objc. Case-sensitive.
    pub language: String,
    /// The source code to run. Must be non-empty.
    pub code: String,
    /// Reuse an existing execution session. When absent, a transient
    /// workspace is created for this call and destroyed afterwards.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
    /// Wall-clock budget in milliseconds, 1000–300000 (default 30000).
    /// Values outside the range are clamped.
    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    /// Text written once to the program's stdin.
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Input for the `create_vscode_session` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateVscodeInput {
    /// Language to prepare the workspace for.
    #[serde(default)]
    pub language: Option<String>,
    /// Project template: basic, web, api, data-science, or
    /// machine-learning. Default basic.
    #[serde(default)]
    pub template: Option<String>,
    /// Memory budget: 1g, 2g, 4g, or 8g. Default 2g.
    #[serde(default)]
    pub memory: Option<String>,
}

/// Viewport for a browser session.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ViewportInput {
    /// Width in pixels, 320–3840.
    pub width: u32,
    /// Height in pixels, 240–2160.
    pub height: u32,
}

/// Input for the `create_playwright_session` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreatePlaywrightInput {
    /// Browser engine: chromium, firefox, or webkit. Default chromium.
    #[serde(default)]
    pub browser: Option<String>,
    /// Run the browser headless. Default true.
    #[serde(default)]
    pub headless: Option<bool>,
    /// Initial viewport. Default 1280x720.
    #[serde(default)]
    pub viewport: Option<ViewportInput>,
    /// Memory budget: 2g, 4g, or 8g. Default 2g.
    #[serde(default)]
    pub memory: Option<String>,
}

/// Input for the `manage_sessions` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ManageSessionsInput {
    /// One of: list, get, destroy.
    pub action: String,
    /// Session id; required for get and destroy.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Input for the `system_health` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SystemHealthInput {
    /// Include per-component detail. Default false.
    #[serde(default)]
    pub detailed: Option<bool>,
}

fn parse_language(token: &str) -> Result<LanguageId, BrokerError> {
    LanguageId::parse(token).ok_or_else(|| BrokerError::Unsupported {
        language: token.to_string(),
    })
}

fn render_session(session: &Session) -> String {
    let mut out = format!(
        "Session ID: {}\nType: {}\nStatus: {}\nMemory: {}\nOwner: {}\nCreated: {}\nLast Accessed: {}",
        session.id,
        session.kind.as_str(),
        session.status.as_str(),
        session.memory_budget,
        session.owner_client_id,
        session.created_at.to_rfc3339(),
        session.last_accessed_at.to_rfc3339(),
    );
    if let Some(language) = session.language {
        out.push_str(&format!("\nLanguage: {language}"));
    }
    for (name, url) in &session.endpoints {
        out.push_str(&format!("\nEndpoint ({name}): {url}"));
    }
    if let Some(port) = session.bound_port {
        out.push_str(&format!("\nBound Port: {port}"));
    }
    out
}

#[tool_router(router = tool_router)]
impl KilnServer {
    /// Execute code in an isolated language workspace.
    #[tool(
        name = "execute_code",
        description = "Execute code in an isolated workspace. Supports python, javascript, typescript, java, c, cpp, csharp, rust, go, php, perl, ruby, lua, swift, and objc. Pass sessionId to reuse a workspace across calls; otherwise a transient workspace is created and destroyed around the call. Returns captured output, exit code, execution time, and memory usage. timeoutMs is clamped to 1000-300000 (default 30000)."
    )]
    pub async fn execute_code(
        &self,
        Parameters(input): Parameters<ExecuteCodeInput>,
    ) -> Result<String, String> {
        let started = Instant::now();
        tracing::info!(language = %input.language, code_len = input.code.len(), "execute_code: starting");

        let result = async {
            let language = parse_language(&input.language)?;
            let report = self
                .broker
                .execute_code(
                    &self.identity,
                    ExecRequest {
                        language,
                        code: input.code,
                        session_id: input.session_id,
                        stdin: input.stdin,
                        timeout_ms: input.timeout_ms,
                    },
                )
                .await?;
            Ok::<_, BrokerError>(report)
        }
        .await;

        self.broker
            .metrics()
            .record_request("execute_code", started.elapsed().as_millis() as f64);

        match result {
            Ok(report) => {
                let outcome = &report.outcome;
                let mut text = String::new();
                if !outcome.stdout.is_empty() {
                    text.push_str(&format!("Output:\n{}\n", outcome.stdout));
                }
                if !outcome.stderr.is_empty() {
                    text.push_str(&format!("Errors:\n{}\n", outcome.stderr));
                }
                text.push_str(&format!("Exit Code: {}\n", outcome.exit_code));
                text.push_str(&format!("Execution Time: {} ms\n", outcome.wall_time_ms));
                if let Some(mib) = outcome.peak_memory_mib {
                    text.push_str(&format!("Memory Usage: {mib} MiB\n"));
                }
                text.push_str(&format!(
                    "Session: {}{}",
                    report.session_id,
                    if report.transient { " (transient)" } else { "" }
                ));
                tracing::info!(
                    exit_code = outcome.exit_code,
                    wall_time_ms = outcome.wall_time_ms,
                    "execute_code: complete"
                );
                Ok(text)
            }
            Err(e) => {
                tracing::warn!(error = %e, "execute_code: failed");
                Err(self.render_error(&e))
            }
        }
    }

    /// Create a web-IDE session.
    #[tool(
        name = "create_vscode_session",
        description = "Create a persistent web-IDE workspace session. Optionally pick a language, a project template (basic, web, api, data-science, machine-learning), and a memory budget (1g, 2g, 4g, 8g). Returns the session id and, when the IDE helper is available, an http endpoint URL."
    )]
    pub async fn create_vscode_session(
        &self,
        Parameters(input): Parameters<CreateVscodeInput>,
    ) -> Result<String, String> {
        let started = Instant::now();
        let template = input.template.as_deref().unwrap_or("basic").to_string();
        let memory = input.memory.as_deref().unwrap_or("2g").to_string();

        let result = async {
            let language = match &input.language {
                Some(token) => Some(parse_language(token)?),
                None => None,
            };
            self.broker
                .create_vscode_session(&self.identity, language, &template, &memory)
                .await
        }
        .await;

        self.broker
            .metrics()
            .record_request("create_vscode_session", started.elapsed().as_millis() as f64);

        match result {
            Ok(session) => {
                let endpoint = session
                    .endpoints
                    .get("vscode")
                    .cloned()
                    .unwrap_or_else(|| "(helper unavailable, workspace only)".into());
                Ok(format!(
                    "Session ID: {}\nLanguage: {}\nTemplate: {}\nMemory: {}\nStatus: {}\nEndpoint: {}",
                    session.id,
                    session
                        .language
                        .map(|l| l.as_str())
                        .unwrap_or("(none)"),
                    template,
                    session.memory_budget,
                    session.status.as_str(),
                    endpoint,
                ))
            }
            Err(e) => {
                tracing::warn!(error = %e, "create_vscode_session: failed");
                Err(self.render_error(&e))
            }
        }
    }

    /// Create a browser-automation session.
    #[tool(
        name = "create_playwright_session",
        description = "Create a browser-automation workspace session. Optionally pick the browser engine (chromium, firefox, webkit), headless mode, viewport (320-3840 x 240-2160), and memory budget (2g, 4g, 8g). Returns the session id, browser context id, and initial page URL (about:blank)."
    )]
    pub async fn create_playwright_session(
        &self,
        Parameters(input): Parameters<CreatePlaywrightInput>,
    ) -> Result<String, String> {
        let started = Instant::now();
        let browser = input.browser.as_deref().unwrap_or("chromium").to_string();
        let headless = input.headless.unwrap_or(true);
        let viewport = input
            .viewport
            .map(|v| (v.width, v.height))
            .unwrap_or((1280, 720));
        let memory = input.memory.as_deref().unwrap_or("2g").to_string();

        let result = self
            .broker
            .create_playwright_session(&self.identity, &browser, headless, viewport, &memory)
            .await;

        self.broker.metrics().record_request(
            "create_playwright_session",
            started.elapsed().as_millis() as f64,
        );

        match result {
            Ok(info) => {
                let endpoints = if info.session.endpoints.is_empty() {
                    "(none)".to_string()
                } else {
                    info.session
                        .endpoints
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                Ok(format!(
                    "Session ID: {}\nBrowser: {}\nHeadless: {}\nViewport: {}x{}\nMemory: {}\nStatus: {}\nEndpoints: {}\nContext ID: {}\nInitial Page: {}",
                    info.session.id,
                    info.browser,
                    info.headless,
                    info.viewport.0,
                    info.viewport.1,
                    info.session.memory_budget,
                    info.session.status.as_str(),
                    endpoints,
                    info.context_id,
                    info.initial_page,
                ))
            }
            Err(e) => {
                tracing::warn!(error = %e, "create_playwright_session: failed");
                Err(self.render_error(&e))
            }
        }
    }

    /// List, inspect, or destroy sessions.
    #[tool(
        name = "manage_sessions",
        description = "Manage your sessions. action=list returns every session you own; action=get returns one session's record (requires sessionId); action=destroy tears a session down (requires sessionId; idempotent)."
    )]
    pub async fn manage_sessions(
        &self,
        Parameters(input): Parameters<ManageSessionsInput>,
    ) -> Result<String, String> {
        let started = Instant::now();

        let result = async {
            match input.action.as_str() {
                "list" => {
                    let sessions = self.broker.list_sessions(&self.identity).await?;
                    if sessions.is_empty() {
                        return Ok("No sessions.".to_string());
                    }
                    let mut out = format!("{} session(s):\n", sessions.len());
                    for session in &sessions {
                        out.push_str(&format!(
                            "- {} [{}] {} {}\n",
                            session.id,
                            session.kind.as_str(),
                            session.status.as_str(),
                            session
                                .language
                                .map(|l| l.as_str())
                                .unwrap_or("-"),
                        ));
                    }
                    Ok(out.trim_end().to_string())
                }
                "get" => {
                    let id = input.session_id.as_deref().ok_or_else(|| {
                        BrokerError::BadRequest {
                            reason: "sessionId is required for action=get".into(),
                        }
                    })?;
                    let session = self.broker.get_session(&self.identity, id).await?;
                    Ok(render_session(&session))
                }
                "destroy" => {
                    let id = input.session_id.as_deref().ok_or_else(|| {
                        BrokerError::BadRequest {
                            reason: "sessionId is required for action=destroy".into(),
                        }
                    })?;
                    let existed = self.broker.destroy_session(&self.identity, id).await?;
                    Ok(if existed {
                        format!("Session {id} destroyed.")
                    } else {
                        format!("Session {id} was already gone.")
                    })
                }
                other => Err(BrokerError::BadRequest {
                    reason: format!("unknown action '{other}' (expected list, get, or destroy)"),
                }),
            }
        }
        .await;

        self.broker
            .metrics()
            .record_request("manage_sessions", started.elapsed().as_millis() as f64);

        result.map_err(|e| {
            tracing::warn!(error = %e, "manage_sessions: failed");
            self.render_error(&e)
        })
    }

    /// Broker health and session statistics.
    #[tool(
        name = "system_health",
        description = "Report broker health: overall status (healthy/degraded/unhealthy), uptime, process and system memory, load averages, and session counts by type, status, and language. Pass detailed=true for per-component information."
    )]
    pub async fn system_health(
        &self,
        Parameters(input): Parameters<SystemHealthInput>,
    ) -> Result<String, String> {
        let detailed = input.detailed.unwrap_or(false);
        let report = self.broker.health(detailed).await;

        let mut text = format!(
            "Status: {}\nTimestamp: {}\nUptime: {}s\nProcess Memory: {} MiB rss / {} MiB virtual\nSystem Memory: {} MiB used / {} MiB total\nLoad Average: {:.2} {:.2} {:.2}\nCPU: {:.1}%\nSessions: {} live",
            report.status.as_str(),
            report.timestamp,
            report.uptime_secs,
            report.process.rss_mib,
            report.process.virtual_mib,
            report.system.used_memory_mib,
            report.system.total_memory_mib,
            report.system.load_average[0],
            report.system.load_average[1],
            report.system.load_average[2],
            report.process.cpu_percent,
            report.sessions.total,
        );

        for (label, group) in [
            ("by type", &report.sessions.by_kind),
            ("by status", &report.sessions.by_status),
            ("by language", &report.sessions.by_language),
        ] {
            if !group.is_empty() {
                let rendered = group
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                text.push_str(&format!("\nSessions {label}: {rendered}"));
            }
        }

        if detailed {
            text.push_str("\n\nComponents:");
            for component in &report.components {
                text.push_str(&format!(
                    "\n- {} [{}] {}",
                    component.name,
                    component.status.as_str(),
                    component.detail
                ));
            }
            if let Some(q) = self.broker.execution_quantiles() {
                text.push_str(&format!(
                    "\n\nExecution duration ms: p50={:.0} p95={:.0} p99={:.0}",
                    q.p50, q.p95, q.p99
                ));
            }
        }

        Ok(text)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for KilnServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Kiln code-execution broker. \
                 Use execute_code to run snippets in 15 languages inside isolated \
                 workspaces; pass sessionId to keep files between runs. \
                 create_vscode_session provisions a web IDE, \
                 create_playwright_session provisions a browser-automation \
                 workspace, manage_sessions lists/inspects/destroys your \
                 sessions, and system_health reports broker status.\n\
                 \n\
                 Code is screened against a coarse security policy before it \
                 runs: process creation, raw system calls, and system-file \
                 access are rejected with the matched rule's name.\n\
                 \n\
                 Execution limits: timeoutMs 1000-300000 (default 30000), \
                 output capped at 10 MiB per stream, timed-out runs report \
                 exit code 124 with partial output."
                    .into(),
            ),
            server_info: Implementation {
                name: "kiln".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }
}
