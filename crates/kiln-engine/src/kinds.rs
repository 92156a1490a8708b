//! Session-kind specializations.
//!
//! Execution sessions are bare workspaces. Web-IDE sessions additionally get
//! a `code-server` helper bound to a pooled port; browser-automation sessions
//! get a best-effort Playwright install in their workspace. Helper children
//! are owned by the process-local registry in the broker — their handles are
//! never persisted.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};

/// Web-IDE project templates.
pub const VSCODE_TEMPLATES: &[&str] = &["basic", "web", "api", "data-science", "machine-learning"];

/// Memory budget labels accepted for web-IDE sessions.
pub const VSCODE_MEMORY: &[&str] = &["1g", "2g", "4g", "8g"];

/// Memory budget labels accepted for browser sessions.
pub const PLAYWRIGHT_MEMORY: &[&str] = &["2g", "4g", "8g"];

/// Supported browser engines.
pub const BROWSERS: &[&str] = &["chromium", "firefox", "webkit"];

/// Initial page every browser context starts on.
pub const INITIAL_PAGE: &str = "about:blank";

/// Viewport bounds accepted from callers.
pub const VIEWPORT_WIDTH: std::ops::RangeInclusive<u32> = 320..=3840;
/// Viewport height bounds accepted from callers.
pub const VIEWPORT_HEIGHT: std::ops::RangeInclusive<u32> = 240..=2160;

/// Budget for the best-effort Playwright install.
const PLAYWRIGHT_INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Write a template skeleton into a fresh web-IDE workspace.
///
/// Skeletons are deliberately small: a README plus one language-appropriate
/// starter file per template. The helper serves whatever is here.
pub async fn scaffold_template(
    workspace: &Path,
    template: &str,
    language: Option<kiln_model::LanguageId>,
) -> anyhow::Result<()> {
    let lang_name = language.map(|l| l.as_str()).unwrap_or("polyglot");
    let readme = format!(
        "# {template} workspace\n\nLanguage: {lang_name}\n\nCreated by the Kiln broker.\n"
    );
    tokio::fs::write(workspace.join("README.md"), readme)
        .await
        .context("writing workspace README")?;

    match template {
        "web" => {
            tokio::fs::write(
                workspace.join("index.html"),
                "<!doctype html>\n<html>\n<body>\n<h1>Hello</h1>\n</body>\n</html>\n",
            )
            .await?;
        }
        "api" => {
            tokio::fs::create_dir_all(workspace.join("src")).await?;
            tokio::fs::write(
                workspace.join("src").join("routes.txt"),
                "GET /health\nGET /v1/items\nPOST /v1/items\n",
            )
            .await?;
        }
        "data-science" | "machine-learning" => {
            tokio::fs::create_dir_all(workspace.join("notebooks")).await?;
            tokio::fs::create_dir_all(workspace.join("data")).await?;
        }
        _ => {} // basic: README only
    }

    Ok(())
}

/// Spawn the web-IDE helper serving `workspace` on `port`.
///
/// The helper is optional infrastructure: a missing `code-server` binary is
/// an `Err` the caller downgrades to a workspace-only session.
pub fn spawn_vscode_helper(workspace: &Path, port: u16) -> std::io::Result<Child> {
    Command::new("code-server")
        .arg("--bind-addr")
        .arg(format!("0.0.0.0:{port}"))
        .arg("--auth")
        .arg("none")
        .arg(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

/// Best-effort Playwright toolkit install into a browser-session workspace.
///
/// Failure leaves the workspace usable; the session still exposes its
/// context id and initial page.
pub async fn install_playwright(workspace: &Path, browser: &str) {
    let install = async {
        let init = Command::new("npm")
            .args(["init", "-y"])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !init.success() {
            anyhow::bail!("npm init exited with {init}");
        }

        let add = Command::new("npm")
            .args(["install", "--no-audit", "--no-fund", "playwright"])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !add.success() {
            anyhow::bail!("npm install playwright exited with {add}");
        }

        let bundle = Command::new("npx")
            .args(["playwright", "install", browser])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !bundle.success() {
            anyhow::bail!("playwright install {browser} exited with {bundle}");
        }
        Ok::<(), anyhow::Error>(())
    };

    match tokio::time::timeout(PLAYWRIGHT_INSTALL_TIMEOUT, install).await {
        Ok(Ok(())) => {
            tracing::info!(workspace = %workspace.display(), browser, "playwright toolkit installed");
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "playwright install failed, session continues bare");
        }
        Err(_) => {
            tracing::warn!("playwright install timed out, session continues bare");
        }
    }
}
