//! Full-stack integration tests for the Kiln broker.
//!
//! These exercise the complete pipeline:
//! KilnServer -> Broker -> admission -> policy -> sessions -> execution engine
//!
//! Tests that spawn real interpreters skip themselves when the toolchain is
//! absent from the host, so the suite stays green on minimal runners.

use std::sync::Arc;

use kiln_config::KilnConfig;
use kiln_engine::Broker;
use kiln_server::{
    CreatePlaywrightInput, CreateVscodeInput, ExecuteCodeInput, KilnServer, ManageSessionsInput,
    SystemHealthInput,
};
use rmcp::handler::server::wrapper::Parameters;

fn test_server() -> (tempfile::TempDir, KilnServer, Arc<Broker>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KilnConfig::default();
    config.data_root = dir.path().to_path_buf();
    let broker = Broker::new(config, None);
    (dir, KilnServer::new(broker.clone()), broker)
}

fn have(binary: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary}"))
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn exec_input(language: &str, code: &str) -> Parameters<ExecuteCodeInput> {
    Parameters(ExecuteCodeInput {
        language: language.into(),
        code: code.into(),
        session_id: None,
        timeout_ms: None,
        stdin: None,
    })
}

fn session_id_of(report: &str) -> String {
    report
        .lines()
        .find_map(|l| l.strip_prefix("Session ID: ").or_else(|| l.strip_prefix("Session: ")))
        .expect("report carries a session id")
        .trim_end_matches(" (transient)")
        .to_string()
}

#[tokio::test]
async fn scenario_hello_python_with_transient_session() {
    if !have("python3") {
        eprintln!("python3 unavailable; skipping");
        return;
    }
    let (_dir, server, broker) = test_server();

    let text = server
        .execute_code(exec_input("python", "print('Hello from Python!')"))
        .await
        .unwrap();

    assert!(text.contains("Hello from Python!"));
    assert!(text.contains("Exit Code: 0"));
    let time_line = text
        .lines()
        .find(|l| l.starts_with("Execution Time:"))
        .unwrap();
    let ms: u64 = time_line
        .trim_start_matches("Execution Time:")
        .trim()
        .trim_end_matches(" ms")
        .parse()
        .unwrap();
    assert!(ms > 0);

    // The transient session was destroyed after the call.
    assert!(broker.list_sessions("local").await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_policy_rejects_before_spawn() {
    let (_dir, server, broker) = test_server();

    let err = server
        .execute_code(exec_input("python", "import os; os.system('ls')"))
        .await
        .unwrap_err();

    assert!(err.contains("POLICY_REJECTED"), "{err}");
    // Nothing was provisioned on the way to the rejection.
    assert!(broker.list_sessions("local").await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_infinite_loop_times_out_with_124() {
    if !have("node") {
        eprintln!("node unavailable; skipping");
        return;
    }
    let (_dir, server, _broker) = test_server();

    let started = std::time::Instant::now();
    let text = server
        .execute_code(Parameters(ExecuteCodeInput {
            language: "javascript".into(),
            code: "while(true){};".into(),
            session_id: None,
            timeout_ms: Some(2_000),
            stdin: None,
        }))
        .await
        .unwrap();

    assert!(text.contains("Exit Code: 124"), "{text}");
    assert!(text.contains("timed out"), "{text}");

    let elapsed = started.elapsed();
    assert!(elapsed >= std::time::Duration::from_secs(2));
    assert!(
        elapsed < std::time::Duration::from_secs(2 + 6),
        "must finish within timeout + grace, took {elapsed:?}"
    );
}

#[tokio::test]
async fn scenario_vscode_session_get_round_trip() {
    let (_dir, server, _broker) = test_server();

    let created = server
        .create_vscode_session(Parameters(CreateVscodeInput {
            language: Some("typescript".into()),
            template: Some("basic".into()),
            memory: Some("4g".into()),
        }))
        .await
        .unwrap();
    let id = session_id_of(&created);

    let fetched = server
        .manage_sessions(Parameters(ManageSessionsInput {
            action: "get".into(),
            session_id: Some(id.clone()),
        }))
        .await
        .unwrap();

    assert!(fetched.contains("Status: running") || fetched.contains("Status: creating"));
    if let Some(url) = fetched
        .lines()
        .find_map(|l| l.strip_prefix("Endpoint (vscode): "))
    {
        assert!(url.starts_with("http://"));
        let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
        assert!((8080..=9999).contains(&port), "port {port} out of range");
    }
}

#[tokio::test]
async fn scenario_shared_session_sees_consistent_workspace() {
    if !have("python3") {
        eprintln!("python3 unavailable; skipping");
        return;
    }
    let (_dir, server, broker) = test_server();

    // A persistent session shared by two concurrent calls.
    let created = server
        .create_vscode_session(Parameters(CreateVscodeInput {
            language: Some("python".into()),
            template: None,
            memory: None,
        }))
        .await
        .unwrap();
    let id = session_id_of(&created);

    let code = r#"
with open('shared.txt', 'a') as f:
    f.write('run\n')
with open('shared.txt') as f:
    lines = f.readlines()
assert all(l == 'run\n' for l in lines), lines
print('consistent', len(lines))
"#;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let server = server.clone();
        let id = id.clone();
        let code = code.to_string();
        handles.push(tokio::spawn(async move {
            server
                .execute_code(Parameters(ExecuteCodeInput {
                    language: "python".into(),
                    code,
                    session_id: Some(id),
                    timeout_ms: Some(30_000),
                    stdin: None,
                }))
                .await
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        let text = handle.await.unwrap().unwrap();
        assert!(text.contains("Exit Code: 0"), "{text}");
        assert!(text.contains("consistent"), "{text}");
        outputs.push(text);
    }
    // Both ran, in some order, against the same file.
    assert!(outputs.iter().any(|t| t.contains("consistent 2")));

    let _ = broker.destroy_session("local", &id).await;
}

#[tokio::test]
async fn scenario_rate_limit_exhaustion_and_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KilnConfig::default();
    config.data_root = dir.path().to_path_buf();
    config.rate_limit.points = 5;
    config.rate_limit.window_secs = 60;
    config.rate_limit.block_secs = 1;
    let broker = Broker::new(config, None);
    let server = KilnServer::new(broker);

    for _ in 0..5 {
        server
            .manage_sessions(Parameters(ManageSessionsInput {
                action: "list".into(),
                session_id: None,
            }))
            .await
            .unwrap();
    }

    let err = server
        .manage_sessions(Parameters(ManageSessionsInput {
            action: "list".into(),
            session_id: None,
        }))
        .await
        .unwrap_err();
    assert!(err.contains("RATE_LIMITED"), "{err}");
    assert!(err.contains("retryable"), "{err}");

    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    server
        .manage_sessions(Parameters(ManageSessionsInput {
            action: "list".into(),
            session_id: None,
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn list_tracks_creates_and_destroys() {
    let (_dir, server, _broker) = test_server();

    let mut ids = Vec::new();
    for _ in 0..4 {
        let created = server
            .create_playwright_session(Parameters(CreatePlaywrightInput {
                browser: Some("chromium".into()),
                headless: Some(true),
                viewport: None,
                memory: Some("2g".into()),
            }))
            .await
            .unwrap();
        ids.push(session_id_of(&created));
    }

    for id in ids.iter().take(1) {
        server
            .manage_sessions(Parameters(ManageSessionsInput {
                action: "destroy".into(),
                session_id: Some(id.clone()),
            }))
            .await
            .unwrap();
    }

    let listed = server
        .manage_sessions(Parameters(ManageSessionsInput {
            action: "list".into(),
            session_id: None,
        }))
        .await
        .unwrap();
    assert!(listed.contains("3 session(s)"), "{listed}");
}

#[tokio::test]
async fn health_reflects_running_sessions() {
    let (_dir, server, _broker) = test_server();

    server
        .create_playwright_session(Parameters(CreatePlaywrightInput {
            browser: None,
            headless: None,
            viewport: None,
            memory: None,
        }))
        .await
        .unwrap();

    let health = server
        .system_health(Parameters(SystemHealthInput {
            detailed: Some(true),
        }))
        .await
        .unwrap();

    assert!(health.contains("Status: healthy"), "{health}");
    assert!(health.contains("playwright=1"), "{health}");
    assert!(health.contains("metadata-store"), "{health}");
}

#[tokio::test]
async fn session_reuse_persists_files_between_calls() {
    if !have("python3") {
        eprintln!("python3 unavailable; skipping");
        return;
    }
    let (_dir, server, _broker) = test_server();

    let created = server
        .create_vscode_session(Parameters(CreateVscodeInput {
            language: Some("python".into()),
            template: None,
            memory: None,
        }))
        .await
        .unwrap();
    let id = session_id_of(&created);

    server
        .execute_code(Parameters(ExecuteCodeInput {
            language: "python".into(),
            code: "open('state.txt','w').write('kept')".into(),
            session_id: Some(id.clone()),
            timeout_ms: None,
            stdin: None,
        }))
        .await
        .unwrap();

    let text = server
        .execute_code(Parameters(ExecuteCodeInput {
            language: "python".into(),
            code: "print(open('state.txt').read())".into(),
            session_id: Some(id),
            timeout_ms: None,
            stdin: None,
        }))
        .await
        .unwrap();
    assert!(text.contains("kept"), "{text}");
}

#[tokio::test]
async fn stdin_reaches_the_program() {
    if !have("python3") {
        eprintln!("python3 unavailable; skipping");
        return;
    }
    let (_dir, server, _broker) = test_server();

    let text = server
        .execute_code(Parameters(ExecuteCodeInput {
            language: "python".into(),
            code: "import sys; print('got:', sys.stdin.read().strip())".into(),
            session_id: None,
            timeout_ms: None,
            stdin: Some("piped input".into()),
        }))
        .await
        .unwrap();
    assert!(text.contains("got: piped input"), "{text}");
}
