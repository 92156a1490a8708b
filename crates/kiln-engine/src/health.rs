//! Health reporting.
//!
//! One document: overall status (the worst of the per-component statuses),
//! process uptime, memory and CPU snapshots, and session counts grouped by
//! kind, status, and language.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use kiln_model::Session;
use kiln_store::StoreHealth;
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

/// Component or overall health value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything nominal.
    Healthy,
    /// Operating with reduced capacity or a fallback in use.
    Degraded,
    /// A required component is down.
    Unhealthy,
}

impl HealthStatus {
    /// Wire token.
    pub const fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// One component's line in the health document.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Component status.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub detail: String,
}

/// Process-level resource snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    /// Resident set size in MiB.
    pub rss_mib: u64,
    /// Virtual size in MiB.
    pub virtual_mib: u64,
    /// CPU usage percent (since the previous refresh).
    pub cpu_percent: f32,
}

/// Host-level resource snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Total memory in MiB.
    pub total_memory_mib: u64,
    /// Used memory in MiB.
    pub used_memory_mib: u64,
    /// 1/5/15-minute load averages.
    pub load_average: [f64; 3],
}

/// Session counts grouped three ways.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Count by session kind.
    pub by_kind: BTreeMap<String, usize>,
    /// Count by session status.
    pub by_status: BTreeMap<String, usize>,
    /// Count by language.
    pub by_language: BTreeMap<String, usize>,
    /// Total live (non-terminal) sessions.
    pub total: usize,
}

/// The full health document.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst of the component statuses.
    pub status: HealthStatus,
    /// Report time, RFC 3339.
    pub timestamp: String,
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Process snapshot.
    pub process: ProcessStats,
    /// Host snapshot.
    pub system: SystemStats,
    /// Session counts.
    pub sessions: SessionStats,
    /// Per-component lines (populated in detailed mode).
    pub components: Vec<ComponentHealth>,
}

/// Produces [`HealthReport`]s. Keeps the `sysinfo` handle warm so CPU deltas
/// mean something.
pub struct HealthMonitor {
    started: Instant,
    system: Mutex<System>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Create a monitor; uptime counts from here.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            system: Mutex::new(System::new()),
        }
    }

    /// Seconds since construction.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Assemble the document from component inputs.
    pub fn report(
        &self,
        store: &StoreHealth,
        degraded_languages: &[kiln_model::LanguageId],
        sessions: &[Session],
        breakers: &[(String, kiln_admission::BreakerSnapshot)],
        free_slots: usize,
        ports_in_use: usize,
        detailed: bool,
    ) -> HealthReport {
        let mut components = Vec::new();

        // Metadata store: fallback keeps us alive, durable outage degrades.
        let store_status = if store.durable_configured && !store.durable_healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "metadata-store".into(),
            status: store_status,
            detail: if store.durable_configured {
                format!(
                    "near cache {} entries, durable {}",
                    store.near_entries,
                    if store.durable_healthy { "up" } else { "down" }
                )
            } else {
                format!(
                    "near cache {} entries, no durable tier (memory fallback)",
                    store.near_entries
                )
            },
        });

        // Workspaces: degraded languages reduce capacity; all 15 down means
        // nothing can run.
        let workspace_status = if degraded_languages.len() >= kiln_model::LanguageId::ALL.len() {
            HealthStatus::Unhealthy
        } else if !degraded_languages.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "workspaces".into(),
            status: workspace_status,
            detail: if degraded_languages.is_empty() {
                "all language bases provisioned".into()
            } else {
                format!(
                    "degraded languages: {}",
                    degraded_languages
                        .iter()
                        .map(|l| l.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            },
        });

        // Execution engine: slot starvation is visible load, not failure.
        components.push(ComponentHealth {
            name: "execution-engine".into(),
            status: if free_slots == 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            detail: format!("{free_slots} free slots"),
        });

        // Breakers: any open circuit degrades the component it guards.
        let open_breakers: Vec<&str> = breakers
            .iter()
            .filter(|(_, snap)| snap.state == kiln_admission::CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect();
        components.push(ComponentHealth {
            name: "circuit-breakers".into(),
            status: if open_breakers.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            detail: if open_breakers.is_empty() {
                format!("{} breakers closed", breakers.len())
            } else {
                format!("open: {}", open_breakers.join(", "))
            },
        });

        components.push(ComponentHealth {
            name: "port-pool".into(),
            status: HealthStatus::Healthy,
            detail: format!("{ports_in_use} ports in use"),
        });

        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_secs: self.uptime_secs(),
            process: self.process_stats(),
            system: self.system_stats(),
            sessions: session_stats(sessions),
            components: if detailed { components } else { Vec::new() },
        }
    }

    fn process_stats(&self) -> ProcessStats {
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(_) => {
                return ProcessStats {
                    rss_mib: 0,
                    virtual_mib: 0,
                    cpu_percent: 0.0,
                }
            }
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => ProcessStats {
                rss_mib: process.memory() / (1024 * 1024),
                virtual_mib: process.virtual_memory() / (1024 * 1024),
                cpu_percent: process.cpu_usage(),
            },
            None => ProcessStats {
                rss_mib: 0,
                virtual_mib: 0,
                cpu_percent: 0.0,
            },
        }
    }

    fn system_stats(&self) -> SystemStats {
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        system.refresh_memory();
        let load = System::load_average();
        SystemStats {
            total_memory_mib: system.total_memory() / (1024 * 1024),
            used_memory_mib: system.used_memory() / (1024 * 1024),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

fn session_stats(sessions: &[Session]) -> SessionStats {
    let mut stats = SessionStats::default();
    for session in sessions {
        *stats
            .by_kind
            .entry(session.kind.as_str().to_string())
            .or_default() += 1;
        *stats
            .by_status
            .entry(session.status.as_str().to_string())
            .or_default() += 1;
        if let Some(language) = session.language {
            *stats
                .by_language
                .entry(language.as_str().to_string())
                .or_default() += 1;
        }
        if !session.status.is_terminal() {
            stats.total += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::{LanguageId, SessionKind, SessionStatus};
    use std::path::PathBuf;

    fn store_health(durable: bool, healthy: bool) -> StoreHealth {
        StoreHealth {
            near_entries: 3,
            durable_configured: durable,
            durable_healthy: healthy,
            fallback_healthy: true,
        }
    }

    fn session(kind: SessionKind, status: SessionStatus, lang: Option<LanguageId>) -> Session {
        let mut s = Session::new(kind, lang, "1g", PathBuf::from("/tmp/x"), "c1");
        s.status = status;
        s
    }

    #[test]
    fn status_ordering_picks_the_worst() {
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
        assert!(HealthStatus::Degraded > HealthStatus::Healthy);
    }

    #[test]
    fn all_healthy_report() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(&store_health(true, true), &[], &[], &[], 10, 0, true);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(!report.components.is_empty());
    }

    #[test]
    fn durable_outage_degrades() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(&store_health(true, false), &[], &[], &[], 10, 0, true);
        assert_eq!(report.status, HealthStatus::Degraded);
        let store = report
            .components
            .iter()
            .find(|c| c.name == "metadata-store")
            .unwrap();
        assert_eq!(store.status, HealthStatus::Degraded);
        assert!(store.detail.contains("down"));
    }

    #[test]
    fn missing_durable_tier_is_healthy() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(&store_health(false, false), &[], &[], &[], 10, 0, true);
        let store = report
            .components
            .iter()
            .find(|c| c.name == "metadata-store")
            .unwrap();
        assert_eq!(store.status, HealthStatus::Healthy);
    }

    #[test]
    fn degraded_languages_degrade_workspaces() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(
            &store_health(false, false),
            &[LanguageId::Swift, LanguageId::Objc],
            &[],
            &[],
            10,
            0,
            true,
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        let ws = report
            .components
            .iter()
            .find(|c| c.name == "workspaces")
            .unwrap();
        assert!(ws.detail.contains("swift"));
    }

    #[test]
    fn every_language_degraded_is_unhealthy() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(
            &store_health(false, false),
            &LanguageId::ALL,
            &[],
            &[],
            10,
            0,
            true,
        );
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn session_counts_group_three_ways() {
        let sessions = vec![
            session(
                SessionKind::Execution,
                SessionStatus::Running,
                Some(LanguageId::Python),
            ),
            session(
                SessionKind::Execution,
                SessionStatus::Running,
                Some(LanguageId::Python),
            ),
            session(SessionKind::Vscode, SessionStatus::Creating, None),
            session(SessionKind::Playwright, SessionStatus::Stopped, None),
        ];
        let stats = session_stats(&sessions);
        assert_eq!(stats.by_kind["execution"], 2);
        assert_eq!(stats.by_kind["vscode"], 1);
        assert_eq!(stats.by_status["running"], 2);
        assert_eq!(stats.by_status["stopped"], 1);
        assert_eq!(stats.by_language["python"], 2);
        assert_eq!(stats.total, 3, "stopped session is not live");
    }

    #[test]
    fn open_breaker_degrades() {
        use kiln_admission::{CircuitBreaker, CircuitBreakerConfig};
        let breaker = CircuitBreaker::new(
            "redis",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );
        breaker.on_failure(true);
        let monitor = HealthMonitor::new();
        let report = monitor.report(
            &store_health(false, false),
            &[],
            &[],
            &[("redis".to_string(), breaker.snapshot())],
            10,
            0,
            true,
        );
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn summary_mode_omits_components() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(&store_health(false, false), &[], &[], &[], 10, 0, false);
        assert!(report.components.is_empty());
    }

    #[test]
    fn report_serializes_to_json() {
        let monitor = HealthMonitor::new();
        let report = monitor.report(&store_health(true, true), &[], &[], &[], 10, 1, true);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["process"]["rss_mib"].is_u64());
        assert!(json["system"]["load_average"].is_array());
    }
}
