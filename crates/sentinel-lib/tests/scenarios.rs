//! End-to-end scenarios across the ledger, monitor, predictor and recovery

use chrono::Utc;
use sentinel_lib::config::{Environment, MonitorConfig, RecoveryConfig};
use sentinel_lib::leak::{LeakScoring, LeakSignals};
use sentinel_lib::monitor::{AlertManager, ReleaseMonitor};
use sentinel_lib::pool::OrphanSink;
use sentinel_lib::recovery::{
    ConfigChangeReason, ConfigurationStore, HealthSignal, Ineligible, InMemoryConfigurationStore,
    InMemoryPluginHost, PluginCondition, PluginHost, RecoveryOrchestrator, RecoveryOutcome,
    RecoveryStrategy,
};
use sentinel_lib::releaser::InProcessReleaser;
use sentinel_lib::trend::{Predictor, StatisticalPredictor, TrendAnalyzer};
use sentinel_lib::{AllocationLedger, ResourceAllocation, ResourceType, ResourceUsage, UsageStats, ValidationRequest};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

#[derive(Default)]
struct OrphanBatches(Mutex<Vec<Vec<String>>>);

impl OrphanSink for OrphanBatches {
    fn handle_orphaned_resources(&self, batch: &[ResourceAllocation]) {
        self.0
            .lock()
            .unwrap()
            .push(batch.iter().map(|a| a.id.clone()).collect());
    }
}

struct Recovery {
    host: Arc<InMemoryPluginHost>,
    store: Arc<InMemoryConfigurationStore>,
    orchestrator: RecoveryOrchestrator,
}

fn recovery(dependencies: &[&str]) -> Recovery {
    let host = Arc::new(InMemoryPluginHost::new());
    host.register("plugin-a", dependencies);
    let store = Arc::new(InMemoryConfigurationStore::new());
    let orchestrator = RecoveryOrchestrator::new(
        host.clone(),
        store.clone(),
        Arc::new(AllocationLedger::default()),
        Arc::new(AlertManager::new()),
        RecoveryConfig::default(),
        Environment::Development,
    );
    Recovery {
        host,
        store,
        orchestrator,
    }
}

#[tokio::test]
async fn test_idle_resource_orphaned_exactly_once() {
    let ledger = Arc::new(AllocationLedger::default());
    let start = Utc::now();
    ledger
        .insert(ResourceAllocation::new("fh-1", ResourceType::FileHandle, "plugin-a", start))
        .unwrap();
    let batches = Arc::new(OrphanBatches::default());
    let monitor = ReleaseMonitor::new(
        ledger.clone(),
        Arc::new(InProcessReleaser),
        Arc::new(AlertManager::new()),
        MonitorConfig::default(),
    )
    .with_orphan_sink(batches.clone());

    let first = monitor
        .sweep_at(start + chrono::Duration::seconds(3600))
        .await;
    assert_eq!(first.orphaned.len(), 1);
    assert_eq!(first.orphaned[0].id, "fh-1");
    assert!(!ledger.is_live("fh-1"));

    let second = monitor
        .sweep_at(start + chrono::Duration::seconds(3900))
        .await;
    assert!(second.orphaned.is_empty());
    assert_eq!(
        ledger.type_counters("plugin-a", ResourceType::FileHandle).orphaned,
        1
    );
    assert_eq!(*batches.0.lock().unwrap(), vec![vec!["fh-1".to_string()]]);
}

#[test]
fn test_volatile_history_widens_memory_prediction() {
    let trend = Arc::new(TrendAnalyzer::default());
    let request = ValidationRequest::new("wasm", 2 * MB);
    let start = Utc::now() - chrono::Duration::minutes(5);
    let history = [100, 100, 100, 100, 100, 100, 100, 100, 100, 400];
    for (i, mem) in history.iter().enumerate() {
        trend.record_usage_at(
            request.context_key(),
            UsageStats::new(mem * MB, 3, Duration::from_secs(20)),
            start + chrono::Duration::seconds(i as i64),
        );
    }

    let prediction = StatisticalPredictor::new(trend).predict(&request);
    assert!(!prediction.fallback);
    assert_eq!(prediction.memory_bytes, 280 * MB);
}

#[test]
fn test_leak_probability_never_decreases_and_caps() {
    let scoring = LeakScoring::default();
    let mut previous = 0.0;
    for step in 0..=10 {
        let level = step as f64 / 10.0;
        let signals = LeakSignals {
            unreleased_ratio: level,
            average_lifetime_ms: level * 900_000.0,
            growth_rate_percent: level * 60.0,
        };
        let score = scoring.score(&signals);
        assert!(score >= previous);
        assert!(score <= 1.0);
        previous = score;
    }
    assert!((previous - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_degraded_plugin_quota_and_dependency_restore() {
    let r = recovery(&["db", "cache"]);
    let usage = ResourceUsage {
        memory_bytes: 100 * MB,
        file_handles: 10,
        network_connections: 2,
    };

    let outcome = r
        .orchestrator
        .handle_signal(HealthSignal::degraded("plugin-a", usage))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Recovered {
            strategy: RecoveryStrategy::Isolate,
            attempt: 1
        }
    );

    let quota = r.host.get_plugin("plugin-a").await.unwrap().unwrap().quota.unwrap();
    assert_eq!(quota.max_memory_bytes, 120 * MB);
    assert_eq!(quota.max_file_handles, 12);
    assert_eq!(quota.max_network_connections, 3);

    // Dependencies dropped while isolated come back on release
    r.host.set_dependencies("plugin-a", &[]);
    let context = r.orchestrator.release_isolation("plugin-a").await.unwrap();
    assert_eq!(context.dependencies, vec!["db".to_string(), "cache".to_string()]);

    let descriptor = r.host.get_plugin("plugin-a").await.unwrap().unwrap();
    assert_eq!(descriptor.dependencies, vec!["db".to_string(), "cache".to_string()]);
    assert!(descriptor.quota.is_none());
    assert!(!r.orchestrator.is_isolated("plugin-a"));
}

#[tokio::test(start_paused = true)]
async fn test_fourth_attempt_refused_after_cooldowns() {
    let r = recovery(&[]);
    let mut now = Utc::now();

    for attempt in 1..=3 {
        let outcome = r
            .orchestrator
            .handle_signal_at(HealthSignal::failed("plugin-a", "crashed"), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                strategy: RecoveryStrategy::Restart,
                attempt
            }
        );

        // Inside the cooldown the next signal is refused and not counted
        let early = r
            .orchestrator
            .handle_signal_at(
                HealthSignal::failed("plugin-a", "crashed"),
                now + chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        if attempt < 3 {
            assert!(matches!(
                early,
                RecoveryOutcome::NotEligible {
                    reason: Ineligible::CoolingDown { .. }
                }
            ));
        }
        now += chrono::Duration::minutes(6);
    }

    let outcome = r
        .orchestrator
        .handle_signal_at(HealthSignal::failed("plugin-a", "crashed"), now)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::NotEligible {
            reason: Ineligible::AttemptsExhausted { attempts: 3 }
        }
    );
    assert_eq!(r.orchestrator.policy().attempts("plugin-a"), 3);
    assert_eq!(r.host.lifecycle_counts("plugin-a"), (3, 3));
}

#[tokio::test]
async fn test_rollback_restores_byte_identical_configuration() {
    let r = recovery(&[]);
    let good = "workers = 4\nlimits:\n  memory: \"256Mi\"\n# trailing comment \u{00e9}\n";
    r.store.update_configuration("plugin-a", good).await.unwrap();
    r.orchestrator
        .record_configuration("plugin-a", ConfigChangeReason::Startup, true)
        .await
        .unwrap();

    r.store
        .update_configuration("plugin-a", "workers = 0\n")
        .await
        .unwrap();
    assert!(r.orchestrator.check_configuration_drift("plugin-a").await.unwrap());

    let outcome = r
        .orchestrator
        .handle_signal(HealthSignal::new(
            "plugin-a",
            PluginCondition::ConfigurationDrift,
        ))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RecoveryOutcome::Recovered {
            strategy: RecoveryStrategy::Rollback,
            ..
        }
    ));

    let restored = r.store.get_configuration("plugin-a").await.unwrap().unwrap();
    assert_eq!(restored.as_bytes(), good.as_bytes());
    assert!(!r.orchestrator.check_configuration_drift("plugin-a").await.unwrap());
}
