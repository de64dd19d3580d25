use printledger::adapters::{LedgerConnection, SimulatedLedger};
use printledger::config::{AppConfig, InventoryConfig, SettlementMode};
use printledger::coordinator::{CoordinatorConfig, JobCoordinator, JobPoll, LedgerServices};
use printledger::domain::{FrozenOrder, JobId, JobResult, JobStatus, Order, OrderChoices, OrderEstimate};
use printledger::services::{InventoryCache, ResultStore};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn order(name: &str, toner: &[(&str, f64)], sheets: u32) -> FrozenOrder {
    Order::new(name)
        .with_choices(OrderChoices {
            quantity: 1,
            color_mode: "cmyk".to_string(),
            media_id: "mint-media-matte-a4".to_string(),
            media_display_name: "Matte A4".to_string(),
            turnaround_time: "standard".to_string(),
            quality: "standard".to_string(),
            notes: String::new(),
        })
        .with_estimate(OrderEstimate {
            sheets_required: sheets,
            toner_usage: toner
                .iter()
                .map(|(color, ml)| (color.to_string(), *ml))
                .collect::<HashMap<_, _>>(),
            estimated_cost: Decimal::new(100, 2),
        })
        .freeze()
        .expect("order should freeze")
}

fn coordinator(ledger: &Arc<SimulatedLedger>, config: CoordinatorConfig) -> JobCoordinator {
    let connection = LedgerConnection::open(ledger.clone()).expect("open ledger");
    JobCoordinator::new(connection, Arc::new(ResultStore::new()), None, config)
        .expect("blocking coordinator needs no finalizer")
}

fn wait_ready(coordinator: &JobCoordinator, job_id: &JobId, within: Duration) -> JobResult {
    let deadline = Instant::now() + within;
    loop {
        match coordinator.poll(job_id) {
            JobPoll::Ready(result) => return result,
            JobPoll::Running if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            other => panic!("job {job_id} ended in {other:?}"),
        }
    }
}

/// Concurrent submissions each yield exactly one result, consumable once.
#[test]
fn concurrent_jobs_each_get_one_result() {
    let ledger = Arc::new(SimulatedLedger::demo());
    let coordinator = coordinator(&ledger, CoordinatorConfig::default());

    let ids: Vec<JobId> = (0..8)
        .map(|i| {
            coordinator
                .submit(order(&format!("job-{i}"), &[("cyan", 1.0)], 1))
                .expect("submit")
        })
        .collect();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());

    for id in &ids {
        let result = wait_ready(&coordinator, id, Duration::from_secs(5));
        assert_eq!(result.job_id, *id);
        assert_eq!(result.status, JobStatus::Completed, "notes: {}", result.notes);
        assert_eq!(coordinator.poll(id), JobPoll::Consumed);
    }
    assert_eq!(ledger.balance("mint-toner-cyan"), Some(492.0));
    assert_eq!(ledger.submissions(), 8);
}

/// Each worker fetches its own template; the cache is never reused for submission.
#[test]
fn every_job_fetches_a_fresh_template() {
    let ledger = Arc::new(SimulatedLedger::demo());
    let coordinator = coordinator(&ledger, CoordinatorConfig::default());
    let before = ledger.template_fetches();

    let a = coordinator.submit(order("a", &[("cyan", 1.0)], 1)).unwrap();
    let b = coordinator.submit(order("b", &[("black", 2.0)], 1)).unwrap();
    wait_ready(&coordinator, &a, Duration::from_secs(5));
    wait_ready(&coordinator, &b, Duration::from_secs(5));

    assert_eq!(ledger.template_fetches() - before, 2);
}

/// Accounts the order does not mention are submitted with a zero expenditure.
#[test]
fn unmatched_accounts_are_zeroed_in_payload() {
    let ledger = Arc::new(SimulatedLedger::demo());
    let coordinator = coordinator(&ledger, CoordinatorConfig::default());

    let id = coordinator
        .submit(order("zeroes", &[("cyan", 1.5), ("orange", 3.0)], 2))
        .unwrap();
    let result = wait_ready(&coordinator, &id, Duration::from_secs(5));
    assert_eq!(result.status, JobStatus::Completed, "notes: {}", result.notes);

    let payload = ledger.last_payload().expect("payload recorded");
    let accounts: Vec<&serde_json::Value> = payload["inventoryParameters"]["wallets"]
        .as_array()
        .expect("wallets")
        .iter()
        .flat_map(|w| w["accounts"].as_array().into_iter().flatten())
        .collect();
    assert_eq!(accounts.len(), 6);

    for account in accounts {
        assert!(account.get("estimatedBalance").is_none());
        let spent = account["currentExpenditure"].as_f64().expect("numeric expenditure");
        match account["mintId"].as_str().unwrap_or_default() {
            "mint-toner-cyan" => assert_eq!(spent, 1.5),
            "mint-media-matte-a4" => assert_eq!(spent, 2.0),
            _ => assert_eq!(spent, 0.0),
        }
    }
}

/// A ledger that never settles turns into a timed-out failure, and the worker exits.
#[test]
fn job_timeout_fails_promptly() {
    let ledger = Arc::new(SimulatedLedger::demo());
    ledger.never_settle(true);
    let coordinator = coordinator(
        &ledger,
        CoordinatorConfig::default()
            .with_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(20)),
    );

    let started = Instant::now();
    let id = coordinator.submit(order("stuck", &[("cyan", 1.0)], 1)).unwrap();
    let result = wait_ready(&coordinator, &id, Duration::from_secs(2));
    let elapsed = started.elapsed();

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.notes.contains("timed out"), "notes: {}", result.notes);
    assert!(result.job_handle.is_some());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");

    let deadline = Instant::now() + Duration::from_secs(1);
    while coordinator.is_running(&id) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!coordinator.is_running(&id));
}

/// A timeout shorter than the poll interval is accepted and honoured.
#[test]
fn short_timeout_with_default_poll_interval() {
    let ledger = Arc::new(SimulatedLedger::demo());
    ledger.never_settle(true);

    let mut config = AppConfig::default();
    config.jobs.timeout_ms = 100;
    assert!(config.jobs.timeout() < config.jobs.poll_interval());
    let services = LedgerServices::start(ledger.clone(), &config).expect("services start");

    let started = Instant::now();
    let id = services
        .coordinator()
        .submit(order("short", &[("cyan", 1.0)], 1))
        .unwrap();
    let result = wait_ready(services.coordinator(), &id, Duration::from_secs(2));

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.notes.contains("timed out"), "notes: {}", result.notes);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(services.shutdown());
}

#[test]
fn cache_starts_with_stale_empty_sentinel() {
    let ledger = Arc::new(SimulatedLedger::demo());
    let connection = LedgerConnection::open(ledger).unwrap();
    let cache = InventoryCache::new(connection, InventoryConfig::default());

    let snapshot = cache.snapshot();
    assert!(snapshot.is_empty());
    assert!(snapshot.is_stale());
    assert!(cache.snapshot_or_not_ready().is_err());
}

/// A failed refresh keeps the last good snapshot; the next success clears the counter.
#[test]
fn failed_refresh_keeps_previous_snapshot() {
    let ledger = Arc::new(SimulatedLedger::demo());
    let connection = LedgerConnection::open(ledger.clone()).unwrap();
    let cache = InventoryCache::new(connection, InventoryConfig::default());

    let good = cache.force_refresh().unwrap();
    assert_eq!(cache.consecutive_failures(), 0);

    ledger.fail_next_templates(1);
    assert!(cache.force_refresh().is_err());
    assert_eq!(cache.consecutive_failures(), 1);
    assert!(cache.last_error().is_some());
    assert!(Arc::ptr_eq(&good, &cache.snapshot()));

    cache.force_refresh().unwrap();
    assert_eq!(cache.consecutive_failures(), 0);
    assert!(!Arc::ptr_eq(&good, &cache.snapshot()));
}

/// Readers see the old balance until the next scheduled refresh publishes the new one.
#[test]
fn refresh_loop_publishes_on_schedule() {
    let ledger = Arc::new(SimulatedLedger::demo());
    let connection = LedgerConnection::open(ledger.clone()).unwrap();
    let cache = InventoryCache::new(
        connection,
        InventoryConfig {
            refresh_interval_ms: 1_000,
            ..InventoryConfig::default()
        },
    );

    let t0 = Instant::now();
    cache.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    ledger.set_balance("mint-toner-cyan", 42.0);

    thread::sleep(Duration::from_millis(500).saturating_sub(t0.elapsed()));
    let early = cache.snapshot();
    assert_eq!(early.toner_by_color("cyan").map(|t| t.balance_ml), Some(500.0));

    thread::sleep(Duration::from_millis(1_500).saturating_sub(t0.elapsed()));
    let late = cache.snapshot();
    assert_eq!(late.toner_by_color("cyan").map(|t| t.balance_ml), Some(42.0));

    assert!(cache.stop());
    assert!(!cache.is_running());
}

/// Provisional settlement returns `Submitted` fast and the finalizer settles it later.
#[test]
fn provisional_jobs_settle_through_finalizer() {
    let ledger = Arc::new(SimulatedLedger::demo());
    ledger.settle_after_polls(1);

    let mut config = AppConfig::default();
    config.jobs.settlement = SettlementMode::Provisional;
    config.finalizer.poll_interval_ms = 50;
    let services = LedgerServices::start(ledger.clone(), &config).unwrap();

    let id = services
        .coordinator()
        .submit(order("provisional", &[("magenta", 4.0)], 3))
        .unwrap();
    let submitted = wait_ready(services.coordinator(), &id, Duration::from_secs(5));
    assert_eq!(submitted.status, JobStatus::Submitted);
    assert!(submitted.job_handle.is_some());

    let finalizer = services.finalizer().expect("provisional mode runs a finalizer");
    let deadline = Instant::now() + Duration::from_secs(5);
    let settled = loop {
        if let Some(settled) = finalizer.take_settlement(&id) {
            break settled;
        }
        assert!(Instant::now() < deadline, "settlement never arrived");
        thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(settled.status, JobStatus::Completed, "notes: {}", settled.notes);
    assert_eq!(ledger.balance("mint-toner-magenta"), Some(496.0));
    assert_eq!(ledger.balance("mint-media-matte-a4"), Some(497.0));

    assert!(services.shutdown());
}
