//! End-to-end iterations of the collection agent over in-memory targets

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{instance_config, FakeFactory, FakeJmx, RecordingReporter};
use jmx_collector::app::App;
use jmx_collector::config::AppConfig;
use jmx_collector::instance::Action;
use jmx_collector::metric::MetricType;
use jmx_collector::reporter::ServiceCheckStatus;

const CONF: &str = r#"
- include:
    domain: app
    attribute:
      Requests:
        alias: app.requests
        metric_type: counter
      Threads:
        alias: app.threads
"#;

fn base_config(instances: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.init_config.collect_default_metrics = false;
    config.init_config.refresh_beans = None;
    for name in instances {
        config.instances.push(instance_config(name, CONF));
    }
    config
}

fn target(requests: i64) -> Arc<FakeJmx> {
    let jmx = FakeJmx::new();
    jmx.set_long("app:type=Server", "Requests", requests);
    jmx.set_long("app:type=Server", "Threads", 8);
    jmx
}

#[tokio::test]
async fn test_init_splits_active_and_broken() {
    let jmx = target(0);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["good", "down"]), factory, reporter.clone()).unwrap();

    assert_eq!(app.init().await, 1);
    assert_eq!(app.active_instances(), vec!["good".to_string()]);
    assert_eq!(app.broken_instances(), vec!["down".to_string()]);

    let checks = reporter.checks();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].name, "jmx.can_connect");
    assert_eq!(checks[0].status, ServiceCheckStatus::Critical);
    assert!(checks[0].tags.contains(&"instance:down".to_string()));
    assert!(checks[0].message.is_some());
}

#[tokio::test]
async fn test_iteration_reports_gauges_then_rates() {
    let jmx = target(100);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["good"]), factory, reporter.clone()).unwrap();
    app.init().await;

    let summary = app.do_iteration().await;
    assert_eq!(summary.iteration, 1);
    assert_eq!(summary.collected, 1);
    assert_eq!(summary.metrics, 1);
    assert_eq!(reporter.point("app.threads").unwrap().value, 8.0);
    assert!(reporter.point("app.requests").is_none());
    assert_eq!(reporter.last_status("good"), Some(ServiceCheckStatus::Ok));
    assert_eq!(app.pipeline().rates().tracked("good"), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    jmx.set_long("app:type=Server", "Requests", 200);
    let summary = app.do_iteration().await;
    assert_eq!(summary.metrics, 2);

    let requests = reporter.point("app.requests").unwrap();
    assert_eq!(requests.metric_type, MetricType::Rate);
    assert!(requests.value > 0.0);
    assert!(requests.value.is_finite());

    let health = app.health().snapshot();
    assert!(health.ready);
    assert_eq!(health.iterations, 2);
    assert_eq!(health.active_instances, 1);
}

#[tokio::test]
async fn test_broken_instance_is_recovered() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["good"]), factory.clone(), reporter.clone()).unwrap();
    app.init().await;
    app.do_iteration().await;
    assert_eq!(app.pipeline().rates().tracked("good"), 1);

    jmx.set_down(true);
    let summary = app.do_iteration().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.broken, 1);
    assert_eq!(reporter.last_status("good"), Some(ServiceCheckStatus::Critical));
    assert!(app.active_instances().is_empty());
    assert_eq!(app.broken_instances(), vec!["good".to_string()]);
    assert_eq!(app.pipeline().rates().tracked("good"), 0);
    assert_eq!(app.health().snapshot().broken_instances, vec!["good".to_string()]);

    assert_eq!(app.process_recovery().await, 0);
    assert_eq!(app.broken_instances(), vec!["good".to_string()]);

    jmx.set_down(false);
    assert_eq!(app.process_recovery().await, 1);
    assert_eq!(app.active_instances(), vec!["good".to_string()]);
    assert!(factory.connects() >= 3);

    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 1);
    assert_eq!(reporter.last_status("good"), Some(ServiceCheckStatus::Ok));
}

#[tokio::test]
async fn test_rejected_credentials_break_instance() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["good"]), factory, reporter.clone()).unwrap();
    app.init().await;

    jmx.reject_credentials(true);
    let summary = app.do_iteration().await;
    assert_eq!(summary.broken, 1);
    let check = reporter.checks().pop().unwrap();
    assert_eq!(check.status, ServiceCheckStatus::Critical);
    assert!(check.message.unwrap().contains("authenticate"));
}

#[tokio::test]
async fn test_transient_attribute_failure_keeps_instance_active() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["good"]), factory, reporter.clone()).unwrap();
    app.init().await;

    jmx.fail("app:type=Server", "Threads");
    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 1);
    assert_eq!(summary.broken, 0);
    assert_eq!(app.active_instances(), vec!["good".to_string()]);
    assert_eq!(reporter.last_status("good"), Some(ServiceCheckStatus::Ok));
}

#[tokio::test]
async fn test_empty_collection_breaks_instance() {
    let jmx = FakeJmx::new();
    jmx.set_long("app:type=Server", "Unrelated", 1);
    let factory = FakeFactory::new().with_server("idle", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["idle"]), factory, reporter.clone()).unwrap();
    assert_eq!(app.init().await, 1);

    let summary = app.do_iteration().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.broken, 1);
    let check = reporter.checks().pop().unwrap();
    assert_eq!(check.status, ServiceCheckStatus::Critical);
    assert_eq!(check.message.as_deref(), Some("Instance idle didn't return any metrics"));
}

#[tokio::test]
async fn test_metric_limit_reports_warning() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut config = base_config(&["good"]);
    config.instances[0].max_returned_metrics = Some(1);
    let mut app = App::new(config, factory, reporter.clone()).unwrap();
    app.init().await;

    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 1);
    assert_eq!(reporter.last_status("good"), Some(ServiceCheckStatus::Warning));
    let check = reporter.checks().pop().unwrap();
    assert!(check.message.unwrap().contains("too high"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_instance_times_out() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("slow", &jmx);
    let reporter = RecordingReporter::new();
    let mut config = base_config(&["slow"]);
    config.init_config.collection_timeout = 5;
    let mut app = App::new(config, factory, reporter.clone()).unwrap();
    app.init().await;

    jmx.set_read_delay(Some(Duration::from_secs(60)));
    let summary = app.do_iteration().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.broken, 1);
    assert_eq!(reporter.last_status("slow"), Some(ServiceCheckStatus::Critical));
    assert_eq!(app.broken_instances(), vec!["slow".to_string()]);

    jmx.set_read_delay(None);
    assert_eq!(app.process_recovery().await, 1);
    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_min_collection_interval_skips_instance() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut config = base_config(&["good"]);
    config.init_config.min_collection_interval = Some(30);
    let mut app = App::new(config, factory, reporter).unwrap();
    app.init().await;

    assert_eq!(app.do_iteration().await.collected, 1);
    assert_eq!(app.do_iteration().await.skipped, 1);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(app.do_iteration().await.collected, 1);
}

#[tokio::test]
async fn test_list_reports_every_instance() {
    let jmx = target(1);
    jmx.set_long("app:type=Other", "Ignored", 1);
    jmx.set_long("app:type=Server", "Uptime", 10);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let mut app = App::new(
        base_config(&["good", "down"]),
        factory,
        RecordingReporter::new(),
    )
    .unwrap();

    let listings = app.list(Action::ListEverything).await;
    assert_eq!(listings.len(), 2);

    let good = listings.iter().find(|l| l.instance == "good").unwrap();
    assert!(good.error.is_none());
    let report = good.report.as_ref().unwrap();
    let matching: Vec<&str> = report.matching.iter().map(|a| a.attribute.as_str()).collect();
    assert_eq!(matching, vec!["Requests", "Threads"]);
    let not_matching: Vec<&str> = report.not_matching.iter().map(|a| a.attribute.as_str()).collect();
    assert!(not_matching.contains(&"Ignored"));
    assert!(not_matching.contains(&"Uptime"));

    let down = listings.iter().find(|l| l.instance == "down").unwrap();
    assert!(down.report.is_none());
    assert!(down.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_run_until_shutdown() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let reporter = RecordingReporter::new();
    let mut config = base_config(&["good"]);
    config.init_config.check_period = 100;
    let mut app = App::new(config, factory, reporter.clone()).unwrap();

    app.run(tokio::time::sleep(Duration::from_millis(250))).await;

    let health = app.health().snapshot();
    assert!(health.ready);
    assert!(health.iterations >= 2);
    assert!(app.active_instances().is_empty());
    assert!(reporter.point("app.threads").is_some());
}

#[tokio::test]
async fn test_stopped_scheduler_reports_every_instance_without_breaking() {
    let jmx = target(1);
    let factory = FakeFactory::new()
        .with_server("good-1", &jmx)
        .with_server("good-2", &jmx);
    let reporter = RecordingReporter::new();
    let mut app = App::new(base_config(&["good-1", "good-2"]), factory, reporter.clone()).unwrap();
    assert_eq!(app.init().await, 2);

    app.collection_processor().shutdown();
    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.broken, 0);
    assert!(app.broken_instances().is_empty());
    assert_eq!(app.active_instances().len(), 2);
    for instance in ["good-1", "good-2"] {
        assert_eq!(reporter.last_status(instance), Some(ServiceCheckStatus::Critical));
    }
    let check = reporter.checks().pop().unwrap();
    assert!(check.message.unwrap().contains("scheduler"));

    app.collection_processor().reset();
    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 2);
    assert_eq!(reporter.last_status("good-1"), Some(ServiceCheckStatus::Ok));
    assert_eq!(reporter.last_status("good-2"), Some(ServiceCheckStatus::Ok));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_task_does_not_break_instance() {
    let jmx = target(1);
    let factory = FakeFactory::new()
        .with_server("good-1", &jmx)
        .with_server("good-2", &jmx);
    let reporter = RecordingReporter::new();
    let mut config = base_config(&["good-1", "good-2"]);
    config.init_config.collection_pool_size = 1;
    let mut app = App::new(config, factory, reporter.clone()).unwrap();
    app.init().await;

    // one instance holds the only worker while the other waits for it
    jmx.set_read_delay(Some(Duration::from_secs(2)));
    let processor = app.collection_processor();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        processor.shutdown();
    });

    let summary = app.do_iteration().await;
    assert_eq!(summary.collected, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.broken, 0);
    assert!(app.broken_instances().is_empty());
    assert_eq!(app.active_instances().len(), 2);
    let cancelled = reporter
        .checks()
        .into_iter()
        .find(|c| c.status == ServiceCheckStatus::Critical)
        .unwrap();
    assert!(cancelled.message.unwrap().contains("task cancelled"));

    app.collection_processor().reset();
    assert_eq!(app.do_iteration().await.collected, 2);
}

#[tokio::test]
async fn test_clean_up_stops_collection_until_next_init() {
    let jmx = target(1);
    let factory = FakeFactory::new().with_server("good", &jmx);
    let mut app = App::new(base_config(&["good"]), factory, RecordingReporter::new()).unwrap();
    app.init().await;
    app.clean_up().await;
    assert!(app.collection_processor().is_stopped());

    assert_eq!(app.init().await, 1);
    assert!(!app.collection_processor().is_stopped());
    assert_eq!(app.do_iteration().await.collected, 1);
}
