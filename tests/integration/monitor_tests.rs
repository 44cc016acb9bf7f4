//! Reconciliation ticks: stale `online` correction and auto-deploy of
//! freshly authorized sessions.

use botdock::models::bot::{BotStatus, BotUpdate};
use botdock::orchestrator::monitor::ProcessMonitor;

use super::support::{Harness, LONG_RUNNING_BOT};

#[tokio::test]
async fn stale_online_record_is_marked_offline() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("stale", LONG_RUNNING_BOT))
        .await;
    h.state
        .bots
        .update(
            &bot.id,
            BotUpdate {
                status: Some(BotStatus::Online),
                pid: Some(Some(999_999)),
                ..BotUpdate::default()
            },
        )
        .await
        .expect("fake online");

    let monitor = ProcessMonitor::new(h.state.clone());
    let report = monitor.run_tick().await.expect("tick ran");
    assert_eq!(report.corrected, vec![bot.id.clone()]);
    assert!(report.deployed.is_empty());

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Offline);
    assert!(record.pid.is_none());
    assert!(record.last_checked_at.is_some());

    let again = monitor.run_tick().await.expect("tick ran");
    assert!(again.corrected.is_empty(), "correction is not repeated");
}

#[tokio::test]
async fn authorized_session_is_deployed_once() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("auto", LONG_RUNNING_BOT))
        .await;
    h.state
        .bots
        .update(
            &bot.id,
            BotUpdate {
                phone_number: Some(Some("15551234567".into())),
                ..BotUpdate::default()
            },
        )
        .await
        .expect("assign number");
    h.connect_session("owner-1", &bot.id).await;

    let monitor = ProcessMonitor::new(h.state.clone());
    let report = monitor.run_tick().await.expect("tick ran");
    assert_eq!(report.deployed, vec![bot.id.clone()]);
    assert!(h.state.deployer.is_running(&bot.id).await);

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Online);
    let pid = record.pid;

    let again = monitor.run_tick().await.expect("tick ran");
    assert!(again.deployed.is_empty());
    assert!(again.corrected.is_empty());
    assert_eq!(h.state.bots.require(&bot.id).await.expect("bot").pid, pid);

    h.state.deployer.stop_all().await;
}

#[tokio::test]
async fn unauthorized_session_is_left_alone() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("waiting", LONG_RUNNING_BOT))
        .await;
    h.state
        .bots
        .update(
            &bot.id,
            BotUpdate {
                phone_number: Some(Some("15551234567".into())),
                ..BotUpdate::default()
            },
        )
        .await
        .expect("assign number");
    h.state.sessions.reset("owner-1", &bot.id).await.expect("empty session");

    let report = ProcessMonitor::new(h.state.clone())
        .run_tick()
        .await
        .expect("tick ran");
    assert!(report.deployed.is_empty());
    assert!(report.failed.is_empty());
    assert!(!h.state.deployer.is_running(&bot.id).await);
    assert_eq!(
        h.state.bots.require(&bot.id).await.expect("bot").status,
        BotStatus::Pending
    );
}

#[tokio::test]
async fn failed_auto_deploy_is_reported() {
    let h = Harness::new().await;
    let bot = h.create_bot("owner-1", h.empty_repo("nothing")).await;
    h.state
        .bots
        .update(
            &bot.id,
            BotUpdate {
                phone_number: Some(Some("15551234567".into())),
                ..BotUpdate::default()
            },
        )
        .await
        .expect("assign number");
    h.connect_session("owner-1", &bot.id).await;

    let report = ProcessMonitor::new(h.state.clone())
        .run_tick()
        .await
        .expect("tick ran");
    assert_eq!(report.failed, vec![bot.id.clone()]);

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Error);
}

#[tokio::test]
async fn crashed_bot_is_not_resurrected() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("crash-late", "sleep 0.6\nexit 1\n"))
        .await;
    h.connect_session("owner-1", &bot.id).await;
    assert!(h.state.deployer.deploy(&bot).await.success);
    h.wait_for_bot(&bot.id, |b| b.status == BotStatus::Error).await;

    let report = ProcessMonitor::new(h.state.clone())
        .run_tick()
        .await
        .expect("tick ran");
    assert!(report.deployed.is_empty());
    assert!(!h.state.deployer.is_running(&bot.id).await);
}

#[tokio::test]
async fn crash_during_auto_deploy_keeps_error_status() {
    let h = Harness::new().await;

    let crashing = h
        .create_bot("owner-1", h.source_repo("crash-mid-tick", "sleep 0.6\nexit 1\n"))
        .await;
    assert!(h.state.deployer.deploy(&crashing).await.success);

    let pending = h
        .create_bot("owner-1", h.source_repo("slow-auto", LONG_RUNNING_BOT))
        .await;
    h.state
        .bots
        .update(
            &pending.id,
            BotUpdate {
                phone_number: Some(Some("15551234567".into())),
                ..BotUpdate::default()
            },
        )
        .await
        .expect("assign number");
    h.connect_session("owner-1", &pending.id).await;

    let report = ProcessMonitor::new(h.state.clone())
        .run_tick()
        .await
        .expect("tick ran");
    assert_eq!(report.deployed, vec![pending.id.clone()]);
    assert!(!report.corrected.contains(&crashing.id));

    let record = h
        .wait_for_bot(&crashing.id, |b| b.status != BotStatus::Online)
        .await;
    assert_eq!(record.status, BotStatus::Error);
    assert_eq!(record.error.as_deref(), Some("Bot process exited with code 1"));

    let again = ProcessMonitor::new(h.state.clone())
        .run_tick()
        .await
        .expect("tick ran");
    assert!(again.corrected.is_empty());
    assert_eq!(
        h.state.bots.require(&crashing.id).await.expect("bot").status,
        BotStatus::Error
    );

    h.state.deployer.stop_all().await;
}
