//! Deployment pipeline against real child processes.

use std::time::Duration;

use botdock::config::InstallFailurePolicy;
use botdock::models::bot::BotStatus;
use botdock::models::process::ProcessState;
use botdock::orchestrator::deployer::bot_port;
use botdock::orchestrator::lifecycle;

use super::support::{Harness, CRASHING_BOT, LONG_RUNNING_BOT};

#[tokio::test]
async fn deploy_marks_bot_online_and_stop_marks_it_offline() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("echo", LONG_RUNNING_BOT))
        .await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(result.success, "deploy failed: {:?}", result.error);
    assert_eq!(result.main_file.as_deref(), Some("bot.sh"));
    assert!(!result.has_package);
    let pid = result.pid.expect("pid");

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Online);
    assert_eq!(record.pid, Some(pid));
    assert!(record.deployed_at.is_some());
    assert!(record.error.is_none());

    let info = h.state.deployer.process_info(&bot.id).await.expect("registered");
    assert_eq!(info.pid, pid);
    assert_eq!(info.status, ProcessState::Running);

    let port = bot_port(h.state.config.deploy.base_port, &bot.id);
    let banner = format!("bot {} listening on {port}", bot.id);
    h.wait_for_bot(&bot.id, |b| {
        b.logs.contains(&banner) && b.logs.iter().any(|l| l == "ERROR: warming up")
    })
    .await;

    assert!(h.state.deployer.stop(&bot.id).await);
    assert!(!h.state.deployer.is_running(&bot.id).await);

    let stopped = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(stopped.status, BotStatus::Offline);
    assert!(stopped.pid.is_none());
    assert!(stopped.error.is_none());
    assert!(stopped.last_stopped_at.is_some());
}

#[tokio::test]
async fn redeploy_replaces_the_running_process() {
    let h = Harness::new().await;
    let repo = h.source_repo("twice", LONG_RUNNING_BOT);
    h.add_file(&repo, "first-only.txt", "from the first clone\n");
    let bot = h.create_bot("owner-1", repo.clone()).await;

    let first = h.state.deployer.deploy(&bot).await;
    assert!(first.success);
    let deploy_dir = h
        .state
        .deployer
        .deploy_dir("owner-1", &bot.id)
        .expect("deploy dir");
    assert!(deploy_dir.join("first-only.txt").is_file());

    std::fs::remove_file(std::path::Path::new(&repo).join("first-only.txt"))
        .expect("drop file from source");
    let second = h.state.deployer.deploy(&bot).await;
    assert!(second.success, "redeploy failed: {:?}", second.error);
    assert_ne!(first.pid, second.pid);

    let active = h.state.deployer.active_processes().await;
    assert_eq!(active.len(), 1, "at most one process per bot");
    assert_eq!(Some(active[0].pid), second.pid);

    assert!(
        !deploy_dir.join("first-only.txt").exists(),
        "redeploy left files from the previous clone"
    );
    assert!(deploy_dir.join("bot.sh").is_file());

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Online);
    assert_eq!(record.pid, second.pid);

    h.state.deployer.stop_all().await;
    assert!(h.state.deployer.active_processes().await.is_empty());
}

#[tokio::test]
async fn missing_entrypoint_fails_the_deploy() {
    let h = Harness::new().await;
    let bot = h.create_bot("owner-1", h.empty_repo("docs-only")).await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("No main bot file found"));

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Error);
    assert_eq!(record.error.as_deref(), Some("No main bot file found"));
    assert!(record.pid.is_none());
}

#[tokio::test]
async fn clone_failure_is_recorded() {
    let h = Harness::new().await;
    let missing = h.path_str("repos/does-not-exist");
    let bot = h.create_bot("owner-1", missing).await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(!result.success);
    let error = result.error.expect("error");
    assert!(error.starts_with("Failed to clone repository"), "{error}");

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Error);
}

#[tokio::test]
async fn immediate_exit_is_a_failed_deploy() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("crash", CRASHING_BOT))
        .await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Bot process exited immediately (code 3)")
    );
    assert!(!h.state.deployer.is_running(&bot.id).await);

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Error);
    assert!(record.pid.is_none());
}

#[tokio::test]
async fn crash_after_startup_is_recorded_as_error() {
    let h = Harness::new().await;
    let script = "echo up\nsleep 0.8\nexit 2\n";
    let bot = h.create_bot("owner-1", h.source_repo("late-crash", script)).await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(result.success, "deploy failed: {:?}", result.error);

    let record = h
        .wait_for_bot(&bot.id, |b| b.status == BotStatus::Error)
        .await;
    assert_eq!(record.error.as_deref(), Some("Bot process exited with code 2"));
    assert!(record.pid.is_none());
    assert!(record.last_stopped_at.is_some());
    assert!(record.logs.iter().any(|l| l == "up"));
    assert!(!h.state.deployer.is_running(&bot.id).await);
}

#[tokio::test]
async fn clean_exit_after_startup_is_offline() {
    let h = Harness::new().await;
    let script = "sleep 0.8\nexit 0\n";
    let bot = h.create_bot("owner-1", h.source_repo("one-shot", script)).await;

    assert!(h.state.deployer.deploy(&bot).await.success);

    let record = h
        .wait_for_bot(&bot.id, |b| b.status == BotStatus::Offline)
        .await;
    assert!(record.error.is_none());
    assert!(record.pid.is_none());
}

#[tokio::test]
async fn deploy_writes_default_runtime_config() {
    let h = Harness::new().await;
    let script = "test -f \"$CONFIG_PATH\" && echo \"config at $CONFIG_PATH\"\nexec sleep 5\n";
    let bot = h.create_bot("owner-1", h.source_repo("config", script)).await;

    assert!(h.state.deployer.deploy(&bot).await.success);

    let path = h
        .state
        .deployer
        .runtime_config_path("owner-1", &bot.id)
        .expect("path");
    assert!(path.is_file());
    h.wait_for_bot(&bot.id, |b| b.logs.iter().any(|l| l.starts_with("config at ")))
        .await;

    h.state.deployer.stop_all().await;
}

#[tokio::test]
#[serial_test::serial]
async fn bot_environment_is_allowlisted() {
    std::env::set_var("BOTDOCK_TEST_SECRET", "hunter2");
    let h = Harness::new().await;
    let script = "echo \"secret=${BOTDOCK_TEST_SECRET:-absent} env=$NODE_ENV owner=$OWNER_ID\"\nexec sleep 5\n";
    let bot = h.create_bot("owner-9", h.source_repo("env", script)).await;

    assert!(h.state.deployer.deploy(&bot).await.success);
    let record = h
        .wait_for_bot(&bot.id, |b| b.logs.iter().any(|l| l.starts_with("secret=")))
        .await;
    assert!(record
        .logs
        .iter()
        .any(|l| l == "secret=absent env=production owner=owner-9"));

    h.state.deployer.stop_all().await;
    std::env::remove_var("BOTDOCK_TEST_SECRET");
}

#[tokio::test]
async fn restart_redeploys_and_stamps_restart_time() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("restart", LONG_RUNNING_BOT))
        .await;
    let first = h.state.deployer.deploy(&bot).await;
    assert!(first.success);

    let result = lifecycle::restart_bot(&h.state, &bot.id).await.expect("restart");
    assert!(result.success, "restart failed: {:?}", result.error);
    assert_ne!(result.pid, first.pid);

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Online);
    assert!(record.last_restart_at.is_some());

    h.state.deployer.stop_all().await;
}

#[tokio::test]
async fn clean_exit_inside_grace_window_is_a_failed_deploy() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("quick-exit", "echo done\nexit 0\n"))
        .await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Bot process exited immediately (code 0)")
    );

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Error);
    assert!(record.pid.is_none());
}

#[tokio::test]
async fn concurrent_deploy_of_one_bot_is_rejected() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("single-flight", LONG_RUNNING_BOT))
        .await;

    let (first, second) = tokio::join!(
        h.state.deployer.deploy(&bot),
        h.state.deployer.deploy(&bot)
    );
    let (winner, loser) = if first.success { (first, second) } else { (second, first) };
    assert!(winner.success, "deploy failed: {:?}", winner.error);
    assert!(!loser.success);
    assert_eq!(loser.error.as_deref(), Some("deployment already in progress"));

    let active = h.state.deployer.active_processes().await;
    assert_eq!(active.len(), 1);
    assert_eq!(Some(active[0].pid), winner.pid);
    assert_eq!(
        h.state.bots.require(&bot.id).await.expect("bot").status,
        BotStatus::Online
    );

    h.state.deployer.stop_all().await;
}

#[tokio::test]
async fn install_failure_aborts_when_configured() {
    let h = Harness::with_config(|config| {
        config.deploy.install_command = vec!["false".into()];
        config.deploy.install_failure_policy = InstallFailurePolicy::Abort;
    })
    .await;
    let repo = h.source_repo("broken-deps", LONG_RUNNING_BOT);
    h.add_file(&repo, "package.json", "{}\n");
    let bot = h.create_bot("owner-1", repo).await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(!result.success);
    let error = result.error.expect("error");
    assert!(error.starts_with("Failed to install dependencies"), "{error}");
    assert!(!h.state.deployer.is_running(&bot.id).await);

    let record = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(record.status, BotStatus::Error);
}

#[tokio::test]
async fn install_failure_continues_by_default() {
    let h = Harness::with_config(|config| {
        config.deploy.install_command = vec!["false".into()];
    })
    .await;
    let repo = h.source_repo("flaky-deps", LONG_RUNNING_BOT);
    h.add_file(&repo, "package.json", "{}\n");
    let bot = h.create_bot("owner-1", repo).await;

    let result = h.state.deployer.deploy(&bot).await;
    assert!(result.success, "deploy failed: {:?}", result.error);
    assert!(result.has_package);

    h.state.deployer.stop_all().await;
}

#[tokio::test]
async fn ignored_sigterm_escalates_to_a_group_kill() {
    let h = Harness::new().await;
    let script = "trap '' TERM\nsleep 37 &\necho \"worker $!\"\nwhile true; do sleep 0.1; done\n";
    let bot = h.create_bot("owner-1", h.source_repo("stubborn", script)).await;

    assert!(h.state.deployer.deploy(&bot).await.success);
    let record = h
        .wait_for_bot(&bot.id, |b| b.logs.iter().any(|l| l.starts_with("worker ")))
        .await;
    let worker: u32 = record
        .logs
        .iter()
        .find_map(|l| l.strip_prefix("worker "))
        .and_then(|pid| pid.trim().parse().ok())
        .expect("worker pid");

    let started = tokio::time::Instant::now();
    assert!(h.state.deployer.stop(&bot.id).await);
    assert!(
        started.elapsed() >= h.state.config.deploy.stop_grace(),
        "stop returned before the grace period"
    );
    assert!(!h.state.deployer.is_running(&bot.id).await);

    let stopped = h.state.bots.require(&bot.id).await.expect("bot");
    assert_eq!(stopped.status, BotStatus::Offline);
    assert!(stopped.pid.is_none());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while process_alive(worker) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker {worker} survived the forced stop"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Whether `pid` is a live, non-zombie process.
fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                stat.rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next().map(str::to_owned))
            })
            .is_some_and(|state| state != "Z" && state != "X")
    } else {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .is_ok_and(|status| status.success())
    }
}
