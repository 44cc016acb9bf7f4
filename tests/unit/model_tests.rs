use botdock::models::bot::{Bot, BotRuntimeConfig, BotStatus, BotUpdate, PairingStatus};
use botdock::models::process::DeployResult;
use botdock::models::session::{SessionRecord, SessionState};

#[test]
fn new_bot_starts_pending() {
    let bot = Bot::new("Helper".into(), "owner-1".into(), "https://example.com/r.git".into());

    assert_eq!(bot.status, BotStatus::Pending);
    assert_eq!(bot.pairing_status, PairingStatus::None);
    assert!(bot.pid.is_none());
    assert!(bot.logs.is_empty());
    assert!(!bot.id.is_empty());
}

#[test]
fn status_round_trips_through_wire_names() {
    for status in [
        BotStatus::Pending,
        BotStatus::Pairing,
        BotStatus::PairingFailed,
        BotStatus::Online,
        BotStatus::Offline,
        BotStatus::Restarting,
        BotStatus::Error,
    ] {
        assert_eq!(BotStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(BotStatus::parse("crashed"), None);
    assert_eq!(PairingStatus::parse("timed_out"), Some(PairingStatus::TimedOut));
}

#[test]
fn terminal_update_clears_pid() {
    let patch = BotUpdate::terminal(BotStatus::Offline);
    assert_eq!(patch.status, Some(BotStatus::Offline));
    assert_eq!(patch.pid, Some(None));
    assert!(patch.error.is_none());
}

#[test]
fn failed_update_records_message() {
    let patch = BotUpdate::failed("No main bot file found");
    assert_eq!(patch.status, Some(BotStatus::Error));
    assert_eq!(patch.pid, Some(None));
    assert_eq!(patch.error, Some(Some("No main bot file found".to_owned())));
}

#[test]
fn session_record_promotes_to_connected() {
    let record = SessionRecord::pairing("15551234567".into());
    assert_eq!(record.status, SessionState::Pairing);
    assert!(record.connected_at.is_none());

    let connected = record.connected("15551234567@s".into());
    assert_eq!(connected.status, SessionState::Connected);
    assert!(connected.connected_at.is_some());
    assert_eq!(connected.session_id.as_deref(), Some("15551234567@s"));
}

#[test]
fn runtime_config_uses_camel_case_and_defaults() {
    let config: BotRuntimeConfig =
        serde_json::from_str(r#"{"prefix": "!", "welcomeMessage": "hi"}"#).expect("parse");
    assert_eq!(config.prefix, "!");
    assert_eq!(config.welcome_message, "hi");
    assert!(config.online);
    assert_eq!(config.goodbye_message, BotRuntimeConfig::default().goodbye_message);
}

#[test]
fn failed_deploy_result_omits_empty_fields() {
    let json = serde_json::to_value(DeployResult::failure("boom")).expect("serialize");
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "boom");
    assert!(json.get("pid").is_none());
    assert!(json.get("mainFile").is_none());
}
