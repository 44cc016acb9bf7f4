//! Shared fixtures: a temp data dir, an in-memory database, `sh` as the
//! bot runtime, and a scripted pairing transport.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use botdock::config::GlobalConfig;
use botdock::models::bot::Bot;
use botdock::models::session::SessionRecord;
use botdock::pairing::store::CREDS_FILE;
use botdock::pairing::{PairingEvent, PairingLink, PairingRequest, PairingTransport};
use botdock::persistence::db;
use botdock::state::AppState;
use botdock::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bot that logs to both streams and runs until terminated.
pub const LONG_RUNNING_BOT: &str = r#"echo "bot $BOT_ID listening on $PORT"
echo "warming up" >&2
trap 'exit 0' TERM
while true; do sleep 0.1; done
"#;

/// Bot that dies before the startup grace window ends.
pub const CRASHING_BOT: &str = "echo \"bad config\" >&2\nexit 3\n";

/// Scripted transport: replays `initial` on open and keeps the sender.
#[derive(Default)]
pub struct ScriptedTransport {
    pub initial: Vec<PairingEvent>,
    links: Mutex<Vec<(PairingRequest, mpsc::Sender<PairingEvent>)>>,
}

impl ScriptedTransport {
    /// Transport that replays `initial` on every open.
    pub fn replaying(initial: Vec<PairingEvent>) -> Self {
        Self {
            initial,
            ..Self::default()
        }
    }

    pub fn issuing(code: &str) -> Self {
        Self::replaying(vec![PairingEvent::CodeIssued(code.into())])
    }

    /// Sender and request for the most recently opened link.
    pub fn last(&self) -> (PairingRequest, mpsc::Sender<PairingEvent>) {
        self.links.lock().unwrap().last().cloned().expect("link opened")
    }
}

impl PairingTransport for ScriptedTransport {
    fn open(
        &self,
        request: PairingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<PairingLink>> + Send + '_>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(16);
            for event in &self.initial {
                tx.send(event.clone()).await.expect("queue event");
            }
            self.links.lock().unwrap().push((request, tx));
            Ok(PairingLink::new(rx, CancellationToken::new()))
        })
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub state: Arc<AppState>,
    pub transport: Arc<ScriptedTransport>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_transport(ScriptedTransport::issuing("TEST-CODE")).await
    }

    pub async fn with_transport(transport: ScriptedTransport) -> Self {
        Self::configured(transport, |_| {}).await
    }

    /// Harness whose config is adjusted by `tweak` before use.
    pub async fn with_config(tweak: impl FnOnce(&mut GlobalConfig)) -> Self {
        Self::configured(ScriptedTransport::issuing("TEST-CODE"), tweak).await
    }

    async fn configured(transport: ScriptedTransport, tweak: impl FnOnce(&mut GlobalConfig)) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        let toml = format!(
            r#"
data_dir = '{}'
http_port = 0
ipc_name = "botdock-test"
monitor_interval_seconds = 1

[deploy]
clone_command = ["cp", "-R"]
install_command = ["true"]
runtime_command = "sh"
entrypoints = ["bot.sh"]
source_extension = "sh"
startup_grace_millis = 300
stop_grace_seconds = 2
log_flush_every = 1

[pairing]
bridge_command = ["true"]
timeout_seconds = 1
close_delay_millis = 10
"#,
            data_dir.to_str().expect("utf8 path")
        );
        let mut config = GlobalConfig::from_toml_str(&toml).expect("config");
        tweak(&mut config);
        let config = Arc::new(config);
        let pool = Arc::new(db::connect_memory().await.expect("db"));
        let transport = Arc::new(transport);
        let state = Arc::new(AppState::new(
            config,
            pool,
            Arc::clone(&transport) as Arc<dyn PairingTransport>,
        ));

        Self {
            temp,
            state,
            transport,
        }
    }

    /// Create a source tree holding `bot.sh` and return its path as a URL.
    pub fn source_repo(&self, name: &str, script: &str) -> String {
        let dir = self.temp.path().join("repos").join(name);
        std::fs::create_dir_all(&dir).expect("mkdir repo");
        std::fs::write(dir.join("bot.sh"), script).expect("write bot.sh");
        dir.to_str().expect("utf8 path").to_owned()
    }

    /// Add `name` with `contents` to an existing source tree.
    pub fn add_file(&self, repo_url: &str, name: &str, contents: &str) {
        std::fs::write(std::path::Path::new(repo_url).join(name), contents).expect("write file");
    }

    /// Source tree with no runnable file.
    pub fn empty_repo(&self, name: &str) -> String {
        let dir = self.temp.path().join("repos").join(name);
        std::fs::create_dir_all(&dir).expect("mkdir repo");
        std::fs::write(dir.join("README.md"), "# nothing to run\n").expect("write readme");
        dir.to_str().expect("utf8 path").to_owned()
    }

    /// Absolute path under the harness temp dir, as a string.
    pub fn path_str(&self, relative: &str) -> String {
        self.temp
            .path()
            .join(relative)
            .to_str()
            .expect("utf8 path")
            .to_owned()
    }

    pub async fn create_bot(&self, owner: &str, repo_url: String) -> Bot {
        let bot = Bot::new("Test Bot".into(), owner.into(), repo_url);
        self.state.bots.create(&bot).await.expect("create bot")
    }

    /// Write credentials and a connected record for (owner, bot).
    pub async fn connect_session(&self, owner: &str, bot_id: &str) -> PathBuf {
        let dir = self.state.sessions.reset(owner, bot_id).await.expect("reset");
        std::fs::write(dir.join(CREDS_FILE), "{}").expect("creds");
        let record = SessionRecord::pairing("15551234567".into()).connected("s-1".into());
        self.state
            .sessions
            .write_record(owner, bot_id, &record)
            .expect("record");
        dir
    }

    /// Poll the bot record until `pred` holds.
    pub async fn wait_for_bot(&self, bot_id: &str, pred: impl Fn(&Bot) -> bool) -> Bot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let bot = self.state.bots.require(bot_id).await.expect("bot");
            if pred(&bot) {
                return bot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "bot {bot_id} never reached the expected state: {bot:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
