#![forbid(unsafe_code)]

//! `botdock-ctl`: local operator CLI for `botdock`.
//!
//! Connects to the IPC socket and sends one JSON command to the server.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::{json, Value};

/// Environment variable holding the optional IPC shared secret.
const TOKEN_ENV: &str = "BOTDOCK_IPC_TOKEN";

#[derive(Debug, Parser)]
#[command(
    name = "botdock-ctl",
    about = "Local CLI for the botdock server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "botdock")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List bots, optionally for one owner.
    List {
        /// Only list bots owned by this account.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show a bot's record and process state.
    Status {
        /// Bot ID.
        id: String,
    },

    /// Deploy (or redeploy) a bot.
    Deploy {
        /// Bot ID.
        id: String,
    },

    /// Stop a running bot.
    Stop {
        /// Bot ID.
        id: String,
    },

    /// Stop then redeploy a bot.
    Restart {
        /// Bot ID.
        id: String,
    },

    /// Request a pairing code for a bot.
    Pair {
        /// Bot ID.
        id: String,
        /// Account number to pair with.
        number: String,
    },

    /// Show a pairing session's status and files.
    Session {
        /// Owner ID.
        owner: String,
        /// Bot ID.
        bot: String,
    },
}

fn build_request(command: &Command) -> Value {
    match command {
        Command::List { owner } => {
            let mut req = json!({ "command": "list" });
            if let Some(owner) = owner {
                req["owner"] = Value::String(owner.clone());
            }
            req
        }
        Command::Status { id } => json!({ "command": "status", "id": id }),
        Command::Deploy { id } => json!({ "command": "deploy", "id": id }),
        Command::Stop { id } => json!({ "command": "stop", "id": id }),
        Command::Restart { id } => json!({ "command": "restart", "id": id }),
        Command::Pair { id, number } => {
            json!({ "command": "pair", "id": id, "number": number })
        }
        Command::Session { owner, bot } => {
            json!({ "command": "session", "owner": owner, "bot": bot })
        }
    }
}

fn main() {
    let args = Cli::parse();

    let mut request_json = build_request(&args.command);
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        request_json["auth_token"] = Value::String(token);
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj.get("ok").and_then(Value::as_bool).unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is botdock running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &Value,
) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
