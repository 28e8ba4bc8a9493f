//! parceld - serve the object store over newline-delimited JSON
//!
//! Each stdin line is one request:
//!
//! ```text
//! {"op": "insert", "class": "GameScore", "data": {"score": 10}, "token": "..."}
//! {"op": "query", "class": "GameScore", "options": {"where": {"score": {"$gt": 5}}, "count": 1}}
//! {"op": "login", "username": "ann", "password": "..."}
//! ```
//!
//! Each response line is `{"result": ..}` or `{"error": {"kind": .., "message": ..}}`.

use anyhow::Context;
use clap::Parser;
use parcel_core::{Actor, Attributes, ObjectId, ObjectService, ParcelError, ParcelResult, QueryOptions, ServiceConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parceld", about = "Dynamic object store over JSON lines")]
struct Cli {
    /// JSON configuration file
    config: Option<PathBuf>,

    /// Requests carrying this key run as the master actor
    #[arg(long, env = "PARCEL_MASTER_KEY")]
    master_key: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Query {
        class: String,
        #[serde(default)]
        options: Value,
    },
    Get {
        class: String,
        id: String,
    },
    Insert {
        class: String,
        data: Attributes,
    },
    Update {
        class: String,
        id: String,
        data: Attributes,
    },
    Delete {
        class: String,
        id: String,
    },
    Signup {
        data: Attributes,
    },
    Login {
        username: String,
        password: String,
    },
    Logout,
    Me,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "masterKey")]
    master_key: Option<String>,
    #[serde(flatten)]
    request: Request,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            ServiceConfig::from_json_str(&text)?
        }
        None => ServiceConfig::default(),
    };

    let service = ObjectService::from_config(config)
        .await
        .context("cannot start object service")?;
    info!("parceld ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => match handle(&service, cli.master_key.as_deref(), envelope).await {
                Ok(result) => json!({ "result": result }),
                Err(e) => error_response(e.kind().as_str(), &e.to_string()),
            },
            Err(e) => error_response("invalid_request", &e.to_string()),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("stdin closed, shutting down");
    Ok(())
}

async fn handle(service: &ObjectService, master_key: Option<&str>, envelope: Envelope) -> ParcelResult<Value> {
    let actor = match (master_key, envelope.master_key.as_deref()) {
        (Some(expected), Some(given)) if expected == given => Actor::master(),
        (_, Some(_)) => return Err(ParcelError::Unauthorized("invalid master key".into())),
        _ => service.authenticate(envelope.token.as_deref()).await?,
    };
    debug!(request = ?envelope.request, master = actor.is_master(), "request");

    let accounts = service.accounts();
    match envelope.request {
        Request::Query { class, options } => {
            let options = QueryOptions::from_json(&options)?;
            to_json(service.query(&actor, &class, &options).await?)
        }
        Request::Get { class, id } => service.get(&actor, &class, &ObjectId::new(id)).await,
        Request::Insert { class, data } => service.insert(&actor, &class, data).await,
        Request::Update { class, id, data } => {
            if class == parcel_core::USER_CLASS {
                let user = accounts.update_user(&actor, &ObjectId::new(id), data).await?;
                Ok(user.to_public_json(&["password", "sessionToken", "authData"]))
            } else {
                service.update(&actor, &class, &ObjectId::new(id), data).await
            }
        }
        Request::Delete { class, id } => {
            service.delete(&actor, &class, &ObjectId::new(id)).await?;
            Ok(json!({}))
        }
        Request::Signup { data } => Ok(accounts.signup(data).await?.to_json()),
        Request::Login { username, password } => Ok(accounts.login(&username, &password).await?.to_json()),
        Request::Logout => {
            accounts.logout(envelope.token.as_deref().unwrap_or_default()).await?;
            Ok(json!({}))
        }
        Request::Me => {
            let user = accounts
                .current_user(envelope.token.as_deref().unwrap_or_default())
                .await?;
            Ok(user.to_public_json(&["password", "sessionToken", "authData"]))
        }
    }
}

fn to_json<T: serde::Serialize>(value: T) -> ParcelResult<Value> {
    serde_json::to_value(value).map_err(|e| ParcelError::Validation(e.to_string()))
}

fn error_response(kind: &str, message: &str) -> Value {
    json!({ "error": { "kind": kind, "message": message } })
}
