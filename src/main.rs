mod audit;
mod auth;
mod cli;
mod config;
mod error;
mod logging;
mod migrations;
mod mime;
mod record;
mod records;
mod rule;
mod schema;
mod storage;
mod store;
mod validation;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::cell::RefCell;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(
    name = "audioshelf",
    about = "Collection schema, access rules and records for an audio library"
)]
pub struct Args {
    #[arg(long, help = "Config file path (replaces the layered config)")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "AUDIOSHELF_DATA_DIR", help = "Directory holding the store and attachments")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "AUDIOSHELF_PUBLIC_URL", help = "Base URL used for file links")]
    pub public_url: Option<String>,

    #[arg(long, help = "Act as superuser, bypassing access rules")]
    pub admin: bool,

    #[arg(long, value_name = "FILTER", help = "Log level or filter (e.g. debug, audioshelf=trace)")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<cli::Command>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };

    // Command line and environment win over config files
    if let Some(dir) = &args.data_dir {
        cfg.storage.data_dir = Some(dir.clone());
    }
    if let Some(url) = &args.public_url {
        cfg.storage.public_url = Some(url.clone());
    }
    if let Some(level) = &args.log_level {
        cfg.logging.level = Some(level.clone());
    }

    if let Err(errors) = cfg.validate() {
        for e in &errors {
            eprintln!("config error {}", e);
        }
        return Err(anyhow!("invalid configuration ({} errors)", errors.len()));
    }

    logging::init(cfg.log_level(), args.log_level.is_some(), cfg.log_format())?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let audit = if cfg.audit_enabled() {
        let path = cfg.audit_dir().join(format!("{}.jsonl", session_id));
        match audit::AuditLog::new(&path, &session_id) {
            Ok(log) => log,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "audit log unavailable");
                audit::AuditLog::disabled()
            }
        }
    } else {
        audit::AuditLog::disabled()
    };
    debug!(session_id = %session_id, audit = ?audit.path, "starting");

    let ctx = cli::Context {
        data_dir: cfg.data_dir(),
        public_url: cfg.public_url().trim_end_matches('/').to_string(),
        superuser: args.admin,
        audit: RefCell::new(audit),
        config: cfg,
    };

    match args.command {
        Some(command) => cli::run(&ctx, command),
        None => cli::run_repl(&ctx),
    }
}
