use crate::{
    audit::AuditLog,
    auth::{self, AuthSession},
    config::Config,
    migrations::{self, MigrationRunner},
    record::{FileUpload, Record, RecordPayload},
    records::RecordService,
    rule::{Operation, Rule},
    storage::FileStorage,
    store::{DataLock, Database},
};
use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HISTORY_FILE: &str = ".shell_history";

pub struct Context {
    pub config: Config,
    pub data_dir: PathBuf,
    pub public_url: String,
    pub superuser: bool,
    pub audit: RefCell<AuditLog>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply, revert or inspect schema migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
    /// Inspect collection definitions
    #[command(subcommand)]
    Collections(CollectionsCommand),
    /// Explain the access rules of a collection
    #[command(subcommand)]
    Rules(RulesCommand),
    /// List, view and modify records
    #[command(subcommand)]
    Records(RecordsCommand),
    /// Log in and out of an auth collection
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Interactive shell accepting the same commands
    Shell,
}

#[derive(Subcommand, Debug)]
pub enum MigrateCommand {
    /// Apply every pending migration
    Up {
        #[arg(long, help = "Print the schema diff without applying")]
        dry_run: bool,
    },
    /// Revert the most recently applied migrations
    Down {
        #[arg(default_value_t = 1)]
        count: usize,
    },
    /// Show applied and pending migrations
    Status,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
pub enum CollectionsCommand {
    List,
    Show {
        collection: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum RulesCommand {
    Explain { collection: String },
}

#[derive(Subcommand, Debug)]
pub enum RecordsCommand {
    List {
        collection: String,
        #[arg(long, help = "Filter expression, ANDed with the list rule")]
        filter: Option<String>,
        #[arg(long, help = "Comma-separated sort fields, '-' prefix for descending")]
        sort: Option<String>,
    },
    View {
        collection: String,
        id: String,
    },
    Create {
        collection: String,
        #[arg(long = "field", value_name = "NAME=VALUE", action = clap::ArgAction::Append)]
        fields: Vec<String>,
        #[arg(long = "file", value_name = "FIELD=PATH", action = clap::ArgAction::Append)]
        files: Vec<String>,
    },
    Update {
        collection: String,
        id: String,
        #[arg(long = "field", value_name = "NAME=VALUE", action = clap::ArgAction::Append)]
        fields: Vec<String>,
        #[arg(long = "file", value_name = "FIELD=PATH", action = clap::ArgAction::Append)]
        files: Vec<String>,
    },
    Delete {
        collection: String,
        id: String,
    },
    /// Print the public URLs of a record's files
    FileUrl {
        collection: String,
        id: String,
        field: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    Login {
        email: String,
        #[arg(long, env = "AUDIOSHELF_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = "users")]
        collection: String,
    },
    Logout,
    Whoami,
}

/// One line typed into the shell
#[derive(Parser, Debug)]
#[command(name = "audioshelf", no_binary_name = true, disable_version_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Command,
}

pub fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Migrate(cmd) => handle_migrate(ctx, cmd),
        Command::Collections(cmd) => handle_collections(ctx, cmd),
        Command::Rules(cmd) => handle_rules(ctx, cmd),
        Command::Records(cmd) => handle_records(ctx, cmd),
        Command::Auth(cmd) => handle_auth(ctx, cmd),
        Command::Shell => run_repl(ctx),
    }
}

pub fn run_repl(ctx: &Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let history = ctx.data_dir.join(HISTORY_FILE);
    // First run has no history yet
    let _ = rl.load_history(&history);

    println!("audioshelf - type help for commands, exit to quit");

    loop {
        match rl.readline("shelf> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                match line {
                    "exit" | "quit" => break,
                    "help" => {
                        print_help();
                        continue;
                    }
                    _ => {}
                }

                let words = match shell_words::split(line) {
                    Ok(words) => words,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        continue;
                    }
                };
                match ShellLine::try_parse_from(words) {
                    Ok(ShellLine {
                        command: Command::Shell,
                    }) => println!("Already in the shell"),
                    Ok(parsed) => {
                        if let Err(e) = run(ctx, parsed.command) {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    Err(e) => {
                        let _ = e.print();
                    }
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(&history) {
        warn!(error = %e, "failed to save shell history");
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  migrate up [--dry-run]            - apply pending migrations");
    println!("  migrate down [N]                  - revert the last N migrations");
    println!("  migrate status                    - list applied and pending migrations");
    println!("  collections list                  - list collections");
    println!("  collections show <c> [--format yaml]");
    println!("  rules explain <c>                 - show each operation's rule");
    println!("Records:");
    println!("  records list <c> [--filter EXPR] [--sort FIELDS]");
    println!("  records view <c> <id>");
    println!("  records create <c> --field k=v --file field=path");
    println!("  records update <c> <id> --field k=v --file field=path");
    println!("  records delete <c> <id>");
    println!("  records file-url <c> <id> <field>");
    println!("Auth:");
    println!("  auth login <email> --password <pw>");
    println!("  auth logout");
    println!("  auth whoami");
    println!("  exit                              - quit");
}

fn open_db(ctx: &Context) -> Result<Database> {
    Database::open(&ctx.data_dir)
}

/// Lock the data directory for a command that rewrites the store
fn lock_if(ctx: &Context, writes: bool) -> Result<Option<DataLock>> {
    if !writes {
        return Ok(None);
    }
    Ok(Some(DataLock::acquire(&ctx.data_dir)?))
}

/// Persist the store, then remove the blobs it no longer references
fn commit(ctx: &Context, db: &mut Database) -> Result<()> {
    db.commit(&FileStorage::new(&ctx.data_dir))
}

fn load_session(ctx: &Context) -> Result<Option<AuthSession>> {
    AuthSession::load(&ctx.config.session_file())
}

fn request_context(ctx: &Context, db: &Database) -> Result<auth::RequestContext> {
    let session = load_session(ctx)?;
    let request = auth::request_context(db, session.as_ref(), ctx.superuser);
    ctx.audit
        .borrow_mut()
        .set_actor(request.actor().as_deref());
    Ok(request)
}

fn handle_migrate(ctx: &Context, cmd: MigrateCommand) -> Result<()> {
    let runner = MigrationRunner::new(migrations::all())?;
    let writes = matches!(
        cmd,
        MigrateCommand::Up { dry_run: false } | MigrateCommand::Down { .. }
    );
    let _lock = lock_if(ctx, writes)?;
    let mut db = open_db(ctx)?;

    match cmd {
        MigrateCommand::Up { dry_run: true } => {
            let pending = runner.pending(&db);
            if pending.is_empty() {
                println!("No pending migrations");
                return Ok(());
            }
            let preview = runner.preview_up(&db)?;
            let before = serde_json::to_string_pretty(db.collections())?;
            let after = serde_json::to_string_pretty(preview.collections())?;
            for unit in &pending {
                println!("would apply {}", unit.name);
            }
            print!("{}", diffy::create_patch(&before, &after));
        }
        MigrateCommand::Up { dry_run: false } => {
            let result = runner.up(&mut db, &mut ctx.audit.borrow_mut());
            // Units applied before a failure stay applied
            commit(ctx, &mut db)?;
            let applied = result?;
            if applied.is_empty() {
                println!("No pending migrations");
            }
            for unit in applied {
                println!("applied {}", unit.name);
            }
        }
        MigrateCommand::Down { count } => {
            let result = runner.down(&mut db, count, &mut ctx.audit.borrow_mut());
            commit(ctx, &mut db)?;
            let reverted = result?;
            if reverted.is_empty() {
                println!("Nothing to revert");
            }
            for unit in reverted {
                println!("reverted {}", unit.name);
            }
        }
        MigrateCommand::Status => {
            for status in runner.status(&db) {
                match status.applied_at {
                    Some(at) => println!(
                        "[x] {} (applied {})",
                        status.name,
                        at.format("%Y-%m-%d %H:%M:%S")
                    ),
                    None => println!("[ ] {}", status.name),
                }
            }
        }
    }
    Ok(())
}

fn handle_collections(ctx: &Context, cmd: CollectionsCommand) -> Result<()> {
    let db = open_db(ctx)?;
    match cmd {
        CollectionsCommand::List => {
            for c in db.collections() {
                println!(
                    "{:<16} {:<20} {:<5} {} records",
                    c.id,
                    c.name,
                    c.collection_type.as_str(),
                    db.records(&c.id).len()
                );
            }
        }
        CollectionsCommand::Show { collection, format } => {
            let collection = db.require_collection(&collection)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(collection)?),
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(collection)?),
            }
        }
    }
    Ok(())
}

fn handle_rules(ctx: &Context, cmd: RulesCommand) -> Result<()> {
    let db = open_db(ctx)?;
    let RulesCommand::Explain { collection } = cmd;
    let collection = db.require_collection(&collection)?;

    println!("{} ({})", collection.name, collection.id);
    for op in Operation::ALL {
        let source = collection.rule_source(op);
        let shown = match source {
            None => "null".to_string(),
            Some(s) => format!("{:?}", s),
        };
        let policy = Rule::parse(source)
            .map(|r| r.policy().to_string())
            .unwrap_or_else(|e| format!("invalid ({})", e));
        println!("  {:<7} {:<36} {}", op.as_str(), shown, policy);
    }
    if let Some(options) = collection.auth_options() {
        let shown = match &options.manage_rule {
            None => "null".to_string(),
            Some(s) => format!("{:?}", s),
        };
        println!("  {:<7} {}", "manage", shown);
    }
    Ok(())
}

fn handle_records(ctx: &Context, cmd: RecordsCommand) -> Result<()> {
    let writes = matches!(
        cmd,
        RecordsCommand::Create { .. } | RecordsCommand::Update { .. } | RecordsCommand::Delete { .. }
    );
    let _lock = lock_if(ctx, writes)?;
    let mut db = open_db(ctx)?;
    let request = request_context(ctx, &db)?;
    let storage = FileStorage::new(&ctx.data_dir);
    let mut audit = ctx.audit.borrow_mut();
    let mut service = RecordService::new(&mut db, &storage, &ctx.public_url, &mut audit);

    let mutated = match cmd {
        RecordsCommand::List {
            collection,
            filter,
            sort,
        } => {
            let rows = service.get_full_list(
                &request,
                &collection,
                filter.as_deref(),
                sort.as_deref(),
            )?;
            let out: Vec<Value> = rows.iter().map(Record::to_public_json).collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
            false
        }
        RecordsCommand::View { collection, id } => {
            let record = service.get_one(&request, &collection, &id)?;
            print_record(&record)?;
            false
        }
        RecordsCommand::Create {
            collection,
            fields,
            files,
        } => {
            let payload = build_payload(&fields, &files)?;
            let record = service.create(&request, &collection, payload)?;
            print_record(&record)?;
            true
        }
        RecordsCommand::Update {
            collection,
            id,
            fields,
            files,
        } => {
            let payload = build_payload(&fields, &files)?;
            let record = service.update(&request, &collection, &id, payload)?;
            print_record(&record)?;
            true
        }
        RecordsCommand::Delete { collection, id } => {
            service.delete(&request, &collection, &id)?;
            println!("deleted {}", id);
            true
        }
        RecordsCommand::FileUrl {
            collection,
            id,
            field,
        } => {
            let record = service.get_one(&request, &collection, &id)?;
            for url in service.file_urls(&record, &field)? {
                println!("{}", url);
            }
            false
        }
    };

    drop(audit);
    if mutated {
        commit(ctx, &mut db)?;
    }
    Ok(())
}

fn handle_auth(ctx: &Context, cmd: AuthCommand) -> Result<()> {
    let session_file = ctx.config.session_file();
    match cmd {
        AuthCommand::Login {
            email,
            password,
            collection,
        } => {
            let db = open_db(ctx)?;
            let mut audit = ctx.audit.borrow_mut();
            match auth::authenticate_with_password(&db, &collection, &email, &password) {
                Ok(identity) => {
                    audit.set_actor(Some(identity.email()));
                    if let Err(e) = audit.login(identity.collection_name(), &email, true) {
                        warn!(error = %e, "failed to write audit event");
                    }
                    AuthSession::new(&identity).save(&session_file)?;
                    println!(
                        "Logged in as {} ({})",
                        identity.email(),
                        identity.collection_name()
                    );
                }
                Err(e) => {
                    if let Err(log_err) = audit.login(&collection, &email, false) {
                        warn!(error = %log_err, "failed to write audit event");
                    }
                    return Err(e.into());
                }
            }
        }
        AuthCommand::Logout => {
            let session = load_session(ctx)?;
            if AuthSession::clear(&session_file)? {
                let email = session.as_ref().map(|s| s.email.as_str());
                if let Err(e) = ctx.audit.borrow_mut().logout(email) {
                    warn!(error = %e, "failed to write audit event");
                }
                println!("Logged out");
            } else {
                println!("Not logged in");
            }
        }
        AuthCommand::Whoami => {
            let db = open_db(ctx)?;
            let request = request_context(ctx, &db)?;
            match &request.auth {
                Some(identity) => println!(
                    "{} ({}, id {})",
                    identity.email(),
                    identity.collection_name(),
                    identity.id()
                ),
                None => println!("anonymous"),
            }
            if request.superuser {
                println!("acting as superuser");
            }
        }
    }
    Ok(())
}

fn print_record(record: &Record) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&record.to_public_json())?);
    Ok(())
}

/// Build a write payload from `name=value` and `field=path` arguments.
///
/// Repeating a field name collects its values into a list.
fn build_payload(fields: &[String], files: &[String]) -> Result<RecordPayload> {
    let mut data = Map::new();
    for arg in fields {
        let (name, value) = split_assignment(arg)?;
        let value = Value::String(value.to_string());
        match data.get_mut(name) {
            None => {
                data.insert(name.to_string(), value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }

    let mut payload = RecordPayload {
        fields: data,
        files: Vec::new(),
    };
    for arg in files {
        let (field, path) = split_assignment(arg)?;
        payload = payload.file(read_upload(field, Path::new(path))?);
    }
    Ok(payload)
}

fn split_assignment(arg: &str) -> Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => bail!("expected NAME=VALUE, got '{}'", arg),
    }
}

fn read_upload(field: &str, path: &Path) -> Result<FileUpload> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?;
    debug!(field, file = %path.display(), size = bytes.len(), "attaching file");
    Ok(FileUpload::new(field, filename, bytes))
}
