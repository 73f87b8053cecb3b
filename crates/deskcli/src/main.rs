use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use deskcore::{Actor, DeleteResult, ErrorInfo, TaskEvent, TaskError, Value};
use deskruntime::{DeskRuntime, Presenter, RuntimeConfig};
use deskstore::statements;
use deskstore::{SqliteStore, SqliteStoreConfig};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "desk")]
#[command(about = "Client desk CLI", long_about = None)]
struct Cli {
    /// JSON config file with `store` and `runtime` sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and load demo clients
    Init,

    /// Active clients and outstanding invoice total
    Stats,

    /// List clients with their open invoice count
    Clients,

    /// Deactivate a client, closing its open invoices if the role allows it
    Delete {
        #[arg(long)]
        client: i64,

        /// Acting user id
        #[arg(long)]
        actor: i64,

        #[arg(long, default_value = "clerk")]
        role: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show recent audit entries
    Audit {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    store: SqliteStoreConfig,
    runtime: RuntimeConfig,
}

impl CliConfig {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?
            }
            None => CliConfig::default(),
        };
        if let Some(db) = &cli.db {
            config.store.path = db.clone();
        }
        config.runtime.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CliConfig::load(&cli)?;
    let store = Arc::new(SqliteStore::open(config.store.clone())?);
    let (runtime, mut presenter) = DeskRuntime::new(store.clone(), config.runtime)?;

    match cli.command {
        Commands::Init => init(&store),
        Commands::Stats => show_stats(&runtime, &mut presenter).await,
        Commands::Clients => list_clients(&runtime, &mut presenter).await,
        Commands::Delete {
            client,
            actor,
            role,
            yes,
        } => delete_client(&runtime, &mut presenter, client, Actor::new(actor, role), yes).await,
        Commands::Audit { limit } => show_audit(&runtime, &mut presenter, limit).await,
    }
}

fn init(store: &SqliteStore) -> Result<()> {
    store.seed_demo()?;
    println!("✨ Database ready: {}", store.path().display());
    println!();
    println!("Try it with:");
    println!(
        "  desk --db {} delete --client 42 --actor 1 --role admin",
        store.path().display()
    );
    Ok(())
}

/// Collects the first failure of any call so the command can report it
#[derive(Clone, Default)]
struct Failure(Rc<RefCell<Option<ErrorInfo>>>);

impl Failure {
    fn handler(&self) -> impl FnOnce(ErrorInfo) + 'static {
        let slot = self.0.clone();
        move |err| {
            slot.borrow_mut().get_or_insert(err);
        }
    }

    fn check(&self) -> Result<()> {
        match self.0.borrow_mut().take() {
            Some(err) => bail!(err.user_message()),
            None => Ok(()),
        }
    }
}

async fn show_stats(runtime: &DeskRuntime, presenter: &mut Presenter) -> Result<()> {
    let failure = Failure::default();
    let queries = runtime.queries();

    queries.count_of(
        statements::active_client_count(),
        |n| println!("👥 Active clients: {}", n),
        failure.handler(),
    );
    queries.sum_of(
        statements::outstanding_total(),
        |total| println!("💰 Outstanding:    {:.2}", total),
        failure.handler(),
    );

    presenter.run_until_idle().await;
    failure.check()
}

async fn list_clients(runtime: &DeskRuntime, presenter: &mut Presenter) -> Result<()> {
    let failure = Failure::default();

    runtime.queries().rows_of(
        statements::client_listing(),
        |rows| {
            rows.map(|row| match row.as_slice() {
                [Value::Integer(id), Value::Text(name), Value::Integer(active), Value::Integer(open)] => {
                    Ok(format!(
                        "  {:>4}  {:<24} {:<8} {} open invoice(s)",
                        id,
                        name,
                        if *active == 1 { "active" } else { "inactive" },
                        open
                    ))
                }
                other => Err(TaskError::Failed(format!("Unexpected client row: {:?}", other))),
            })
            .collect::<Result<Vec<_>, _>>()
        },
        |lines| {
            println!("📋 Clients:");
            for line in lines {
                println!("{}", line);
            }
        },
        failure.handler(),
    );

    presenter.run_until_idle().await;
    failure.check()
}

async fn show_audit(runtime: &DeskRuntime, presenter: &mut Presenter, limit: i64) -> Result<()> {
    let failure = Failure::default();

    runtime.queries().rows_of(
        statements::recent_audit(limit),
        |rows| {
            Ok(rows
                .map(|row| {
                    let text = |i: usize| match row.get(i) {
                        Some(Value::Text(s)) => s.clone(),
                        Some(Value::Integer(n)) => n.to_string(),
                        _ => String::new(),
                    };
                    format!("  {}  actor {:<4} {:<20} {}", text(3), text(0), text(1), text(2))
                })
                .collect::<Vec<_>>())
        },
        |lines| {
            if lines.is_empty() {
                println!("No audit entries yet");
            }
            for line in lines {
                println!("{}", line);
            }
        },
        failure.handler(),
    );

    presenter.run_until_idle().await;
    failure.check()
}

async fn delete_client(
    runtime: &DeskRuntime,
    presenter: &mut Presenter,
    client: i64,
    actor: Actor,
    yes: bool,
) -> Result<()> {
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let TaskEvent::WorkflowTransition { state, .. } = event {
                tracing::debug!("  ⚡ {:?}", state);
            }
        }
    });

    let outcome: Rc<RefCell<Option<Result<DeleteResult, ErrorInfo>>>> = Rc::new(RefCell::new(None));
    let (ok, failed) = (outcome.clone(), outcome.clone());

    runtime.run_guarded_delete(
        statements::deactivate_client_request(client, actor),
        move |prompt| {
            if yes {
                return true;
            }
            if prompt.cascade {
                ask(&format!(
                    "Client {} has {} open invoice(s). Deactivate it and close them?",
                    prompt.subject_id, prompt.dependents
                ))
            } else {
                ask(&format!("Deactivate client {}?", prompt.subject_id))
            }
        },
        move |result| *ok.borrow_mut() = Some(Ok(result)),
        move |err| *failed.borrow_mut() = Some(Err(err)),
    );

    presenter.run_until_idle().await;
    event_task.abort();

    let outcome = outcome.borrow_mut().take();
    match outcome {
        Some(Ok(result)) if result.cascaded => {
            println!(
                "✅ Client {} deactivated, {} invoice(s) closed by override",
                result.deleted_subject_id, result.dependents_closed
            );
            Ok(())
        }
        Some(Ok(result)) => {
            println!("✅ Client {} deactivated", result.deleted_subject_id);
            Ok(())
        }
        Some(Err(err)) if err.is_retryable() => {
            bail!("{} ({})", err.user_message(), err.message)
        }
        Some(Err(err)) => bail!(err.user_message()),
        None => {
            println!("Nothing changed");
            Ok(())
        }
    }
}

fn ask(question: &str) -> bool {
    print!("{} [y/N] ", question);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
