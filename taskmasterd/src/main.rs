use anyhow::Context;
use serde_json::Value;
use taskmaster_core::EntityKind;
use taskmasterd::SyncOutcome;
use taskmasterd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Run,
    Sync,
    Status,
    Add { kind: EntityKind, data: Value },
    Help,
}

fn parse_cli_command<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let command = match args.next().as_deref() {
        None | Some("run") => CliCommand::Run,
        Some("sync") => CliCommand::Sync,
        Some("status") => CliCommand::Status,
        Some("--help") | Some("-h") => CliCommand::Help,
        Some("add") => {
            let kind = args.next().context("add: missing entity kind")?;
            let kind: EntityKind = kind.parse()?;
            let payload = args.next().context("add: missing JSON payload")?;
            let data = serde_json::from_str(&payload).context("add: payload is not valid JSON")?;
            CliCommand::Add { kind, data }
        }
        Some(other) => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(command)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "taskmasterd=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_outcome(outcome: &SyncOutcome) {
    let Some(report) = outcome.report() else {
        println!("sync already in progress");
        return;
    };
    println!(
        "replayed={} pushed={} pulled={} failed={} skipped={}",
        report.replayed, report.pushed, report.pulled, report.failed, report.skipped
    );
    for error in &report.errors {
        let target = match (&error.entity, &error.entity_id) {
            (Some(kind), Some(id)) => format!("{kind} {id}"),
            (Some(kind), None) => kind.collection().to_string(),
            _ => "store".to_string(),
        };
        println!("error [{target}]: {}", error.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let command = parse_cli_command(std::env::args())?;
    if command == CliCommand::Help {
        println!("Usage: taskmasterd [run|sync|status|add <kind> <json>]");
        println!("  run                Start the sync daemon (default)");
        println!("  sync               Run one reconciliation cycle and exit");
        println!("  status             Show cached and pending counts");
        println!("  add <kind> <json>  Queue a new task|project|note|habit");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match command {
        CliCommand::Run => daemon.run().await,
        CliCommand::Sync => {
            let outcome = daemon.sync_once().await;
            print_outcome(&outcome);
            if outcome.is_success() {
                Ok(())
            } else {
                anyhow::bail!("sync finished with errors")
            }
        }
        CliCommand::Status => {
            let summary = daemon.summary().await?;
            println!("pending actions: {}", summary.pending_actions);
            for collection in summary.collections {
                println!(
                    "{:<9} cached={} pending={}",
                    collection.kind.collection(),
                    collection.cached,
                    collection.pending
                );
            }
            Ok(())
        }
        CliCommand::Add { kind, data } => {
            let created = daemon.entities().create(kind, data).await?;
            println!("{created}");
            Ok(())
        }
        CliCommand::Help => Ok(()),
    }
}
