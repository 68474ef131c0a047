//! gate-cli: utilidades de operación del gateway.
//!
//! `plan` y `dry-run` trabajan sobre un spec JSON local sin tocar la base.
//! `balance`, `history` y `credit` operan contra el ledger de Postgres
//! (`DATABASE_URL`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gate_adapters::{AdapterRegistry, CommentPostConnector, InMemoryCommentSink, KnowledgeStore, NhaInvokeConnector,
                    RagQueryConnector};
use gate_core::{plan, FlowCatalog, FlowEngine, FlowSpec, NodeKind, RunInstance, RunMode};
use gate_ledger::{BillingManager, Ledger, QuotaLimits};
use gate_persistence::{PgLedgerStore, PoolProvider};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gate-cli")]
#[command(version, about = "Operación del NHA gateway", long_about = None)]
struct Cli {
    /// Logs detallados (equivale a RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Valida un spec y muestra el orden de ejecución
    Plan {
        /// Archivo JSON con `{nodes, edges}`
        spec: PathBuf,
    },
    /// Ejecuta un spec en modo dry (sin cobros ni comentarios)
    DryRun {
        spec: PathBuf,
        /// Trigger del run como JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Tope de los nodos Util.Delay en milisegundos
        #[arg(long, default_value_t = 5000)]
        delay_cap_ms: u64,
    },
    /// Saldo y uso del mes de un ref
    Balance {
        #[arg(long = "ref")]
        reference: String,
    },
    /// Movimientos del ledger de un ref
    History {
        #[arg(long = "ref")]
        reference: String,
    },
    /// Acredita saldo manualmente
    Credit {
        #[arg(long = "ref")]
        reference: String,
        #[arg(long)]
        amount: i64,
        #[arg(long, default_value = "manual_credit")]
        reason: String,
        /// Clave de idempotencia opcional
        #[arg(long)]
        key: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry().with(filter)
                                  .with(fmt::layer().with_writer(std::io::stderr))
                                  .init();
}

fn load_spec(path: &Path) -> anyhow::Result<FlowSpec> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    // Se acepta tanto el spec suelto como el cuerpo completo de POST /flows.
    let spec = match value.get("spec") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(spec).context("invalid flow spec")
}

fn plan_order(spec: &FlowSpec) -> anyhow::Result<Vec<String>> {
    Ok(plan(spec)?.order)
}

/// Ejecuta `spec` en un engine en memoria con los agentes léxicos.
async fn dry_run(spec: FlowSpec, input: Value, delay_cap: Duration) -> anyhow::Result<RunInstance> {
    let adapters = Arc::new(AdapterRegistry::lexicon());
    let engine = FlowEngine::in_memory()
        .with_builtin_connectors(delay_cap)
        .connector(NodeKind::NhaInvoke, Arc::new(NhaInvokeConnector::new(adapters)))
        .connector(NodeKind::RagQuery,
                   Arc::new(RagQueryConnector::new(Arc::new(KnowledgeStore::default()))))
        .connector(NodeKind::CommentPost,
                   Arc::new(CommentPostConnector::new(Arc::new(InMemoryCommentSink::new()))))
        .build();
    let flow = engine.catalog().create("cli-dry-run", "cli", "default", spec)?;
    let run = engine.enqueue(flow.id, None, RunMode::Dry, input, None)?;
    let run = engine.execute(run.id).await?;
    Ok(engine.load_run(run.id)?)
}

fn pg_billing() -> anyhow::Result<BillingManager> {
    let pool = gate_persistence::build_pool_from_env().context("postgres pool (DATABASE_URL)")?;
    let store = Arc::new(PgLedgerStore::new(PoolProvider::new(pool)));
    Ok(BillingManager::new(Ledger::new(store), QuotaLimits::default()))
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Plan { spec } => {
            let order = plan_order(&load_spec(&spec)?)?;
            for (i, node) in order.iter().enumerate() {
                println!("{:>3}. {node}", i + 1);
            }
        }
        Command::DryRun { spec, input, delay_cap_ms } => {
            let input: Value = serde_json::from_str(&input).context("--input must be JSON")?;
            let instance = dry_run(load_spec(&spec)?, input, Duration::from_millis(delay_cap_ms)).await?;
            print_json(&json!({ "run": instance.run, "nodes": instance.nodes, "outputs": instance.outputs }))?;
        }
        Command::Balance { reference } => {
            let report = pg_billing()?.usage_report(&reference)?;
            print_json(&serde_json::to_value(report)?)?;
        }
        Command::History { reference } => {
            let entries = pg_billing()?.ledger().entries(&reference)?;
            print_json(&serde_json::to_value(entries)?)?;
        }
        Command::Credit { reference, amount, reason, key } => {
            if amount <= 0 {
                bail!("--amount must be positive");
            }
            let billing = pg_billing()?;
            let entry = billing.credit(&reference, amount, &reason, json!({ "source": "cli" }), key)?;
            tracing::info!(reference = %reference, amount, "credit recorded");
            print_json(&json!({ "entry": entry, "balance": billing.get_balance(&reference)? }))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gate_persistence::init_dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::NodeStatus;

    fn spec() -> FlowSpec {
        serde_json::from_value(json!({
            "nodes": [
                { "id": "score", "type": "Action.NHA.Invoke",
                  "params": { "agent": "sentiment", "text": "{{trigger.text}}" } },
                { "id": "out", "type": "Util.Emit", "params": {}, "if": "score.score > 0.9" }
            ],
            "edges": [ { "from": "score", "to": "out" } ]
        })).unwrap()
    }

    #[test]
    fn parses_credit_arguments() {
        let cli = Cli::try_parse_from(["gate-cli", "credit", "--ref", "acme", "--amount", "25"]).unwrap();
        match cli.command {
            Command::Credit { reference, amount, reason, key } => {
                assert_eq!(reference, "acme");
                assert_eq!(amount, 25);
                assert_eq!(reason, "manual_credit");
                assert!(key.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn load_spec_accepts_full_flow_body() {
        let dir = std::env::temp_dir().join(format!("gate-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("flow.json");
        std::fs::write(&path, json!({ "name": "x", "spec": spec() }).to_string()).unwrap();
        let loaded = load_spec(&path).unwrap();
        assert_eq!(loaded, spec());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn plan_rejects_cycles() {
        let mut cyclic = spec();
        cyclic.edges.push(gate_core::EdgeSpec::new("out", "score"));
        assert!(plan_order(&cyclic).is_err());
        assert_eq!(plan_order(&spec()).unwrap(), vec!["score", "out"]);
    }

    #[tokio::test]
    async fn dry_run_evaluates_conditions_without_cost() {
        let instance = dry_run(spec(), json!({ "text": "the parcel arrived" }), Duration::from_millis(10)).await
                                                                                                         .unwrap();
        assert_eq!(instance.node_status("score"), Some(NodeStatus::Success));
        assert_eq!(instance.node_status("out"), Some(NodeStatus::Skipped));
        assert_eq!(instance.outputs["score"]["cost"], json!(0));
    }
}
