use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use affinity_graph::{
    ContextDiagnostics, GraphError, InMemoryAttributeStore, Model, ThreadAffineContext,
};
use affinity_runtime::{AffinityConfig, HomeThread, MarshalCounters};
use affinity_types::{AttributeDef, AttributeValue, Attributes, EntitySchema, ValueKind};
use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use serde::Serialize;
use tracing::info;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Scenario(args) => {
            let mut config = AffinityConfig::default();
            config.marshal_timeout_ms = args.timeout_ms;
            let report = run_scenario(&config)?;
            emit(&cli.format, &report, print_scenario)
        }
        Command::Stress(args) => {
            let report = run_stress(&AffinityConfig::default(), args.writers, args.ops)?;
            emit(&cli.format, &report, print_stress)
        }
        Command::Migrate(args) => {
            let report = run_migrate(&AffinityConfig::default(), args.hops)?;
            emit(&cli.format, &report, print_migrate)
        }
        Command::Config(args) => cmd_config(args, &cli.format),
    }
}

fn emit<T: Serialize>(format: &OutputFormat, report: &T, text: fn(&T)) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => text(report),
    }
    Ok(())
}

fn demo_model() -> anyhow::Result<Arc<Model>> {
    let model = Model::builder()
        .entity(
            EntitySchema::new("Widget")
                .with_attribute(AttributeDef::required("name", ValueKind::Text))
                .with_attribute(AttributeDef::optional("color", ValueKind::Text)),
        )
        .entity(
            EntitySchema::new("Counter")
                .with_attribute(AttributeDef::optional("value", ValueKind::Integer).with_default(0i64)),
        )
        .build()?;
    Ok(Arc::new(model))
}

fn named(name: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("name".to_string(), name.into());
    attrs
}

// ---------------------------------------------------------------------------
// scenario
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ScenarioStep {
    pub thread: String,
    pub action: String,
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub context: String,
    pub owner: String,
    pub steps: Vec<ScenarioStep>,
    pub stats: MarshalCounters,
}

fn step(thread: &str, action: &str, result: impl ToString) -> ScenarioStep {
    ScenarioStep {
        thread: thread.to_string(),
        action: action.to_string(),
        result: result.to_string(),
    }
}

pub fn run_scenario(config: &AffinityConfig) -> anyhow::Result<ScenarioReport> {
    let home = HomeThread::spawn_with(config)?;
    let model = demo_model()?;
    let ctx_config = config.clone();
    let ctx = home.invoke(move || {
        Ok::<_, GraphError>(
            ThreadAffineContext::builder(model, Arc::new(InMemoryAttributeStore::new()))
                .config(ctx_config)
                .build(),
        )
    })?;
    let owner = ctx.current_affinity_token();
    let mut steps = vec![step(owner.label(), "create context", ctx.id())];

    let widget = ctx.create("Widget", named("x"))?;
    steps.push(step("main", "create Widget {name: \"x\"}", widget.id().short_id()));

    let worker_widget = widget.clone();
    let seen_by_worker = thread::Builder::new()
        .name("worker-b".to_string())
        .spawn(move || -> Result<AttributeValue, GraphError> {
            worker_widget.set("name", "y")?;
            worker_widget.get("name")
        })?
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))??;
    steps.push(step("worker-b", "set name = \"y\"", "ok"));
    steps.push(step("worker-b", "get name", &seen_by_worker));

    let owner_widget = widget.clone();
    let seen_by_owner = home.invoke(move || owner_widget.get("name"))?;
    steps.push(step(owner.label(), "get name", &seen_by_owner));

    let expected = AttributeValue::from("y");
    if seen_by_worker != expected || seen_by_owner != expected {
        bail!("read-after-write violated: worker saw {seen_by_worker}, owner saw {seen_by_owner}");
    }

    Ok(ScenarioReport {
        context: ctx.id().to_string(),
        owner: owner.to_string(),
        steps,
        stats: ctx.stats(),
    })
}

fn print_scenario(report: &ScenarioReport) {
    println!(
        "Context {} owned by {}",
        report.context.bold(),
        report.owner.cyan()
    );
    for (n, step) in report.steps.iter().enumerate() {
        println!(
            "  {}. [{}] {} → {}",
            n + 1,
            step.thread.cyan(),
            step.action,
            step.result.yellow()
        );
    }
    print_counters(&report.stats);
    println!("{} Read-after-write held on every thread", "✓".green().bold());
}

fn print_counters(stats: &MarshalCounters) {
    println!(
        "  inline: {}  marshalled: {}  timeouts: {}  stale: {}",
        stats.inline.to_string().bold(),
        stats.marshalled.to_string().bold(),
        stats.timeouts,
        stats.stale_owners
    );
}

// ---------------------------------------------------------------------------
// stress
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StressReport {
    pub writers: usize,
    pub ops: usize,
    pub expected: i64,
    pub observed: i64,
    pub elapsed_ms: u64,
    pub stats: MarshalCounters,
}

pub fn run_stress(config: &AffinityConfig, writers: usize, ops: usize) -> anyhow::Result<StressReport> {
    let home = HomeThread::spawn_with(config)?;
    let ctx = ThreadAffineContext::builder(demo_model()?, Arc::new(InMemoryAttributeStore::new()))
        .config(config.clone())
        .owner(home.token().clone())
        .build();
    let counter = ctx.create("Counter", Attributes::new())?;

    let started = Instant::now();
    let handles = (0..writers)
        .map(|n| {
            let counter = counter.clone();
            thread::Builder::new()
                .name(format!("writer-{n}"))
                .spawn(move || -> Result<(), GraphError> {
                    for _ in 0..ops {
                        counter.with_owner(|scope, id| {
                            let current = scope.raw_get(id, "value")?.as_integer().unwrap_or(0);
                            scope.raw_set(id, "value", (current + 1).into())
                        })?;
                    }
                    Ok(())
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow!("writer thread panicked"))??;
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let expected = (writers * ops) as i64;
    let observed = counter
        .get("value")?
        .as_integer()
        .context("counter is not an integer")?;
    if observed != expected {
        bail!("lost updates: expected {expected}, observed {observed}");
    }
    info!(writers, ops, elapsed_ms, "stress run complete");

    Ok(StressReport {
        writers,
        ops,
        expected,
        observed,
        elapsed_ms,
        stats: ctx.stats(),
    })
}

fn print_stress(report: &StressReport) {
    println!(
        "{} {} writers × {} ops → counter = {} ({} ms)",
        "✓".green().bold(),
        report.writers,
        report.ops,
        report.observed.to_string().yellow(),
        report.elapsed_ms
    );
    print_counters(&report.stats);
}

// ---------------------------------------------------------------------------
// migrate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Hop {
    pub hop: usize,
    pub owner: String,
    pub restamped: bool,
}

#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub context: String,
    pub objects: usize,
    pub hops: Vec<Hop>,
    pub diagnostics: ContextDiagnostics,
}

pub fn run_migrate(config: &AffinityConfig, hops: usize) -> anyhow::Result<MigrateReport> {
    let ctx = ThreadAffineContext::builder(demo_model()?, Arc::new(InMemoryAttributeStore::new()))
        .config(config.clone())
        .build();
    let objects = (0..3)
        .map(|n| ctx.create("Widget", named(&format!("w{n}"))))
        .collect::<Result<Vec<_>, _>>()?;

    // Each hop keeps its predecessor's thread alive until it has taken over,
    // so every hand-over runs on a live owner.
    let mut previous: Option<HomeThread> = None;
    let mut report = Vec::with_capacity(hops);
    for hop in 0..hops {
        let home = HomeThread::spawn(format!("hop-{hop}"))?;
        let hop_ctx = ctx.clone();
        let hop_objects = objects.clone();
        let (owner, restamped) = home.invoke(move || {
            let token = hop_ctx.migrate_ownership_to_calling_thread()?;
            let restamped = hop_objects.iter().all(|o| o.affinity_token() == token);
            Ok::<_, GraphError>((token, restamped))
        })?;
        if !restamped || owner != ctx.current_affinity_token() {
            bail!("hop {hop}: objects not re-stamped to {owner}");
        }
        report.push(Hop {
            hop,
            owner: owner.to_string(),
            restamped,
        });
        previous = Some(home);
    }

    // Bring the context home before the last hop thread goes away.
    ctx.migrate_ownership_to_calling_thread()?;
    drop(previous);
    for object in &objects {
        object.get("name")?;
    }

    Ok(MigrateReport {
        context: ctx.id().to_string(),
        objects: objects.len(),
        hops: report,
        diagnostics: ctx.diagnostics(),
    })
}

fn print_migrate(report: &MigrateReport) {
    println!(
        "Context {} with {} objects",
        report.context.bold(),
        report.objects
    );
    for hop in &report.hops {
        let mark = if hop.restamped {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} hop {} → {}", mark, hop.hop, hop.owner.cyan());
    }
    println!(
        "  migrations: {}  invariant faults: {}",
        report.diagnostics.migrations.to_string().bold(),
        report.diagnostics.invariant_faults
    );
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn load_config(file: Option<&Path>) -> anyhow::Result<AffinityConfig> {
    match file {
        Some(path) => AffinityConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(AffinityConfig::default()),
    }
}

fn cmd_config(args: ConfigArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(args.file.as_deref())?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn scenario_reports_every_step() {
        let report = run_scenario(&AffinityConfig::default()).unwrap();
        assert_eq!(report.steps.len(), 5);
        assert_eq!(report.steps[3].result, "\"y\"");
        assert_eq!(report.steps[4].result, "\"y\"");
        assert!(report.stats.marshalled >= 3);
    }

    #[test]
    fn scenario_with_deadline() {
        let config = AffinityConfig::with_marshal_timeout(Duration::from_secs(5));
        let report = run_scenario(&config).unwrap();
        assert_eq!(report.stats.timeouts, 0);
    }

    #[test]
    fn stress_loses_no_updates() {
        let report = run_stress(&AffinityConfig::default(), 3, 40).unwrap();
        assert_eq!(report.observed, 120);
        // create + every increment + the final read
        assert_eq!(report.stats.marshalled, 122);
    }

    #[test]
    fn migrate_chain_restamps() {
        let report = run_migrate(&AffinityConfig::default(), 3).unwrap();
        assert_eq!(report.hops.len(), 3);
        assert!(report.hops.iter().all(|hop| hop.restamped));
        assert_eq!(report.diagnostics.migrations, 4);
        assert_eq!(report.diagnostics.invariant_faults, 0);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "marshal_timeout_ms = 250").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.marshal_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.home_thread_name, "affinity-home");

        assert_eq!(load_config(None).unwrap(), AffinityConfig::default());
        assert!(load_config(Some(Path::new("/nonexistent/affinity.toml"))).is_err());
    }
}
