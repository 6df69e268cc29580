use anyhow::{anyhow, Context, Result};
use clap::Parser;
use report_press::config::{
    apply_env_overrides, config_stub, default_config, load_config, validate_config, write_config,
    RunConfig,
};
use report_press::lm;
use report_press::markup::{sanitize, validate, MarkupFragment};
use report_press::pipeline::{Pipeline, RunInputs, RunOutcome};
use report_press::report::load_run_report;
use std::fs;

mod cli;
use cli::{CheckArgs, Command, InitArgs, RootArgs, RunArgs};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = RootArgs::parse();
    match args.command {
        Command::Init(args) => cmd_init(&args),
        Command::Run(args) => cmd_run(args),
        Command::Check(args) => cmd_check(&args),
    }
}

fn cmd_init(args: &InitArgs) -> Result<()> {
    if args.print {
        println!("{}", config_stub()?);
        return Ok(());
    }
    if args.config.is_file() && !args.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            args.config.display()
        ));
    }
    write_config(&args.config, &default_config())?;
    println!("wrote {}", args.config.display());
    Ok(())
}

fn resolve_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    apply_env_overrides(&mut config);
    if let Some(output) = &args.output {
        config.output_path = output.clone();
    }
    if let Some(work_dir) = &args.work_dir {
        config.work_dir = Some(work_dir.clone());
    }
    if let Some(timeout_secs) = args.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    validate_config(&config)?;
    Ok(config)
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let summary = fs::read_to_string(&args.summary)
        .with_context(|| format!("read dataset summary {}", args.summary.display()))?;
    let model = lm::from_config(&config.lm)?;

    let outcome = Pipeline::new(&config, model.as_ref()).run(RunInputs {
        dataset_summary: summary,
        charts: args.charts,
    })?;
    print_diagnostics(&outcome);

    if args.json {
        let report = load_run_report(&outcome.report_path)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    match (&outcome.artifact, outcome.state.error()) {
        (Some(artifact), _) if outcome.succeeded() => {
            if !args.json {
                println!("{}", artifact.path.display());
            }
            eprintln!(
                "done: {} pages, run record in {}",
                artifact.page_count,
                outcome.work_dir.display()
            );
            Ok(())
        }
        (_, Some(error)) => Err(anyhow!(
            "run failed during {} ({}): {} (see {})",
            error.stage,
            error.kind,
            error.message,
            outcome.report_path.display()
        )),
        _ => Err(anyhow!(
            "run ended in {} without an artifact (see {})",
            outcome.state.status(),
            outcome.report_path.display()
        )),
    }
}

fn print_diagnostics(outcome: &RunOutcome) {
    for diag in &outcome.state.diagnostics {
        match diag.section {
            Some(section) => eprintln!("{} [{section}] {:?}: {}", diag.stage, diag.kind, diag.message),
            None => eprintln!("{} {:?}: {}", diag.stage, diag.kind, diag.message),
        }
    }
}

fn cmd_check(args: &CheckArgs) -> Result<()> {
    if let Some(path) = &args.config {
        let config = load_config(path)?;
        validate_config(&config)?;
        println!("{}: ok", path.display());
    }
    if let Some(path) = &args.fragment {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let sanitized = sanitize(&text);
        for dropped in &sanitized.diagnostics {
            eprintln!(
                "dropped U+{:04X} at char {} ({:?})",
                u32::from(dropped.character),
                dropped.char_offset,
                dropped.reason
            );
        }
        let fragment = validate(&MarkupFragment::new(args.section, sanitized.text))
            .map_err(|err| anyhow!("{}: {err}", path.display()))?;
        match fragment.repair() {
            Some(repair) => println!("{}: ok after repair ({repair})", path.display()),
            None => println!("{}: ok", path.display()),
        }
    }
    Ok(())
}
