use clap::{CommandFactory, Parser};
use colored::*;
use serde_json::{json, Map, Value};
use std::io::Write;
use std::process;
use std::sync::Arc;

use vulny_core::{
    parse_custom_headers, read_lines, severity_summary, AuthGate, ConsoleSink, EngineConfig,
    FileJobStore, Job, JobStatus, JobStore, MemoryJobStore, MemoryQueue, Orchestrator, Principal,
    ProbeRegistry, ScanGateway, Severity, StaticAuthGate, WorkerPool,
};

/// Credential the CLI presents for itself.
const LOCAL_TOKEN: &str = "local-cli";

#[derive(Parser, Debug)]
#[command(
    name = "VULNY",
    version,
    about = "Queued web vulnerability scan orchestrator",
    override_usage = "vulny <target>  <options>",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Quick scan:                     vulny http://target.com
  Deeper scan, 4 workers:         vulny http://target.com --depth 3 -w 4
  Custom headers:                 vulny http://target.com -H \"Authorization: Bearer TOKEN\"
  Skip probes:                    vulny http://target.com --disable ports --disable subdomains
  Persist jobs + output:          vulny -l targets.txt --store jobs.json -o scan.json
  Dry-run test:                   vulny http://target.com --dry-run"
)]
pub struct Args {
    #[arg(required_unless_present = "list")]
    pub target: Option<String>,

    #[arg(short = 'l', long = "list", help = "File containing target URLs (one per line)")]
    pub list: Option<String>,

    #[arg(short = 'd', long, default_value_t = 1, help = "Scan depth (positive integer)")]
    pub depth: u32,

    #[arg(short = 'H', long = "header", help = "Custom header (e.g. \"Authorization: Bearer TOKEN\")")]
    pub headers: Vec<String>,

    #[arg(short = 'w', long, help = "Number of queue workers")]
    pub workers: Option<usize>,

    #[arg(long, help = "Per-probe timeout in seconds")]
    pub probe_timeout: Option<u64>,

    #[arg(long = "disable", help = "Probe to skip (ports, subdomains, paths, vulns)")]
    pub disabled: Vec<String>,

    #[arg(short = 'c', long, help = "JSON engine configuration file")]
    pub config: Option<String>,

    #[arg(long, help = "Persist job records to this JSON file")]
    pub store: Option<String>,

    #[arg(short = 'o', long, help = "Output file path for finished jobs")]
    pub output: Option<String>,

    #[arg(short = 'v', long, action = clap::ArgAction::Count, help = "Verbose Mode (-v status changes, -vv debug logs)")]
    pub verbose: u8,

    #[arg(long, help = "List targets without queuing any scan")]
    pub dry_run: bool,
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    print_banner();

    let targets = collect_targets(&args);

    if args.dry_run {
        for target in &targets {
            println!("[DRY RUN] Would scan target: {}", target);
        }
        return;
    }

    let config = match engine_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprint!("{}\r\n", format!("[!] Invalid configuration: {:#}", e).red());
            process::exit(1);
        }
    };

    match run(&args, &config, &targets).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprint!("{}\r\n", format!("[!] {:#}", e).red().bold());
            process::exit(1);
        }
    }
}

fn collect_targets(args: &Args) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();

    if let Some(ref list_path) = args.list {
        match read_lines(list_path) {
            Ok(lines) => {
                print!(
                    "{}\r\n",
                    format!("[+] Loaded {} target(s) from {}", lines.len(), list_path)
                        .green().bold()
                );
                std::io::stdout().flush().ok();
                targets.extend(lines);
            }
            Err(e) => {
                eprint!("{}\r\n", format!("[!] Failed to read '{}': {}", list_path, e).red());
                process::exit(1);
            }
        }
    }

    if let Some(ref t) = args.target {
        targets.push(t.clone());
    }

    if targets.is_empty() {
        eprint!("{}\r\n", "[!] No targets specified. Provide a URL or use -l <file>.".red());
        let mut cmd = Args::command();
        cmd.print_help().ok();
        process::exit(1);
    }
    targets
}

/// Config file first, then command-line overrides.
fn engine_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match args.config {
        Some(ref path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(secs) = args.probe_timeout {
        config.probe_timeout_secs = secs;
    }
    config.disabled_probes.extend(args.disabled.iter().cloned());
    if args.store.is_some() {
        config.store_path = args.store.clone();
    }
    Ok(config)
}

/// Submits every target, drains the queue and reports. Returns false if any
/// target was rejected.
async fn run(args: &Args, config: &EngineConfig, targets: &[String]) -> anyhow::Result<bool> {
    let store: Arc<dyn JobStore> = match config.store_path {
        Some(ref path) => Arc::new(FileJobStore::open(path).await?),
        None => Arc::new(MemoryJobStore::new()),
    };
    let queue = Arc::new(MemoryQueue::new());
    let registry = Arc::new(ProbeRegistry::with_defaults(config));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        ConsoleSink::new_ref(args.verbose > 0),
    ));
    let gateway = ScanGateway::new(Arc::clone(&store), queue.clone());

    let auth = StaticAuthGate::new().with_token(LOCAL_TOKEN, Principal::user(local_user()));
    let principal = auth.resolve(LOCAL_TOKEN).await?;

    print_scan_config(args, config, &registry.names(), targets.len());

    let scan_config = scan_config_value(args);
    let mut submitted = Vec::new();
    let mut all_valid = true;
    for target in targets {
        match gateway.submit(&principal, target, &scan_config).await {
            Ok(job) => {
                if args.verbose > 0 {
                    print!("{}\r\n", format!("[+] Queued {} as {}", job.target, job.id).blue());
                }
                submitted.push(job.id);
            }
            Err(e) => {
                all_valid = false;
                eprint!("{}\r\n", format!("[!] Rejected '{}': {}", target, e).red());
            }
        }
    }
    std::io::stdout().flush().ok();

    if submitted.is_empty() {
        return Ok(all_valid);
    }

    print!("\r\n{}\r\n", format!("[*] Running {} job(s)...", submitted.len()).bright_cyan().bold());
    std::io::stdout().flush().ok();

    let pool = WorkerPool::spawn(queue, orchestrator, config);
    let stats = pool.drain().await;
    log::info!(
        "workers done: {} completed, {} failed, {} cancelled, {} stranded, {} retried",
        stats.completed, stats.failed, stats.cancelled, stats.stranded, stats.retried
    );

    let mut jobs = Vec::with_capacity(submitted.len());
    for id in submitted {
        jobs.push(gateway.get(&principal, id).await?);
    }

    for job in &jobs {
        print_job_report(job);
    }

    if let Some(ref path) = args.output {
        let data = serde_json::to_string_pretty(&jobs)?;
        std::fs::write(path, data)?;
        print!("{}\r\n", format!("[+] Results written to {}", path).green().bold());
    }
    std::io::stdout().flush().ok();

    Ok(all_valid)
}

fn local_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}

/// The raw per-job options exactly as a remote client would send them.
fn scan_config_value(args: &Args) -> Value {
    let headers: Map<String, Value> = parse_custom_headers(&args.headers)
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    json!({ "depth": args.depth, "headers": headers })
}

/// Prints the VULNY ASCII banner.
fn print_banner() {
    let banner = r#"
   :::     ::: :::    ::: :::     :::   :::
   :+:     :+: :+:    :+: :+:     :+:   :+:
   +:+     +:+ +:+    +:+ +:+      +:+ +:+
   +#+     +:+ +#+    +:+ +#+       +#++:
    +#+   +#+  +#+    +#+ +#+        +#+
     #+#+#+#   #+#    #+# #+#        #+#
       ###      ########  ########## ###
    "#;
    print!("{}\r\n", banner.bright_cyan().bold());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn print_scan_config(args: &Args, config: &EngineConfig, probes: &[&str], targets: usize) {
    print!("{}\r\n", format!("[+] Targets:  {}", targets).green().bold());
    print!("{}\r\n", format!("[+] Depth:    {}", args.depth).blue());
    print!("{}\r\n", format!("[+] Workers:  {}", config.workers.max(1)).blue());
    print!("{}\r\n", format!("[+] Timeout:  {}s per probe", config.probe_timeout().as_secs()).blue());
    print!("{}\r\n", format!("[+] Probes:   {}", probes.join(", ")).magenta().bold());
    if !args.headers.is_empty() {
        print!("{}\r\n", format!("[+] Headers:  {} custom", args.headers.len()).yellow());
    }
    if let Some(ref path) = config.store_path {
        print!("{}\r\n", format!("[+] Store:    {}", path).yellow());
    }
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn paint_severity(severity: Severity) -> ColoredString {
    let label = severity.to_string().to_uppercase();
    match severity {
        Severity::Critical => label.bright_red().bold(),
        Severity::High => label.red(),
        Severity::Medium => label.yellow(),
        Severity::Low => label.blue(),
    }
}

fn print_job_report(job: &Job) {
    let status = match job.status {
        JobStatus::Completed => job.status.to_string().green().bold(),
        JobStatus::Cancelled => job.status.to_string().yellow().bold(),
        _ => job.status.to_string().red().bold(),
    };
    print!("\r\n{}\r\n", format!("━━━ {} [{}] ━━━", job.target, job.id).bright_white().bold());
    print!("[*] Status: {}\r\n", status);

    for f in &job.findings {
        print!(
            "  [{}] {} ({}): {}\r\n",
            paint_severity(f.severity),
            f.kind.bold(),
            f.parameter,
            f.description
        );
    }
    for d in &job.degraded {
        print!("{}\r\n", format!("  [!] probe '{}' degraded: {}", d.probe, d.reason).yellow());
    }

    if job.findings.is_empty() {
        print!("{}\r\n", "  No findings.".dimmed());
    } else {
        let summary: Vec<String> = severity_summary(&job.findings)
            .into_iter()
            .map(|(sev, n)| format!("{} {}", n, paint_severity(sev)))
            .collect();
        print!("  Summary: {}\r\n", summary.join(", "));
    }
}
