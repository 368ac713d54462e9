use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Error, Result};
use clap::Parser;
use tokio::sync::mpsc;

use deli::core::logging::init_logging;
use deli::core::manual::{build_manual_requests, manual_target_name};
use deli::core::postman::load_collection;
use deli::core::run::{run_load_test, run_stress_test, LoadOutcome};
use deli::core::stress::StressOutcome;
use deli::models::aggregate::Aggregate;
use deli::models::config::{load_scenario_config, load_stress_config};
use deli::models::request::ParsedRequest;

// 退出码约定：0成功，1SLA违反，2致命错误，CI据此判定
const EXIT_SLA_VIOLATION: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "deli", version, about = "HTTP(S) load and stress testing engine")]
struct Cli {
    /// Postman v2.1 collection file
    #[arg(short = 'c', long)]
    collection: Option<PathBuf>,

    /// Load test a single URL (GET) instead of a collection
    #[arg(short = 'm', long = "url")]
    manual_url: Option<String>,

    /// Load test config (YAML)
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Stress test config (YAML); switches to stress mode
    #[arg(long)]
    stress_config: Option<PathBuf>,

    /// Environment overrides, KEY=VALUE (repeatable)
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Write the final aggregate / stress result as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Suppress per-second progress lines
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got: {raw}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    // ctrl-c走硬取消：在途请求立即中止并按cancelled上报，已折叠的数据照常出报告
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到中断信号，硬取消在途请求");
            deli::core::executor::global_cancel().cancel();
        }
    });
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("deli: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let env: BTreeMap<String, String> = cli.env.iter().cloned().collect();
    let (requests, target_name) = load_requests(&cli, &env)?;

    if let Some(stress_path) = &cli.stress_config {
        let config = load_stress_config(stress_path)?;
        let outcome = run_stress_test(&config, &requests, &env, &target_name).await?;
        print_stress_summary(&outcome);
        if let Some(json_path) = &cli.json {
            write_json(json_path, &serde_json::json!({
                "stress": outcome.result,
                "verdict": outcome.verdict,
            }))?;
        }
        // 压力模式下触达断裂点按SLA违反退出
        return Ok(if outcome.verdict.pass {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(EXIT_SLA_VIOLATION)
        });
    }

    let config_path = cli
        .config
        .as_ref()
        .ok_or_else(|| Error::msg("load mode requires a config file (-f)"))?;
    let config = load_scenario_config(config_path)?;

    // 非安静模式下每秒打一行进度
    let live_tx = if cli.quiet {
        None
    } else {
        let (tx, mut rx) = mpsc::channel::<Aggregate>(16);
        let duration = config.duration_seconds;
        tokio::spawn(async move {
            while let Some(agg) = rx.recv().await {
                println!(
                    "deli | {:>6.1}s/{:.0}s | requests={} tps={:.1} err%={:.2} p95={:.1}ms",
                    agg.duration_seconds,
                    duration,
                    agg.total_requests,
                    agg.tps_mean,
                    agg.error_rate_pct,
                    agg.p95_ms,
                );
            }
        });
        Some(tx)
    };

    let outcome = run_load_test(&config, &requests, &env, live_tx).await?;
    print_load_summary(&target_name, &outcome);
    if let Some(json_path) = &cli.json {
        write_json(json_path, &serde_json::json!({
            "aggregate": outcome.aggregate,
            "verdict": outcome.verdict,
        }))?;
    }

    let sla_failed = config.has_sla() && !outcome.verdict.pass;
    Ok(if sla_failed {
        ExitCode::from(EXIT_SLA_VIOLATION)
    } else {
        ExitCode::SUCCESS
    })
}

fn load_requests(
    cli: &Cli,
    env: &BTreeMap<String, String>,
) -> Result<(Vec<ParsedRequest>, String)> {
    match (&cli.collection, &cli.manual_url) {
        (Some(path), None) => {
            let requests = load_collection(path, env)?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("collection")
                .to_string();
            Ok((requests, name))
        }
        (None, Some(url)) => Ok((build_manual_requests(url)?, manual_target_name(url))),
        (Some(_), Some(_)) => Err(Error::msg("use either --collection or --url, not both")),
        (None, None) => Err(Error::msg("a request source is required: --collection or --url")),
    }
}

fn print_load_summary(target: &str, outcome: &LoadOutcome) {
    let agg = &outcome.aggregate;
    println!(
        "deli | {} | requests={} ok={} failed={} tps={:.1} mean={:.1}ms p95={:.1}ms p99={:.1}ms err%={:.2} | {}",
        target,
        agg.total_requests,
        agg.successful_requests,
        agg.failed_requests,
        agg.tps_mean,
        agg.mean_ms,
        agg.p95_ms,
        agg.p99_ms,
        agg.error_rate_pct,
        if outcome.verdict.pass { "PASS" } else { "FAIL" },
    );
    for violation in &outcome.verdict.violations {
        println!("deli | SLA violation: {}", violation.describe());
    }
}

fn print_stress_summary(outcome: &StressOutcome) {
    let result = &outcome.result;
    for phase in &result.phases {
        println!(
            "deli | phase {} | users={} requests={} tps={:.1} p95={:.1}ms err%={:.2}{}",
            phase.phase,
            phase.target_users,
            phase.total_requests,
            phase.tps,
            phase.p95_ms,
            phase.error_rate_pct,
            if phase.breached {
                format!(" | BREACH: {}", phase.breach_reason)
            } else {
                String::new()
            },
        );
    }
    println!(
        "deli | {} | max_sustainable={} breaking_point={} | {}",
        result.scenario,
        result.max_sustainable_load_users,
        result.breaking_point_users,
        if outcome.verdict.pass { "PASS" } else { "FAIL" },
    );
}

fn write_json(path: &PathBuf, value: &serde_json::Value) -> Result<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| Error::msg(format!("cannot write {}: {e}", path.display())))?;
    serde_json::to_writer_pretty(file, value)
        .map_err(|e| Error::msg(format!("cannot serialize result: {e}")))?;
    Ok(())
}
