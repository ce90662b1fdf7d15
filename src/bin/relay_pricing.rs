//! relay-pricing: 价格注册表统计与三层倍率解析的命令行工具
//!
//! Usage:
//!   relay-pricing stats                          Global registry statistics
//!   relay-pricing resolve <api-type> <model>...  Resolve ratios through the three layers
//!   relay-pricing list <api-type>                Show an adaptor's price list
//!   relay-pricing tables                         List the bundled price tables

use ai_relay_rust::adaptor::{get_adaptor, ApiType};
use ai_relay_rust::meta::ChannelPricing;
use ai_relay_rust::pricing::{self, GlobalPricingManager, QUOTA_PER_USD};
use ai_relay_rust::RelayConfig;
use anyhow::{anyhow, bail, Context};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = install_config(&mut args) {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }
    let Some(command) = args.first().cloned() else {
        print_usage();
        std::process::exit(1);
    };

    let result = match command.as_str() {
        "stats" => cmd_stats(),
        "resolve" => cmd_resolve(&args[1..]),
        "list" => cmd_list(&args[1..]),
        "tables" => cmd_tables(),
        "version" | "--version" | "-V" => {
            println!("relay-pricing {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"relay-pricing: 网关价格查询工具

USAGE:
    relay-pricing [--config <file.yaml>] <COMMAND> [ARGS]

COMMANDS:
    stats                           Global registry statistics
    resolve <api-type> <model>...   Resolve ratios through the three layers
    list <api-type>                 Show an adaptor's price list
    tables                          List the bundled price tables
    version                         Show version information

ENVIRONMENT:
    RELAY_PRICING_ADAPTORS          Comma-separated api types merged into the global registry
    RUST_LOG                        Log filter (default: warn)"#
    );
}

/// Consumes `--config <file>` and installs it as the process configuration.
fn install_config(args: &mut Vec<String>) -> anyhow::Result<()> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return Ok(());
    };
    let path = args
        .get(pos + 1)
        .cloned()
        .ok_or_else(|| anyhow!("--config needs a file"))?;
    args.drain(pos..=pos + 1);
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    RelayConfig::from_yaml(&text)
        .with_context(|| format!("parsing {path}"))?
        .install();
    GlobalPricingManager::global().reload();
    Ok(())
}

fn api_type(name: &str) -> anyhow::Result<ApiType> {
    ApiType::from_name(name).ok_or_else(|| {
        let known: Vec<&str> = ApiType::ALL.iter().map(ApiType::name).collect();
        anyhow!("unknown api type {name:?}, expected one of: {}", known.join(", "))
    })
}

fn cmd_stats() -> anyhow::Result<()> {
    let manager = GlobalPricingManager::global();
    // force the lazy build
    let total = manager.all().len();
    let stats = manager.stats();
    println!("models:       {total}");
    println!("conflicts:    {}", stats.conflicts);
    println!(
        "contributors: {}",
        stats.contributors.iter().map(ApiType::name).collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

fn cmd_resolve(args: &[String]) -> anyhow::Result<()> {
    if args.len() < 2 {
        bail!("usage: relay-pricing resolve <api-type> <model>...");
    }
    let kind = api_type(&args[0])?;
    let adaptor = get_adaptor(kind).ok_or_else(|| anyhow!("no adaptor for {}", kind.name()))?;
    let channel = ChannelPricing::default();
    println!("{:<40} {:>12} {:>10} {:>12}  source", "model", "ratio", "completion", "usd/1M in");
    for model in &args[1..] {
        let price = pricing::resolve(model, &channel, adaptor.as_ref());
        println!(
            "{:<40} {:>12.4} {:>10.3} {:>12.4}  {:?}",
            model,
            price.ratio,
            price.completion_ratio,
            price.ratio * 1_000_000.0 / QUOTA_PER_USD,
            price.ratio_source,
        );
    }
    Ok(())
}

fn cmd_list(args: &[String]) -> anyhow::Result<()> {
    let name = args.first().ok_or_else(|| anyhow!("usage: relay-pricing list <api-type>"))?;
    let adaptor = get_adaptor(api_type(name)?).ok_or_else(|| anyhow!("no adaptor for {name}"))?;
    let mut models = adaptor.model_list();
    models.sort();
    for model in models {
        println!(
            "{:<48} {:>12.4} {:>10.3}",
            model,
            adaptor.model_ratio(&model),
            adaptor.completion_ratio(&model)
        );
    }
    Ok(())
}

fn cmd_tables() -> anyhow::Result<()> {
    for name in pricing::table_names() {
        println!("{:<16} {:>5} models", name, pricing::table(name).len());
    }
    Ok(())
}
