//! # mqroute: bus message router
//!
//! Routes `(topic, payload)` messages to notification handlers according to
//! the rules in `mqroute.toml`. The bus transport is pluggable; this binary
//! reads messages from stdin and loops published messages back in.
//!
//! Usage:
//!   mqroute check                          # Validate config, print routing table
//!   mqroute route < messages.txt           # Route "topic payload" lines
//!   mqroute route --stats                  # ...and print dispatch statistics
//!   mqroute run-handler log --message hi   # Invoke one handler directly

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use mqroute_core::config::RouterConfig;
use mqroute_core::service::{ChannelPublisher, NullPublisher};
use mqroute_core::types::{Payload, WorkItem};
use mqroute_core::ServiceContext;
use mqroute_engine::topic::topic_matches;
use mqroute_engine::{invoke_with_timeout, Dispatcher, FunctionTable, HandlerRegistry, Invocation};

#[derive(Parser)]
#[command(name = "mqroute", version, about = "📬 mqroute: bus message router for notification handlers")]
struct Cli {
    /// Configuration file (default: $MQROUTE_CONFIG or ./mqroute.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the routing table
    Check,
    /// Route "topic payload" lines from stdin until EOF or Ctrl-C
    Route {
        /// Treat every input line as a retained message
        #[arg(long)]
        retained: bool,
        /// Print dispatch statistics as JSON on exit
        #[arg(long)]
        stats: bool,
    },
    /// Invoke one handler directly, without routing or transformation
    RunHandler {
        /// Handler name as configured in [handlers.<name>]
        name: String,
        #[arg(long, default_value = "mqroute")]
        target: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "0")]
        priority: i64,
        /// Target address as JSON (default: the configured address of --target)
        #[arg(long)]
        addrs: Option<String>,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(path: Option<&str>) -> Result<RouterConfig> {
    let config = match path {
        Some(path) => RouterConfig::load_from(Path::new(&expand_path(path)))?,
        None => RouterConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "mqroute=debug,mqroute_engine=debug,mqroute_handlers=debug,mqroute_core=debug"
    } else {
        "mqroute=info,mqroute_engine=info,mqroute_handlers=info,mqroute_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Check => check(&config),
        Command::Route { retained, stats } => route(&config, retained, stats).await,
        Command::RunHandler {
            name,
            target,
            title,
            message,
            priority,
            addrs,
        } => {
            let addrs = addrs.map(|a| serde_json::from_str::<Value>(&a)).transpose()?;
            run_handler(&config, &name, &target, &title, &message, priority, addrs).await
        }
    }
}

fn check(config: &RouterConfig) -> Result<()> {
    let registry = HandlerRegistry::from_config(config, mqroute_handlers::builtin)?;
    let dispatcher = Dispatcher::from_config(
        config,
        Arc::new(FunctionTable::new()),
        registry.clone(),
        Arc::new(NullPublisher),
    )?;

    println!("✅ Configuration OK\n");
    println!("🔌 Handlers:");
    for name in registry.names() {
        println!("   {} → {}", name, registry.target_names(name).join(", "));
    }
    println!("\n📋 Rules:");
    for rule in dispatcher.rules() {
        println!("   [{}] {} (qos={}) → {:?}", rule.name, rule.topic, rule.qos, rule.targets);
    }
    println!("\n📡 Subscriptions:");
    for (topic, qos) in dispatcher.subscriptions() {
        println!("   {} (qos={})", topic, qos);
    }
    if !config.cron.is_empty() {
        println!("\n⏰ Periodic tasks:");
        for (name, spec) in &config.cron {
            let options = spec.options()?;
            println!("   {} every {:?}{}", name, options.interval, if options.now { " (now)" } else { "" });
        }
    }
    Ok(())
}

async fn route(config: &RouterConfig, retained: bool, print_stats: bool) -> Result<()> {
    let (publisher, mut outbound) = ChannelPublisher::new();
    let registry = HandlerRegistry::from_config(config, mqroute_handlers::builtin)?;
    let dispatcher = Arc::new(Dispatcher::from_config(
        config,
        Arc::new(FunctionTable::new()),
        registry,
        Arc::new(publisher),
    )?);

    let subscriptions = dispatcher.subscriptions();
    for (topic, qos) in &subscriptions {
        tracing::info!("📡 Subscribed to {} (qos={})", topic, qos);
    }
    dispatcher.start().await;

    // Published messages re-enter the router when a rule subscribes to them.
    let loopback = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            while let Some(message) = outbound.recv().await {
                if subscriptions.iter().any(|(pattern, _)| topic_matches(pattern, &message.topic)) {
                    dispatcher.on_message(&message.topic, Payload::from_bytes(message.payload), message.retain);
                } else {
                    tracing::debug!("Published to {} (no local subscriber)", message.topic);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => feed(&dispatcher, &line, retained),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Interrupted, shutting down");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    loopback.abort();

    if print_stats {
        println!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);
    }
    Ok(())
}

/// `topic payload`: payload is everything after the first whitespace run.
fn feed(dispatcher: &Dispatcher, line: &str, retained: bool) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    let (topic, payload) = match line.split_once(char::is_whitespace) {
        Some((topic, payload)) => (topic, payload.trim_start()),
        None => (line, ""),
    };
    let jobs = dispatcher.on_message(topic, Payload::from(payload), retained);
    tracing::debug!("{} job(s) for {}", jobs, topic);
}

async fn run_handler(
    config: &RouterConfig,
    name: &str,
    target: &str,
    title: &str,
    message: &str,
    priority: i64,
    addrs: Option<Value>,
) -> Result<()> {
    let section = config
        .handlers
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("Handler `{name}` has no [handlers.{name}] section"))?;
    let module = section.module.as_deref().unwrap_or(name);
    let handler = mqroute_handlers::builtin(module)
        .ok_or_else(|| anyhow::anyhow!("Handler `{name}`: unknown module `{module}`"))?;

    let addrs = addrs
        .or_else(|| section.targets.get(target).cloned())
        .unwrap_or(Value::Null);
    let script = &config.defaults.script_name;
    let ctx = ServiceContext::new(&format!("{script}.context"), script, Arc::new(NullPublisher))
        .for_handler(name);

    let item = WorkItem {
        handler: name.to_string(),
        rule: String::new(),
        target: target.to_string(),
        config: section.settings.clone(),
        addrs,
        topic: String::new(),
        payload: Payload::from(message),
        data: Map::new(),
        title: title.to_string(),
        image: String::new(),
        message: message.to_string(),
        priority,
    };

    let response = invoke_with_timeout(handler, ctx, item, config.handler_timeout()).await;
    tracing::info!("Handler response: {:?}", response);
    match response {
        Invocation::Returned(true) => Ok(()),
        _ => anyhow::bail!("handler `{name}` did not deliver"),
    }
}
