mod args;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use mdns_core::{Engine, EngineConfig, Event, ResolveHandle, ServiceEvent};
use shared::protocol::default_log_filter;
use shared::types::ServiceEntry;

use crate::args::{Command, Options};

/// Longest sleep between polls.
const MAX_WAIT: Duration = Duration::from_millis(20);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(default_log_filter("mdns-client"))
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = Options::parse();
    let config = match &options.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();
    let host = hostname.split('.').next().unwrap_or_default().to_string();
    let engine = Engine::bind(config, &host).context("Failed to bind mDNS sockets")?;

    run(engine, &options)
}

fn load_config(path: &str) -> Result<EngineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config file: {}", path))
}

fn run(mut engine: Engine, options: &Options) -> Result<()> {
    let deadline = Instant::now() + options.timeout();
    let mut pending: Vec<ResolveHandle> = Vec::new();

    match &options.command {
        Command::Services => {
            engine.browse_service_types()?;
        }
        Command::Browse { service_type } => {
            engine.browse(service_type)?;
        }
        Command::Resolve { instance } => {
            pending.push(engine.resolve(instance)?);
        }
        Command::Query { name, rtype, watch } => {
            engine.query(name, *rtype, Command::query_mode(*watch))?;
        }
    }

    while Instant::now() < deadline {
        engine.poll(Instant::now())?;

        while let Some(event) = engine.next_event() {
            match event {
                Event::Browse {
                    event: ServiceEvent::Added(name),
                    ..
                } => {
                    println!("+ {}", name);
                    if matches!(options.command, Command::Browse { .. }) {
                        pending.push(engine.resolve(&name.to_string())?);
                    }
                }
                Event::Browse {
                    event: ServiceEvent::Removed(name),
                    ..
                } => println!("- {}", name),
                Event::Resolved { handle, result } => {
                    pending.retain(|h| *h != handle);
                    match result {
                        Ok(instance) => {
                            let entry = ServiceEntry::from_instance(&instance, Utc::now());
                            println!("{}", serde_json::to_string_pretty(&entry)?);
                        }
                        Err(e) => eprintln!("resolve failed: {}", e),
                    }
                    if matches!(options.command, Command::Resolve { .. }) {
                        return Ok(());
                    }
                }
                Event::Answer { record, change, .. } => {
                    println!("{:?} {}", change, record);
                }
                Event::QueryFinished { answered, .. } => {
                    if !answered {
                        eprintln!("no answer");
                    }
                    return Ok(());
                }
                Event::Registered(_) | Event::Conflict { .. } => {}
            }
        }

        let wait = engine
            .next_timeout()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);
        std::thread::sleep(wait);
    }

    if !pending.is_empty() {
        tracing::debug!("{} resolves still pending at exit", pending.len());
    }
    Ok(())
}
