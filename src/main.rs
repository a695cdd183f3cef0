//! jmx-collector - periodic JMX metrics collection agent

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use jmx_collector::app::{App, InstanceListing};
use jmx_collector::cli::{Cli, Command, OutputFormat};
use jmx_collector::config::{AppConfig, ReporterConfig};
use jmx_collector::connection::JolokiaConnectionFactory;
use jmx_collector::reporter::{ConsoleReporter, PrometheusReporter, Reporter};
use jmx_collector::server::{self, ServerState};

#[derive(Serialize)]
struct ValidationReport {
    valid: bool,
    instances: Vec<InstanceSummary>,
}

#[derive(Serialize)]
struct InstanceSummary {
    name: String,
    url: String,
    check_name: String,
    configurations: usize,
}

fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        OutputFormat::Text => {}
    }
    Ok(())
}

fn validate(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let mut instances = Vec::with_capacity(config.instances.len());
    for instance in &config.instances {
        instances.push(InstanceSummary {
            name: instance.name.clone(),
            url: instance.url.clone(),
            check_name: instance.check_name.clone(),
            configurations: config.configurations(instance)?.len(),
        });
    }
    let report = ValidationReport {
        valid: true,
        instances,
    };

    if format != OutputFormat::Text {
        return print_structured(&report, format);
    }
    println!("Configuration is valid: {} instance(s)", report.instances.len());
    for instance in &report.instances {
        println!(
            "  {} ({}) -> {} [{} configuration(s)]",
            instance.name, instance.check_name, instance.url, instance.configurations
        );
    }
    Ok(())
}

fn print_listings(listings: &[InstanceListing], format: OutputFormat) -> Result<()> {
    if format != OutputFormat::Text {
        return print_structured(&listings, format);
    }
    for listing in listings {
        println!("Instance {}", listing.instance);
        if let Some(error) = &listing.error {
            println!("  error: {}", error);
        }
        let Some(report) = &listing.report else {
            continue;
        };
        let sections = [
            ("Matching", &report.matching),
            ("Not matching", &report.not_matching),
            ("Limited", &report.limited),
        ];
        for (title, attributes) in sections {
            if attributes.is_empty() {
                continue;
            }
            println!("  {} ({}):", title, attributes.len());
            for attribute in attributes {
                let metrics: Vec<String> = attribute
                    .metrics
                    .iter()
                    .map(|m| format!("{} ({})", m.alias, m.metric_type))
                    .collect();
                println!(
                    "    {}#{} [{}] {}",
                    attribute.bean,
                    attribute.attribute,
                    attribute.type_name,
                    metrics.join(", ")
                );
            }
        }
        if report.limit_reached {
            println!("  max_returned_metrics reached");
        }
    }
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn collect(config: AppConfig) -> Result<()> {
    let exporter = match config.reporter {
        ReporterConfig::Prometheus => Some(Arc::new(PrometheusReporter::new())),
        ReporterConfig::Console => None,
    };
    let reporter: Arc<dyn Reporter> = match &exporter {
        Some(exporter) => exporter.clone(),
        None => Arc::new(ConsoleReporter::new()),
    };

    let mut app = App::new(config.clone(), Arc::new(JolokiaConnectionFactory), reporter)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        server::shutdown_signal().await;
        let _ = tx.send(true);
    });

    let server = if config.server.enabled {
        let state = ServerState {
            config: Arc::new(config.server.clone()),
            health: app.health(),
            exporter,
        };
        Some(tokio::spawn(server::run(state, wait_for_shutdown(rx.clone()))))
    } else {
        None
    };

    app.run(wait_for_shutdown(rx)).await;

    if let Some(server) = server {
        match server.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Server task failed"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.command() {
        Command::Collect => AppConfig::load_or_default(&cli.config)?,
        _ => AppConfig::load(&cli.config)?,
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let log_format = cli.log_format.unwrap_or(config.log_format);
    jmx_collector::init_logging(&cli.log_level.to_string(), log_format)?;

    match cli.command() {
        Command::Validate { output_format } => validate(&config, output_format),
        Command::List {
            action,
            output_format,
        } => {
            let mut app = App::new(
                config,
                Arc::new(JolokiaConnectionFactory),
                Arc::new(ConsoleReporter::new()),
            )?;
            let listings = app.list(action.into()).await;
            print_listings(&listings, output_format)
        }
        Command::Collect => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                instances = config.instances.len(),
                "Starting jmx-collector"
            );
            collect(config).await
        }
    }
}
