pub mod types;
pub mod error;
pub mod config;
pub mod identity;
pub mod query;
pub mod client;
pub mod classify;
pub mod store;
pub mod viz;
pub mod data;
pub mod server;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::{FieldOptions, ParamValue};
use crate::types::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the visualization API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Fetch and classify fields once, printing the class breaks as JSON
    Classify {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Group name from the configuration
        #[arg(short, long)]
        group: String,
        /// Property to symbolize; give twice for a bivariate map
        #[arg(short, long = "field", required = true)]
        fields: Vec<String>,
        /// Request parameter as key=value, shared by all fields
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, ParamValue)>,
        #[arg(short, long, default_value = "tract", value_parser = parse_level)]
        level: Level,
        /// Sum tract values into counties before classifying
        #[arg(long)]
        roll_up: bool,
        #[arg(long)]
        classes: Option<usize>,
    },
}

fn parse_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|e: error::VizError| e.to_string())
}

fn parse_param(s: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let value = if let Ok(i) = value.parse::<i64>() {
        ParamValue::Integer(i)
    } else if let Ok(x) = value.parse::<f64>() {
        ParamValue::Float(x)
    } else if let Ok(b) = value.parse::<bool>() {
        ParamValue::Bool(b)
    } else {
        ParamValue::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            tracing::info!("Serving visualization API with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(&config)?;

            let engine = viz::VizEngine::new(Arc::new(client::WfsClient::new()?));
            let seeded = data::seed_layers(&app_config, &engine).await?;
            tracing::info!("Seeded {} units from configured layers", seeded);

            server::start_server(app_config, engine).await?;
        }
        Commands::Classify { config, group, fields, params, level, roll_up, classes } => {
            let app_config = config::AppConfig::load_from_file(&config)?;
            let group = app_config.group(&group)?.clone();
            let fields: Vec<FieldOptions> = fields
                .into_iter()
                .map(|name| FieldOptions {
                    property_name: name,
                    parameters: params.iter().cloned().collect(),
                })
                .collect();
            let class_count = classes.unwrap_or(app_config.classification.class_count);
            let method = &app_config.classification.method;

            let engine = viz::VizEngine::new(Arc::new(client::WfsClient::new()?));
            data::seed_layers(&app_config, &engine).await?;

            let results = if roll_up {
                if level != Level::County {
                    return Err(anyhow!("--roll-up produces county breaks; use --level county"));
                }
                engine.update_viz_rolled_up(&group, &fields, class_count, method).await?
            } else {
                engine.update_viz(level, &group, &fields, class_count, method).await?
            };
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
