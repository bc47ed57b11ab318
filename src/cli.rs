use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;

use dashboard_assistant::auth::{Identity, UserId};
use dashboard_assistant::build_router;
use dashboard_assistant::catalog::{RefinementSpec, SchemaCatalog};
use dashboard_assistant::config::{Settings, StoreSettings};
use dashboard_assistant::llm::ChatMessage;
use dashboard_assistant::router::AskRequest;

#[derive(Parser)]
#[command(
    name = "dashboard-assistant-cli",
    about = "Ask the dashboard assistant from the terminal"
)]
struct Cli {
    /// Output machine-readable JSON (default: human-readable)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a question as the given user
    Ask {
        /// User id whose data is queried
        #[arg(long)]
        user: String,
        /// JSON file with prior turns: [{"role": "user", "content": "..."}]
        #[arg(long)]
        history: Option<PathBuf>,
        /// Fixture file for the in-process store (overrides ASSISTANT_FIXTURE)
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// The question (positional, collects remaining args)
        message: Vec<String>,
    },
    /// List queryable domains, tables and refinements
    Tables,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Ask {
            user,
            history,
            fixture,
            message,
        } => {
            let message = message.join(" ");
            if message.trim().is_empty() {
                return Err("a question is required".into());
            }
            let conversation_history: Vec<ChatMessage> = match history {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)
                    .map_err(|e| format!("{}: {e}", path.display()))?,
                None => Vec::new(),
            };

            let mut settings = Settings::from_env()?;
            if let Some(path) = fixture {
                settings.store = StoreSettings::Fixture { path };
            }
            let router = build_router(&settings)?;

            // The operator names the user directly; no session lookup.
            let identity = Identity::new(UserId::new(user));
            let response = router
                .answer(
                    &identity,
                    AskRequest {
                        message,
                        conversation_history,
                    },
                )
                .await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.response);
                if let Some(data) = &response.data {
                    eprintln!("({} rows, {})", data.len(), response.kind);
                }
            }
        }
        Command::Tables => {
            let catalog = SchemaCatalog::dashboard();
            if cli.json {
                let specs: Vec<_> = catalog
                    .function_specs()
                    .into_iter()
                    .map(|f| {
                        json!({
                            "name": f.name,
                            "description": f.description,
                            "parameters": f.parameters,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&specs)?);
            } else {
                print_catalog(&catalog);
            }
        }
    }

    Ok(())
}

fn print_catalog(catalog: &SchemaCatalog) {
    for schema in catalog.domains() {
        println!("{} ({})", schema.domain, schema.domain.function_name());
        println!("  {}", schema.description);
        for table in schema.tables.values() {
            let columns: Vec<&str> = table.columns.iter().map(String::as_str).collect();
            println!("  - {}: {}", table.name, columns.join(", "));
        }
        for refinement in &schema.refinements {
            let detail = match refinement {
                RefinementSpec::DateRange {
                    column,
                    start_key,
                    end_key,
                    ..
                } => format!("{{{start_key}, {end_key}}} on {column}"),
                RefinementSpec::NumericRange { fields, .. } => {
                    format!("{{field, min, max}} over {}", fields.join(", "))
                }
                RefinementSpec::Completion { column, .. } => {
                    format!("completed | pending | all on {column}")
                }
            };
            println!("  refinement {}: {detail}", refinement.param());
        }
        println!();
    }
}
