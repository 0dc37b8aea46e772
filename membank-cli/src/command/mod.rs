use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::Subcommand;
use log::info;

use membank::manager::{ExportFormat, ExportOptions, ImportOptions, Manager, StoreRequest};
use membank::value::Value;

/// The operations exposed by the CLI: a thin wrapper over the manager
/// facade's public API, not where any invariant is enforced.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a value under category/key, creating or updating it.
    Store {
        category: String,
        key: String,
        /// A JSON document, or a plain string if it doesn't parse as JSON.
        value: String,
        #[clap(long)]
        namespace: Option<String>,
        #[clap(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[clap(long)]
        ttl_ms: Option<i64>,
    },

    /// Fetch a single item by category/key.
    Get {
        category: String,
        key: String,
        #[clap(long)]
        namespace: Option<String>,
    },

    /// Delete an item by category/key.
    Delete {
        category: String,
        key: String,
        #[clap(long)]
        namespace: Option<String>,
    },

    /// List items matching filters.
    Query {
        #[clap(long)]
        category: Option<String>,
        #[clap(long)]
        tag: Option<String>,
        #[clap(long)]
        namespace: Option<String>,
        #[clap(long)]
        as_of: Option<i64>,
        #[clap(long)]
        limit: Option<usize>,
    },

    /// Dump the store (or a filtered slice of it) as JSON or markdown.
    Export {
        #[clap(long, default_value = "json")]
        format: String,
        #[clap(long)]
        namespace: Option<String>,
    },

    /// Load a JSON snapshot produced by `export`.
    Import {
        file: String,
        #[clap(long)]
        merge: bool,
        #[clap(long)]
        namespace: Option<String>,
    },

    /// Print backend/cache/replication statistics.
    Stats,
}

pub fn run_command(command: Command, manager: &mut Manager) -> Result<()> {
    match command {
        Command::Store {
            category,
            key,
            value,
            namespace,
            tags,
            ttl_ms,
        } => {
            info!("storing {category}/{key}");
            let parsed = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            let stored = manager
                .store(
                    StoreRequest {
                        value: parsed,
                        category: Some(category),
                        key: Some(key),
                        tags: tags.into_iter().collect::<BTreeSet<_>>(),
                        ttl_ms,
                        ..Default::default()
                    },
                    namespace,
                    None,
                )
                .context("store failed")?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
            Ok(())
        }
        Command::Get { category, key, namespace } => {
            match manager.get(&category, &key, namespace, None).context("get failed")? {
                Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                None => println!("null"),
            }
            Ok(())
        }
        Command::Delete { category, key, namespace } => {
            let existed = manager.delete(&category, &key, namespace, None).context("delete failed")?;
            println!("{existed}");
            Ok(())
        }
        Command::Query {
            category,
            tag,
            namespace,
            as_of,
            limit,
        } => {
            let query = membank::value::Query {
                categories: category.map(|c| [c].into_iter().collect()),
                tags: tag.map(|t| [t].into_iter().collect()),
                namespace,
                as_of,
                limit,
                ..Default::default()
            };
            let items = manager.query(&query, None).context("query failed")?;
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }
        Command::Export { format, namespace } => {
            let format = match format.as_str() {
                "markdown" | "md" => ExportFormat::Markdown,
                _ => ExportFormat::Snapshot,
            };
            let rendered = manager
                .export(format, ExportOptions { namespace, categories: None, ..Default::default() })
                .context("export failed")?;
            println!("{rendered}");
            Ok(())
        }
        Command::Import { file, merge, namespace } => {
            let contents = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let snapshot: membank::value::Snapshot = serde_json::from_str(&contents)?;
            let count = manager
                .import(
                    snapshot,
                    ImportOptions {
                        namespace_override: namespace,
                        merge,
                    },
                )
                .context("import failed")?;
            println!("imported {count} items");
            Ok(())
        }
        Command::Stats => {
            let stats = manager.get_stats().context("stats failed")?;
            println!("{stats:#?}");
            Ok(())
        }
    }
}
