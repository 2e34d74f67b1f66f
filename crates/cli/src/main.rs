use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ingest::{ImportOptions, ImportPhase};
use render::{ConversationView, DisplayStyle, ExportFormat};
use store_sqlite::{REGISTRY_TABLE, Row, SqliteStore};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod render;
mod ui;

use config::Config;

#[derive(Parser)]
#[command(name = "chatvault")]
#[command(about = "Import chat exports into SQLite and read conversations back")]
struct Cli {
    /// SQLite database to use.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Debug logging (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a file, directory or zip archive.
    Import {
        path: PathBuf,
        /// Key records without an id field on all of their columns.
        #[arg(long, default_value_t = false)]
        compound_keys: bool,
    },
    /// Print every table with its rows.
    Show {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Summarize tables and schema bindings.
    Info,
    /// Print conversations whose id starts with any of the prefixes.
    Print {
        prefixes: Vec<String>,
        #[arg(long, value_enum, default_value_t = DisplayStyle::Default)]
        style: DisplayStyle,
    },
    /// Write one file per conversation.
    Export {
        prefixes: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        #[arg(long, value_enum, default_value_t = DisplayStyle::Default)]
        style: DisplayStyle,
    },
    /// Report what an import would do without writing anything.
    Inspect { path: Option<PathBuf> },
    Doctor,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating parent dir for {}", path.display()))?;
    }
    let store = SqliteStore::open(path)?;
    store.init_schema()?;
    Ok(store)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::load()?;
    let t = Instant::now();

    let options = ImportOptions {
        compound_keys: false,
        aliases: config.table_aliases.clone(),
        html_variable: config.html_variable.clone(),
    };

    if let Commands::Inspect { path } = &cli.command {
        let root = path.clone().unwrap_or_else(|| PathBuf::from("."));
        info!(path = %root.display(), "inspecting");
        let items = ingest::inspect_path(&root, &options)?;
        ui::print_inspection(&items);
        info!(sources = items.len(), elapsed = ?t.elapsed(), "inspected");
        return Ok(());
    }

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(SqliteStore::default_path);
    info!(path = %db_path.display(), "opening database");
    let mut store = open_store(&db_path)?;

    match cli.command {
        Commands::Import {
            path,
            compound_keys,
        } => {
            let options = ImportOptions {
                compound_keys,
                ..options
            };
            info!(path = %path.display(), "importing");
            let report = ingest::import_path(&path, &mut store, &options, |phase| match phase {
                ImportPhase::Source { origin, records } => {
                    debug!(origin = %origin, records, "source parsed");
                }
                ImportPhase::Group {
                    table,
                    inserted,
                    ignored,
                } => {
                    info!(table = %table, rows = inserted, ignored, "group written");
                }
                ImportPhase::Done { rows_inserted } => {
                    debug!(rows = rows_inserted, "import done");
                }
            })?;
            ui::print_import_report(&report);
            info!(elapsed = ?t.elapsed(), "imported");
        }
        Commands::Show { limit } => {
            for table in store.list_tables()? {
                let columns = store.table_columns(&table)?;
                let rows = store.rows(&table, limit)?;
                ui::print_table(&table, &columns, &rows, config.truncate_width);
            }
        }
        Commands::Info => {
            let tables = store.list_tables()?;
            println!("database: {}", db_path.display());
            println!("tables: {}", tables.len());
            for table in &tables {
                let columns = store.table_columns(table)?;
                println!(
                    "  {table} ({} rows): {}",
                    store.row_count(table)?,
                    columns.join(", ")
                );
            }
            let bindings = store.bindings()?;
            println!("bindings: {}", bindings.len());
            for b in &bindings {
                println!(
                    "  {} <- {} [{}] {}",
                    b.table_name,
                    b.logical_name,
                    b.fingerprint.short(),
                    b.created_at.to_rfc3339()
                );
            }
        }
        Commands::Print { prefixes, style } => {
            let views = load_conversations(&store, &config.conversation_table, &prefixes)?;
            if views.is_empty() {
                println!("{}", no_match_message(&prefixes));
                return Ok(());
            }
            print!("{}", render::render_many(&views, style));
            info!(conversations = views.len(), elapsed = ?t.elapsed(), "printed");
        }
        Commands::Export {
            prefixes,
            out,
            format,
            style,
        } => {
            let views = load_conversations(&store, &config.conversation_table, &prefixes)?;
            if views.is_empty() {
                println!("{}", no_match_message(&prefixes));
                return Ok(());
            }
            let dir = ui::resolve_output_dir(out.or_else(|| config.export_dir.clone()))?;
            let mut used = HashSet::new();
            for view in &views {
                let name = export_file_name(&view.record.id, format, &mut used);
                let path = dir.join(name);
                let body = render::render(view, format, style)?;
                std::fs::write(&path, body)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("{}", path.display());
            }
            info!(conversations = views.len(), dir = %dir.display(), elapsed = ?t.elapsed(), "exported");
        }
        Commands::Doctor => {
            info!("running integrity check");
            let check = store.integrity_check()?;
            let bindings = store.bindings()?;
            let bound: HashSet<String> = bindings
                .iter()
                .map(|b| b.table_name.to_ascii_lowercase())
                .collect();
            let unregistered: Vec<String> = store
                .list_tables()?
                .into_iter()
                .filter(|t| t != REGISTRY_TABLE && !bound.contains(&t.to_ascii_lowercase()))
                .collect();
            let missing: Vec<&str> = bindings
                .iter()
                .filter(|b| !store.table_exists(&b.table_name).unwrap_or(false))
                .map(|b| b.table_name.as_str())
                .collect();
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("integrity_check={check}");
            println!("bindings={}", bindings.len());
            println!("unregistered_tables={}", unregistered.join(","));
            println!("missing_tables={}", missing.join(","));
        }
        Commands::Inspect { .. } => {}
    }

    Ok(())
}

fn no_match_message(prefixes: &[String]) -> String {
    if prefixes.is_empty() {
        "No conversations found.".to_string()
    } else {
        format!(
            "No conversations found with prefixes: {}",
            prefixes.join(", ")
        )
    }
}

/// Ids are sanitized like table names. When two ids in one run sanitize to
/// the same stem, the later one gets a short hash of the raw id appended.
fn export_file_name(id: &str, format: ExportFormat, used: &mut HashSet<String>) -> String {
    let stem = core_model::sanitize_identifier(id).unwrap_or_else(|_| "conversation".to_string());
    let ext = format.extension();
    let name = format!("{stem}.{ext}");
    if used.insert(name.clone()) {
        return name;
    }
    let digest = blake3::hash(id.as_bytes()).to_hex();
    let mut name = format!("{stem}_{}.{ext}", &digest[..8]);
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{stem}_{}_{n}.{ext}", &digest[..8]);
        n += 1;
    }
    warn!(conversation = %id, file = %name, "export name taken, using hashed name");
    name
}

fn row_fields(row: &Row) -> Vec<(String, Option<String>)> {
    row.columns
        .iter()
        .cloned()
        .zip(row.values.iter().cloned())
        .collect()
}

/// Conversations from every table allocated for `logical`, matched by id
/// prefix (all of them without prefixes). Each id is returned once.
fn load_conversations(
    store: &SqliteStore,
    logical: &str,
    prefixes: &[String],
) -> anyhow::Result<Vec<ConversationView>> {
    let mut tables: Vec<String> = store
        .tables_for_logical(logical)?
        .into_iter()
        .map(|b| b.table_name)
        .collect();
    if tables.is_empty() && store.table_exists(logical)? {
        tables.push(logical.to_string());
    }
    if tables.is_empty() {
        warn!(table = %logical, "no conversation table");
    }

    let mut seen = HashSet::new();
    let mut views = Vec::new();
    for table in &tables {
        if !store.table_columns(table)?.iter().any(|c| c == "id") {
            debug!(table = %table, "no id column");
            continue;
        }
        let rows = if prefixes.is_empty() {
            store.rows(table, None)?
        } else {
            let mut rows = Vec::new();
            for prefix in prefixes {
                rows.extend(store.rows_by_key_prefix(table, "id", prefix)?);
            }
            rows
        };
        for row in rows {
            let Some(id) = row.get("id").map(str::to_string) else {
                continue;
            };
            if seen.insert(id) {
                views.push(ConversationView::from_fields(row_fields(&row)));
            }
        }
    }
    Ok(views)
}
