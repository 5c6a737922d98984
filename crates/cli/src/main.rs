use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use quire_core::prelude::*;
use quire_paginator::{PageEvent, Paginator, PaginatorDefaults};
use quire_select::Select;
use quire_store::{MemoryBus, MemoryRepository};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

type Record = Map<String, Value>;

#[derive(Parser, Debug)]
#[command(name = "quirectl", version, about = "Quire CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON array of records; a string `__uuid` field becomes the record's identity
    #[arg(long = "file", global = true)]
    file: Option<PathBuf>,

    /// Equality filter, e.g. `team=red` or `age=3` (repeatable)
    #[arg(long = "filter", global = true, action = ArgAction::Append)]
    filters: Vec<Filter>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct PageArgs {
    /// Page size (0 = everything)
    #[arg(long = "size")]
    size: Option<usize>,
    /// Page index
    #[arg(long = "index")]
    index: Option<usize>,
    /// Sort, e.g. "name" or "age:desc"
    #[arg(long = "sort")]
    sort: Option<PageSort>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print one page of the filtered records
    Page {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Toggle selection on the page and print the selected identities
    Select {
        #[command(flatten)]
        page: PageArgs,
        /// Toggle everything
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
        /// Toggle the items at these positions of the page
        #[arg(long = "toggle", num_args = 1..)]
        toggle: Vec<usize>,
    },
    /// Create a record matching the filters, then print it and the refreshed page
    Create {
        /// JSON object with the record's fields
        #[arg(long = "data")]
        data: String,
        /// Identity for the new record (generated when omitted)
        #[arg(long = "id")]
        id: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("QUIRE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("QUIRE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid QUIRE_METRICS_ADDR; expected host:port");
        }
    }
}

fn wait_limit() -> Duration {
    let secs = std::env::var("QUIRE_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    Duration::from_secs(secs)
}

/// Await `fut`, failing after `QUIRE_WAIT_SECS`.
async fn settle<F: Future>(what: &str, fut: F) -> Result<F::Output> {
    let limit = wait_limit();
    tokio::time::timeout(limit, fut)
        .await
        .with_context(|| format!("timed out after {}s waiting for {}", limit.as_secs(), what))
}

fn load_records(path: Option<&PathBuf>) -> Result<Arc<MemoryRepository<Record>>> {
    let repo = Arc::new(MemoryRepository::new());
    if let Some(path) = path {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let doc: Value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let n = repo.load_plain(doc).with_context(|| format!("loading {}", path.display()))?;
        info!(records = n, file = %path.display(), "records loaded");
    }
    Ok(repo)
}

/// Apply sort, size and index, then re-run the query so the window is current.
async fn apply_page(select: &Select<Record>, page: &PageArgs) -> Result<()> {
    let paginator = select.paginator();
    if let Some(sort) = page.sort.clone() {
        paginator.set_page_sort(sort);
    }
    let event = PageEvent { page_index: page.index, page_size: page.size };
    if !settle("page change", paginator.set_page(event)).await? {
        bail!("change stream closed before the page refreshed");
    }
    settle("results", select.results_as_promise()).await?;
    Ok(())
}

fn plain(e: &Entity<Record>) -> Result<Record> { Ok(e.to_plain()?) }

fn print_page(output: Output, paginator: &Paginator<Record>) -> Result<()> {
    let results = paginator.results();
    match output {
        Output::Human => {
            let options: Vec<String> = paginator.page_size_options().iter().map(|s| s.to_string()).collect();
            let sort = paginator.page_sort();
            println!(
                "page {} • size {} • length {} • options [{}] • sort {}",
                paginator.page_index(),
                paginator.page_size(),
                paginator.length(),
                options.join(", "),
                if sort.is_unsorted() { "-".to_string() } else { format!("{}:{}", sort.active, sort.direction) }
            );
            println!("{:<38} RECORD", "ID");
            for e in &results {
                println!("{:<38} {}", e.identity().as_str(), serde_json::to_string(e.model())?);
            }
        }
        Output::Json => {
            let items = results.iter().map(|e| plain(e)).collect::<Result<Vec<_>>>()?;
            let doc = json!({
                "page_index": paginator.page_index(),
                "page_size": paginator.page_size(),
                "page_size_options": paginator.page_size_options(),
                "length": paginator.length(),
                "page_sort": paginator.page_sort(),
                "results": items,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let repo = load_records(cli.file.as_ref())?;
    let query = cli.filters.iter().cloned().fold(Query::new(), |q, f| q.filter(f.field, f.value));
    let bus = Arc::new(MemoryBus::new(repo, query).context("starting memory bus")?);
    let defaults = PaginatorDefaults::from_env();
    let paginator = Paginator::<Record>::with_defaults(bus.clone(), defaults);
    let select = Select::new(bus, paginator);

    match cli.command {
        Commands::Page { page } => {
            info!(size = ?page.size, index = ?page.index, sort = ?page.sort, "page invoked");
            apply_page(&select, &page).await?;
            print_page(cli.output, select.paginator())?;
        }
        Commands::Select { page, all, toggle } => {
            info!(all, toggles = toggle.len(), "select invoked");
            apply_page(&select, &page).await?;
            let paginator = select.paginator();
            if all {
                paginator.toggle_selection(None);
            }
            let visible = paginator.results();
            for idx in toggle {
                match visible.get(idx) {
                    Some(e) => paginator.toggle_selection(Some(&**e)),
                    None => warn!(index = idx, visible = visible.len(), "toggle index out of range"),
                }
            }
            let selected = paginator.selected();
            match cli.output {
                Output::Human => {
                    println!("selected {} of {} (all: {})", paginator.selected_count_now(), paginator.length(), paginator.is_selected_all_now());
                    for e in &selected {
                        println!("{}", e.identity());
                    }
                }
                Output::Json => {
                    let ids: Vec<&str> = selected.iter().map(|e| e.identity().as_str()).collect();
                    let doc = json!({
                        "selected": ids,
                        "count": paginator.selected_count_now(),
                        "select_all": paginator.is_selected_all_now(),
                        "length": paginator.length(),
                    });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
        }
        Commands::Create { data, id } => {
            let data: Value = serde_json::from_str(&data).context("parsing --data")?;
            let Value::Object(data) = data else { bail!("--data must be a JSON object") };
            info!(id = ?id, fields = data.len(), "create invoked");
            let created = settle("create", select.create(Some(data), id.map(IdentityKey::from))).await??;
            match cli.output {
                Output::Human => {
                    println!("created {} {}", created.identity(), serde_json::to_string(created.model())?);
                    print_page(cli.output, select.paginator())?;
                }
                Output::Json => {
                    let page = select.results().iter().map(|e| plain(e)).collect::<Result<Vec<_>>>()?;
                    let doc = json!({ "created": plain(&created)?, "results": page });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
        }
    }

    select.unsubscribe();
    select.paginator().dispose();
    Ok(())
}
