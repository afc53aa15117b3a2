use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use quire_core::{
    AuthStore, BookInfo, Chapter, ChapterContent, DirectorySourceRepository, DirectorySourceRepositoryBuilder, Engine,
    EngineConfig, MemoryStore, Stores,
};

mod echo;

use echo::{print_banner, print_detail, print_error, print_info, print_step, print_success, print_timing};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid format: {}. Valid options: text, json", s)),
        }
    }
}

/// Fetch book info, chapter lists and chapter text through source rules
#[derive(Parser, Debug)]
#[command(name = "quire")]
#[command(author = "Quire Contributors")]
#[command(version)]
#[command(about = "Fetch book info, chapter lists and chapter text through source rules", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory of <id>.json source definitions (default: ~/.config/quire/sources and ./sources)
    #[arg(long, global = true, value_name = "DIR")]
    sources: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short, long, global = true, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text", value_name = "FORMAT")]
    format: OutputFormat,

    /// HTTP timeout in seconds
    #[arg(long, global = true, default_value = "30", value_name = "SECS")]
    timeout: u64,

    /// Script timeout in milliseconds
    #[arg(long, global = true, default_value = "5000", value_name = "MS")]
    script_timeout: u64,

    /// Custom User-Agent for requests whose source sets none
    #[arg(long, global = true, value_name = "UA")]
    user_agent: Option<String>,

    /// Cookie header sent to the requested URL's origin
    #[arg(long, global = true, value_name = "COOKIE")]
    cookie: Option<String>,

    /// Maximum pages followed for chapter content
    #[arg(long, global = true, default_value = "8", value_name = "NUM")]
    max_pages: usize,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// A source id and the URL to fetch through it
#[derive(clap::Args, Debug, Clone)]
struct Target {
    /// Source id
    source: String,
    /// Absolute URL, relative URL or data: pseudo-URL
    url: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch book details
    Info(Target),
    /// Fetch the table of contents
    Toc(Target),
    /// Fetch chapter text, following continuation pages
    Content(Target),
    /// List available source ids
    Sources,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "quire_core=debug,info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

fn repository(dir: Option<&PathBuf>) -> DirectorySourceRepository {
    match dir {
        Some(dir) => DirectorySourceRepositoryBuilder::new().custom_dir(dir).build(),
        None => DirectorySourceRepository::default(),
    }
}

fn render_info(info: &BookInfo) -> String {
    let mut out = String::new();
    for (label, value) in [
        ("Name", &info.name),
        ("Author", &info.author),
        ("Kind", &info.kind),
        ("Latest", &info.last_chapter),
        ("Cover", &info.cover_url),
        ("Contents", &info.toc_url),
    ] {
        if !value.is_empty() {
            out.push_str(&format!("{}: {}\n", label, value));
        }
    }
    if !info.intro.is_empty() {
        out.push_str(&format!("\n{}\n", info.intro));
    }
    out
}

fn render_toc(chapters: &[Chapter]) -> String {
    chapters.iter().map(|c| format!("{}\t{}\n", c.title, c.url)).collect()
}

fn render_content(chapter: &ChapterContent) -> String {
    if chapter.title.is_empty() {
        format!("{}\n", chapter.content)
    } else {
        format!("{}\n\n{}\n", chapter.title, chapter.content)
    }
}

fn build_engine(args: &Args, sources: Arc<DirectorySourceRepository>, target: &Target) -> anyhow::Result<Engine> {
    let store = MemoryStore::new();
    if let Some(cookie) = &args.cookie {
        store.set_cookie(&target.source, &target.url, cookie);
    }

    let mut config = EngineConfig::builder()
        .fetch_timeout_ms(args.timeout.saturating_mul(1000))
        .script_timeout_ms(args.script_timeout)
        .max_content_pages(args.max_pages);
    if let Some(user_agent) = &args.user_agent {
        config = config.user_agent(user_agent);
    }

    Engine::builder(sources).stores(Stores::memory(store)).config(config.build()).build().context("Failed to build engine")
}

async fn run(args: Args) -> anyhow::Result<()> {
    let sources = Arc::new(repository(args.sources.as_ref()));

    let target = match &args.command {
        Command::Sources => {
            let ids = sources.list_ids();
            let output = match args.format {
                OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&ids)?),
                OutputFormat::Text => ids.iter().map(|id| format!("{}\n", id)).collect(),
            };
            return write_output(args.output.as_ref(), &output);
        }
        Command::Info(target) | Command::Toc(target) | Command::Content(target) => target.clone(),
    };

    let engine = build_engine(&args, sources, &target)?;
    let Target { source, url } = &target;

    if args.verbose {
        print_step(1, 2, &format!("Fetching from {}", url.bright_white().underline()));
        print_detail("Source", source);
    }

    let started = Instant::now();
    let output = match &args.command {
        Command::Toc(_) => {
            let chapters = engine.fetch_chapter_list(source, url).await.context("Failed to fetch chapter list")?;
            if args.verbose {
                print_detail("Chapters", &chapters.len().to_string());
            }
            match args.format {
                OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&chapters)?),
                OutputFormat::Text => render_toc(&chapters),
            }
        }
        Command::Content(_) => {
            let chapter = engine.fetch_chapter_content(source, url).await.context("Failed to fetch chapter content")?;
            if args.verbose {
                print_detail("Pages", &chapter.pages.to_string());
            }
            match args.format {
                OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&chapter)?),
                OutputFormat::Text => render_content(&chapter),
            }
        }
        _ => {
            let info = engine.fetch_book_info(source, url).await.context("Failed to fetch book info")?;
            match args.format {
                OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&info)?),
                OutputFormat::Text => render_info(&info),
            }
        }
    };

    if args.verbose {
        print_timing(started.elapsed());
        print_step(2, 2, "Writing output");
        print_detail("Format", &format!("{:?}", args.format));
        eprintln!();
    }

    write_output(args.output.as_ref(), &output)
}

fn write_output(path: Option<&PathBuf>, output: &str) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            fs::write(path, output).with_context(|| format!("Failed to write to file: {}", path.display()))?;
            print_success(&format!("Output written to {}", path.display().bright_white()));
        }
        None => print!("{}", output),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(args.verbose) {
        print_error(&format!("{:#}", e));
    }

    if args.verbose {
        print_banner();
        print_info("Debug logging enabled");
        eprintln!();
    }

    if let Err(e) = run(args).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
