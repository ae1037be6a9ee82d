//! KindleOCR - Main Application Entrypoint
//!
//! Parses the command line, sets up logging and the interrupt handler, and
//! hands the run to the library.

use clap::Parser;
use kindleocr::settings::Settings;
use kindleocr::state::{StateStore, sanitize_title};
use kindleocr::{RunRequest, run};
use log::{error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Captures every page of a book open in the Kindle reader and extracts its text with OCR.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Book title; names the output file and the saved state
    #[arg(short, long, required_unless_present = "list")]
    title: Option<String>,

    /// Total number of pages in the book
    #[arg(short = 'p', long)]
    total_pages: Option<u32>,

    /// First page to process
    #[arg(short, long, default_value_t = 1)]
    start_page: u32,

    /// Configuration file (defaults to config/config.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Continue a previously interrupted run of this title
    #[arg(short, long)]
    resume: bool,

    /// Force debug logging
    #[arg(short, long)]
    debug: bool,

    /// With --resume, continue a run that was marked failed
    #[arg(long, requires = "resume")]
    force: bool,

    /// Process saved page_*.png screenshots from this directory instead of a live window
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,

    /// List saved runs and exit
    #[arg(long)]
    list: bool,
}

/// Copies log output to stderr and a log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Expands `{book_title}` and `{date}` in the configured log path.
fn log_file_path(template: &str, title: Option<&str>) -> PathBuf {
    let title = title.map(sanitize_title).unwrap_or_else(|| "kindleocr".to_string());
    let date = chrono::Local::now().format("%Y%m%d").to_string();
    PathBuf::from(
        template
            .replace("{book_title}", &title)
            .replace("{date}", &date),
    )
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_logger(level: &str, log_file: Option<PathBuf>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    let mut file_error = None;
    if let Some(path) = log_file {
        match open_log_file(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
            }
            Err(e) => file_error = Some((path, e)),
        }
    }
    builder.init();
    if let Some((path, e)) = file_error {
        warn!("Could not open log file {:?}: {}; logging to stderr only", path, e);
    }
}

fn list_runs(settings: &Settings) {
    let store = StateStore::new(&settings.state.state_dir);
    let states = store.list_all();
    if states.is_empty() {
        println!("No saved runs in {:?}", store.state_dir());
        return;
    }
    for state in states {
        println!(
            "{}\t{:?}\tpage {}/{}\tprocessed {}\tfailed {}\tupdated {}",
            state.book_title,
            state.status,
            state.current_page,
            state.total_pages,
            state.processed_pages.len(),
            state.failed_pages.len(),
            state.last_update
        );
    }
}

fn main() {
    let args = Args::parse();

    let settings = match Settings::resolve(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            init_logger("info", None);
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // 1. Initialize Logger
    let level = if args.debug {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    let log_file = settings
        .logging
        .file_path
        .as_deref()
        .map(|template| log_file_path(template, args.title.as_deref()));
    init_logger(level, log_file);

    if args.list {
        list_runs(&settings);
        std::process::exit(0);
    }

    info!("Starting KindleOCR...");

    // 2. Stop between pages on Ctrl-C; a second Ctrl-C exits at once.
    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupt received; stopping after the current page...");
    }) {
        warn!("Could not install interrupt handler: {}", e);
    }

    // 3. Run
    let request = RunRequest {
        book_title: args.title.unwrap_or_default(),
        total_pages: args.total_pages,
        start_page: args.start_page,
        resume: args.resume,
        force: args.force,
        replay: args.replay,
    };
    match run(settings, &request, cancel) {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(e) => {
            error!("Application failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
