use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use weblog::db::{self, reports};
use weblog::utils::stop_signal;
use weblog::{IngestOptions, Ingestor, PollOutcome, Settings, Tailer};

#[derive(Parser, Debug)]
#[command(name = "weblog", about = "Load web server access logs into SQLite and report on them")]
struct Cli {
    /// Config file, defaults to ./weblog.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file, overrides the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one access log file
    Process {
        file: PathBuf,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Print a report over the stored records
    Report {
        #[command(subcommand)]
        report: Report,
    },
    /// Follow a growing log file
    Tail {
        file: PathBuf,
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        from_start: bool,
        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },
    /// Delete records older than the given number of days
    Cleanup {
        #[arg(long)]
        days: u32,
    },
}

#[derive(Subcommand, Debug)]
enum Report {
    TopIps {
        #[arg(default_value_t = 10)]
        n: u32,
    },
    StatusCodes,
    Hourly,
    TopPaths {
        #[arg(default_value_t = 10)]
        n: u32,
    },
    ByOs,
    /// Error responses (status >= 400) on one day, YYYY-MM-DD
    Errors { date: NaiveDate },
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        settings.database.path = db;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let pool = db::init(&settings.database.path).with_context(|| {
        format!(
            "failed to open database {}",
            settings.database.path.display()
        )
    })?;
    let mut conn = pool.get()?;

    match cli.command {
        Command::Process { file, batch_size } => {
            let mut options = IngestOptions::from(&settings.ingest);
            if let Some(batch_size) = batch_size {
                if batch_size == 0 {
                    bail!("--batch-size must be at least 1");
                }
                options = options.with_batch_size(batch_size);
            }
            let result = Ingestor::new(&mut conn, options).ingest_file(&file)?;
            println!("{}", result);
            for sample in &result.malformed_samples {
                println!("  line {}: {}", sample.line_number, sample.kind);
            }
        }
        Command::Report { report } => print_report(&conn, report)?,
        Command::Tail {
            file,
            interval,
            from_start,
            once,
        } => {
            let mut tail = settings.tail.clone();
            if let Some(interval) = interval {
                tail.interval_secs = interval.max(1);
            }
            tail.from_start |= from_start;
            let mut tailer = Tailer::new(&mut conn, &file, IngestOptions::from(&settings.ingest), tail);
            if once {
                match tailer.poll_once()? {
                    PollOutcome::Ingested { result, .. } => println!("{}", result),
                    PollOutcome::Unchanged { offset } => println!("no new lines past byte {}", offset),
                    PollOutcome::Missing => println!("{} does not exist yet", file.display()),
                }
            } else {
                // no stop is ever requested here: the loop runs until the
                // process is interrupted, each poll's offset is already stored
                let (_handle, signal) = stop_signal();
                info!(path = %file.display(), "tailing");
                tailer.run(&signal)?;
            }
        }
        Command::Cleanup { days } => {
            let cutoff = chrono::Local::now().naive_local() - chrono::Duration::days(days.into());
            let deleted = reports::cleanup_before(&mut conn, cutoff)?;
            println!("deleted {} records older than {}", deleted, cutoff.format("%Y-%m-%d %H:%M:%S"));
        }
    }
    Ok(())
}

fn print_report(conn: &rusqlite::Connection, report: Report) -> Result<()> {
    match report {
        Report::TopIps { n } => {
            println!("{:<40} {:>10}", "address", "requests");
            for row in reports::top_addresses(conn, n)? {
                println!("{:<40} {:>10}", row.key, row.count);
            }
        }
        Report::TopPaths { n } => {
            println!("{:<60} {:>10}", "path", "requests");
            for row in reports::top_paths(conn, n)? {
                println!("{:<60} {:>10}", row.key, row.count);
            }
        }
        Report::StatusCodes => {
            println!("{:<8} {:>10} {:>8}", "status", "requests", "share");
            for row in reports::status_distribution(conn)? {
                println!(
                    "{:<8} {:>10} {:>7.2}%",
                    row.status_code, row.count, row.percentage
                );
            }
        }
        Report::Hourly => {
            println!("{:<6} {:>10}", "hour", "requests");
            for row in reports::hourly_traffic(conn)? {
                println!("{:<6} {:>10}", format!("{:02}:00", row.hour), row.count);
            }
        }
        Report::ByOs => {
            println!("{:<20} {:>10}", "os", "requests");
            for row in reports::traffic_by_os(conn)? {
                println!("{:<20} {:>10}", row.key, row.count);
            }
        }
        Report::Errors { date } => {
            for row in reports::error_records_on(conn, date)? {
                println!(
                    "{} {:<40} {} {} {}",
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    row.client_address,
                    row.status_code,
                    row.path,
                    row.useragent
                );
            }
        }
        Report::Stats => {
            let stats = reports::store_stats(conn)?;
            let when = |ts: Option<chrono::NaiveDateTime>| {
                ts.map_or_else(|| "-".to_owned(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            };
            println!("{:<20} {}", "records", stats.total_records);
            println!("{:<20} {}", "user agents", stats.total_user_agents);
            println!("{:<20} {}", "unique addresses", stats.unique_addresses);
            println!("{:<20} {}", "earliest", when(stats.earliest));
            println!("{:<20} {}", "latest", when(stats.latest));
        }
    }
    Ok(())
}
