use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use bulk_ingest::cancel::CancelToken;
use bulk_ingest::config::{LoadOptions, WriterKind};
use bulk_ingest::observability::StdErrObserver;
use bulk_ingest::parser::Source;
use bulk_ingest::pipeline::Loader;
use bulk_ingest::queue::{QueueHandle, RingQueue};
use bulk_ingest::types::{Column, DataType, Schema};
use bulk_ingest::writer::{
    ConsumerConfig, ConsumerReport, CsvFileStorage, ParallelWriter, WriterStrategy, local_writer, run_consumer,
};

#[derive(Parser, Debug)]
#[command(name = "bulkload", version, about = "Bulk-load delimited or fixed-width files into a table", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an input file into a CSV output table.
    Load {
        /// Input file, or `-` for stdin.
        #[arg(long, default_value = "-")]
        input: String,

        /// Target column as NAME:TYPE or NAME:TYPE:notnull, in table order.
        #[arg(long = "column", required = true)]
        columns: Vec<String>,

        /// Load option as KEY=VALUE (repeatable). Applied after the control file.
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,

        /// Control file with one KEY = VALUE per line; lines starting with `#` are comments.
        #[arg(long)]
        control: Option<PathBuf>,

        /// CSV file receiving the loaded rows.
        #[arg(long)]
        output: PathBuf,
    },

    /// Consumer side of a parallel load. Started by `load`, not by hand.
    #[command(hide = true)]
    Consume {
        #[arg(long)]
        queue: QueueHandle,

        /// Consumer configuration as JSON.
        #[arg(long)]
        config: String,

        #[arg(long)]
        queue_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    match Cli::parse().command {
        Command::Load {
            input,
            columns,
            options,
            control,
            output,
        } => load(&input, &columns, &options, control.as_deref(), output),
        Command::Consume {
            queue,
            config,
            queue_dir,
        } => consume(queue, &config, queue_dir.as_deref()),
    }
}

fn load(input: &str, columns: &[String], pairs: &[String], control: Option<&Path>, output: PathBuf) -> Result<()> {
    let mut settings = Vec::new();
    if let Some(path) = control {
        let text = fs::read_to_string(path).with_context(|| format!("reading control file {}", path.display()))?;
        settings.extend(parse_control(&text)?);
    }
    for pair in pairs {
        settings.push(split_pair(pair, '=')?);
    }
    let options = LoadOptions::from_pairs(settings)?;
    let schema = Schema::new(columns.iter().map(|c| parse_column(c)).collect::<Result<Vec<_>>>()?);

    let source = if input == "-" {
        Source::stdin()
    } else {
        Source::from_path(input)?
    };
    let cancel = CancelToken::new();
    forward_signals(&cancel)?;

    let mut writer: Box<dyn WriterStrategy + Send> = match options.writer {
        WriterKind::Parallel => {
            let config = ConsumerConfig::from_options(&options, &output);
            let program = std::env::current_exe().context("locating the bulkload executable")?;
            Box::new(ParallelWriter::with_process(&options, &cancel, &program, &config)?)
        }
        _ => local_writer(&options, Box::new(CsvFileStorage::open(&output)?))?,
    };

    let loader = Loader::new(options, schema)
        .with_observer(Arc::new(StdErrObserver))
        .with_cancel_token(cancel)
        .with_input_name(input);
    match loader.run(source, writer.as_mut()) {
        Ok(summary) => {
            println!("{summary}");
            Ok(())
        }
        Err(failure) => {
            println!("{}", failure.summary);
            Err(failure.error.into())
        }
    }
}

fn consume(handle: QueueHandle, config: &str, queue_dir: Option<&Path>) -> Result<()> {
    // the producer sees the same Ctrl-C and stops this side with the abort marker
    ignore_interrupts();
    let config: ConsumerConfig = serde_json::from_str(config).context("parsing consumer configuration")?;
    let report = consume_queue(handle, &config, queue_dir);

    // The producer reads this line from our stdout.
    println!("{}", report.to_json()?);
    match report.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn consume_queue(handle: QueueHandle, config: &ConsumerConfig, queue_dir: Option<&Path>) -> ConsumerReport {
    let cancel = CancelToken::new();
    let opened = match queue_dir {
        Some(dir) => RingQueue::open_in(dir, handle, cancel),
        None => RingQueue::open(handle, cancel),
    };
    let mut queue = match opened {
        Ok(queue) => queue,
        Err(err) => return ConsumerReport::failed(err.into()),
    };
    let report = match config.build_writer() {
        Ok(mut writer) => run_consumer(&mut queue, writer.as_mut()),
        Err(err) => ConsumerReport::failed(err),
    };
    let _ = queue.close();
    report
}

/// `KEY = VALUE` lines. Blank lines and lines starting with `#` are ignored; a value may be
/// wrapped in single or double quotes to keep its surrounding spaces.
fn parse_control(text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = split_pair(line, '=').with_context(|| format!("control file line {}", idx + 1))?;
        pairs.push((key, unquote(&value).to_string()));
    }
    Ok(pairs)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}

#[cfg(unix)]
fn ignore_interrupts() {
    // SAFETY: installs the ignore disposition, no handler code runs.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_interrupts() {}

#[cfg(unix)]
static SIGNALLED: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
extern "C" fn record_signal(signal: libc::c_int) {
    SIGNALLED.store(signal, Ordering::SeqCst);
}

/// Turn SIGINT into a cancel and SIGTERM into a shutdown of `cancel`.
#[cfg(unix)]
fn forward_signals(cancel: &CancelToken) -> Result<()> {
    let handler = record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
    let cancel = cancel.clone();
    thread::Builder::new()
        .name("bulkload-signals".to_string())
        .spawn(move || {
            loop {
                match SIGNALLED.load(Ordering::SeqCst) {
                    0 => thread::sleep(Duration::from_millis(50)),
                    libc::SIGTERM => {
                        log::warn!("terminated; shutting the load down");
                        cancel.shutdown();
                        return;
                    }
                    _ => {
                        log::warn!("interrupted; cancelling the load");
                        cancel.cancel();
                        return;
                    }
                }
            }
        })
        .context("starting the signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
fn forward_signals(_cancel: &CancelToken) -> Result<()> {
    Ok(())
}

fn split_pair(text: &str, sep: char) -> Result<(String, String)> {
    let (key, value) = text
        .split_once(sep)
        .ok_or_else(|| anyhow!("expected KEY{sep}VALUE, got \"{text}\""))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn parse_column(spec: &str) -> Result<Column> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default().trim();
    let type_name = parts.next().unwrap_or_default().trim();
    if name.is_empty() || type_name.is_empty() {
        bail!("column must be NAME:TYPE[:notnull], got \"{spec}\"");
    }
    let data_type = DataType::from_name(type_name).ok_or_else(|| anyhow!("unknown column type \"{type_name}\""))?;
    let mut column = Column::new(name, data_type);
    match parts.next().map(str::trim) {
        None => {}
        Some(flag) if flag.eq_ignore_ascii_case("notnull") || flag.eq_ignore_ascii_case("not_null") => {
            column = column.not_null();
        }
        Some(other) => bail!("unknown column flag \"{other}\""),
    }
    Ok(column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_file_keeps_hash_values_and_strips_quotes() {
        let text = "# load settings\nDELIMITER = #\n  # indented comment\nNULL = \"  \"\nSKIP='1'\n\n";
        let pairs = parse_control(text).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("DELIMITER".to_string(), "#".to_string()),
                ("NULL".to_string(), "  ".to_string()),
                ("SKIP".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn control_file_line_without_equals_is_reported() {
        let err = parse_control("TYPE = CSV\nSKIP 1\n").unwrap_err();
        assert!(format!("{err:#}").contains("control file line 2"));
    }

    #[test]
    fn column_specs_parse_type_and_flag() {
        let column = parse_column("id:integer:notnull").unwrap();
        assert_eq!(column.name, "id");
        assert!(column.not_null);
        assert!(parse_column("id").is_err());
    }
}
