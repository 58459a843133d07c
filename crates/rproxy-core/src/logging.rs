//! `slog`-based logger construction, grounded on the teacher's standalone gateway logger: a
//! terminal drain optionally duplicated into a log file, filtered by `RUST_LOG` through
//! `slog-envlogger`, and made non-blocking with `slog-async`.

use chrono::Local;
use slog::{o, Drain as _, FilterLevel, Level, Logger, Never, OwnedKVList, Record};
use slog_async::{Async, OverflowStrategy};
use slog_term::{Decorator, FullFormat, PlainDecorator, TermDecorator};
use std::fs::OpenOptions;
use std::io;

const LOGGER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DEFAULT_CHAN_SIZE: usize = 128;

fn format_decorator(decorator: impl Decorator) -> FullFormat<impl Decorator> {
    FullFormat::new(decorator)
        .use_custom_timestamp(|output: &mut dyn io::Write| -> io::Result<()> {
            write!(output, "{}", Local::now().format(LOGGER_TIMESTAMP_FORMAT))
        })
        .build()
}

#[derive(Debug, Clone)]
enum OrDrain<D1: slog::Drain<Ok = (), Err = Never>, D2: slog::Drain<Ok = (), Err = Never>> {
    Duplicated(D1),
    TermOnly(D2),
}

impl<D1: slog::Drain<Ok = (), Err = Never>, D2: slog::Drain<Ok = (), Err = Never>> slog::Drain for OrDrain<D1, D2> {
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        match self {
            OrDrain::Duplicated(drain) => drain.log(record, values),
            OrDrain::TermOnly(drain) => drain.log(record, values),
        }
    }

    fn is_enabled(&self, level: Level) -> bool {
        match self {
            OrDrain::Duplicated(drain) => drain.is_enabled(level),
            OrDrain::TermOnly(drain) => drain.is_enabled(level),
        }
    }
}

/// Builds the process-wide root logger. `log_file` duplicates output into a plain-text file
/// alongside the colored terminal output; `RUST_LOG` is honored on top of a default `info` level.
pub fn init(log_file: Option<&str>) -> io::Result<Logger> {
    let term_fmt = format_decorator(TermDecorator::new().build());

    let drain = if let Some(path) = log_file {
        let outfile = OpenOptions::new().create(true).append(true).open(path)?;
        let file_fmt = format_decorator(PlainDecorator::new(outfile));
        OrDrain::Duplicated(slog::Duplicate(file_fmt, term_fmt).fuse())
    } else {
        OrDrain::TermOnly(term_fmt.fuse())
    };

    let env_drain = slog_envlogger::LogBuilder::new(drain)
        .filter(None, FilterLevel::Info)
        .parse(&std::env::var("RUST_LOG").unwrap_or_default())
        .build();

    let async_drain = Async::new(env_drain.fuse())
        .chan_size(DEFAULT_CHAN_SIZE)
        .overflow_strategy(OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Ok(Logger::root(async_drain, o!()))
}
