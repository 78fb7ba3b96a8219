use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use undock::{
    cancel::cancel_on_signals, config, CancelToken, Extractor, ImageExtractor, Includes, Platform,
    Source, UndockError,
};

/// Extract the filesystem of a container image to a directory.
///
/// SOURCE is an image reference, like `alpine:latest`, or a location
/// with a transport prefix: `docker://`, `docker-daemon://`,
/// `docker-archive://`, `oci://`, `oci-archive://`.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Log level.
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Include the source file and line in logs.
    #[arg(long, env = "LOG_CALLER")]
    log_caller: bool,

    /// Disable colors in logs.
    #[arg(long, env = "LOG_NOCOLOR")]
    log_nocolor: bool,

    /// Directory to cache images.
    #[arg(long, env = "UNDOCK_CACHE_DIR")]
    cachedir: Option<PathBuf>,

    /// Platform to extract, like `linux/arm64/v8`. Defaults to the host
    /// platform.
    #[arg(long)]
    platform: Option<String>,

    /// Extract all platforms of a multi-platform image.
    #[arg(long)]
    all: bool,

    /// Extract only these paths. Can be repeated.
    #[arg(long = "include", value_name = "PATH")]
    includes: Vec<String>,

    /// Skip TLS certificate verification, and fall back to plain HTTP
    /// if the registry does not accept TLS connections.
    #[arg(long)]
    insecure: bool,

    /// Remove the destination directory before extracting.
    #[arg(long)]
    rm_dist: bool,

    /// Write all platforms to the destination directory, instead of a
    /// subdirectory for every platform.
    #[arg(long)]
    wrap: bool,

    /// Restrict filesystem access with Landlock while extracting.
    #[arg(long)]
    sandbox: bool,

    /// Image to extract.
    source: String,

    /// Destination directory.
    dist: PathBuf,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn init_logs(args: &Args) {
    let filter = EnvFilter::new(format!("undock={}", args.log_level.as_str()));
    let color = !args.log_nocolor && std::env::var_os("NO_COLOR").is_none();

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(args.log_caller)
        .with_line_number(args.log_caller)
        .with_ansi(color);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .init();
    }
}

fn build_extractor(args: Args) -> Result<Extractor, UndockError> {
    let source = Source::parse(&args.source)?;
    let cache_dir = config::cache_dir(args.cachedir.as_deref())?;

    let platform = match &args.platform {
        Some(platform) => platform.parse()?,
        None => Platform::host(),
    };

    let extractor = ImageExtractor::new(source, args.dist, cache_dir)
        .platform(platform)
        .all(args.all)
        .includes(Includes::new(&args.includes))
        .insecure(args.insecure)
        .rm_dist(args.rm_dist)
        .wrap(args.wrap)
        .sandbox(args.sandbox);

    tracing::debug!(
        source = extractor.source().raw(),
        transport = %extractor.source().transport_name(),
        "Parsed image source"
    );

    Ok(Extractor::from(extractor))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logs(&args);

    let token = CancelToken::new();

    // Signals must be blocked before any other thread is started.
    if let Err(e) = cancel_on_signals(&token) {
        tracing::error!("Cannot watch signals: {e}");
        return ExitCode::FAILURE;
    }

    let result = build_extractor(args).and_then(|extractor| {
        tracing::debug!(kind = extractor.kind(), "Starting extractor");
        extractor.extract(&token)
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,

        Err(e) if e.is_cancelled() => {
            tracing::warn!("Extraction cancelled");
            ExitCode::from(130)
        }

        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[test]
fn parse_args() {
    use clap::CommandFactory;

    Args::command().debug_assert();

    let args = Args::try_parse_from([
        "undock",
        "--platform",
        "linux/arm64",
        "--include",
        "/etc",
        "--include",
        "usr/bin",
        "--wrap",
        "alpine",
        "out",
    ])
    .unwrap();

    assert_eq!(args.includes, ["/etc", "usr/bin"]);
    assert!(args.wrap && !args.all);
    assert_eq!(args.dist, PathBuf::from("out"));
}
