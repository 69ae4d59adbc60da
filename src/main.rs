use anyhow::{Context, Result};
use calltrace::cli::{Cli, Command, OutputFormat};
use calltrace::classifier::Classifier;
use calltrace::filter::fully_qualified;
use calltrace::{decode_frame, decode_stream, output, Frame, LogLevel};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
///
/// Without `--debug`, `CALLTRACE_LOGLEVEL` picks the verbosity.
fn init_tracing(debug: bool) {
    let level = if debug {
        LevelFilter::TRACE
    } else {
        std::env::var("CALLTRACE_LOGLEVEL")
            .ok()
            .and_then(|v| v.parse::<LogLevel>().ok())
            .unwrap_or_default()
            .level_filter()
    };
    if level != LevelFilter::OFF {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Split `Path#method` (or `Path.method`) into its parts
fn split_name(name: &str) -> (&str, &str) {
    name.rsplit_once('#')
        .or_else(|| name.rsplit_once('.'))
        .unwrap_or((name, ""))
}

fn run_classify(rules: Option<PathBuf>, libraries: Vec<String>, names: Vec<String>) -> Result<()> {
    let classifier = Classifier::default();
    if let Some(path) = rules {
        let file = File::open(&path)
            .with_context(|| format!("Failed to open rules file {}", path.display()))?;
        classifier
            .load_rules(BufReader::new(file))
            .with_context(|| format!("Failed to load rules from {}", path.display()))?;
    }
    classifier.register_libraries(&libraries);

    for name in &names {
        let (path, method) = split_name(name);
        println!(
            "{}\t{}\t{}",
            fully_qualified(path, method),
            classifier.classify(path, method),
            classifier.source_of(path, method)
        );
    }
    Ok(())
}

/// Read a capture, accepting either raw wire bytes or a hex dump
fn read_capture(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text: String = match std::str::from_utf8(&bytes) {
        Ok(text) => text.split_whitespace().collect(),
        Err(_) => return Ok(bytes),
    };
    if !text.is_empty() && text.len() % 2 == 0 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(&text).context("Failed to decode hex capture");
    }
    Ok(bytes)
}

fn print_frames(frames: &[Frame], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for frame in frames {
                print!("{}", output::render_text(frame));
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                output::render_json(frames).context("Failed to serialize frames")?
            );
        }
    }
    Ok(())
}

fn run_decode(file: &Path, format: OutputFormat) -> Result<()> {
    let bytes = read_capture(file)?;
    let frames = decode_stream(&bytes)
        .with_context(|| format!("Failed to decode {}", file.display()))?;
    print_frames(&frames, format)
}

fn run_listen(host: &str, port: u16, count: Option<usize>, format: OutputFormat) -> Result<()> {
    let socket = UdpSocket::bind((host, port))
        .with_context(|| format!("Failed to bind udp://{}:{}", host, port))?;
    eprintln!("listening on udp://{}", socket.local_addr()?);

    let mut buf = vec![0u8; 65536];
    let mut received = 0usize;
    while count.map_or(true, |limit| received < limit) {
        let n = socket.recv(&mut buf).context("Failed to receive datagram")?;
        received += 1;
        match decode_frame(&buf[..n]) {
            Ok((frame, _)) => print_frames(std::slice::from_ref(&frame), format)?,
            Err(e) => eprintln!("undecodable datagram ({} bytes): {}", n, e),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Classify {
            rules,
            libraries,
            names,
        } => run_classify(rules, libraries, names),
        Command::Decode { file, format } => run_decode(&file, format),
        Command::Listen {
            host,
            port,
            count,
            format,
        } => run_listen(&host, port, count, format),
    }
}
