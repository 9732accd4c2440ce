//! OCR Relay CLI - recognize a document image through Gemini.
//!
//! Run `ocr-relay --help` for usage information.

use anyhow::{Context, Result};
use console::style;
use ocr_relay::gemini::mime_from_path;
use ocr_relay::{Args, Config, ErrorBody, ImagePayload, Recognizer, StoreConfig};
use std::io::Read;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse_args();

    // Setup logging
    setup_logging(&args);

    // Load configuration
    let config = match Config::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            report_failure(&args, &ErrorBody::from(&e));
            std::process::exit(1);
        }
    };

    // Dry run mode
    if args.dry_run {
        eprintln!("\n{}", style("DRY RUN MODE").yellow().bold());
        eprintln!("Configuration validated successfully.\n");
        print_config_summary(&config);
        return Ok(());
    }

    if args.verbose && !args.json_logs {
        print_config_summary(&config);
    }

    let payload = match read_payload(&args) {
        Ok(p) => p,
        Err(e) => {
            error!("Input error: {:#}", e);
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };

    let recognizer = match Recognizer::new(config) {
        Ok(r) => r,
        Err(e) => {
            error!("Setup error: {}", e);
            report_failure(&args, &ErrorBody::from(&e));
            std::process::exit(1);
        }
    };

    info!(
        input = %args.input.display(),
        mime_type = %payload.mime_type,
        "Starting recognition"
    );

    match recognizer.recognize_payload(&payload).await {
        Ok(recognition) => {
            if args.json_logs {
                println!("{}", serde_json::to_string(&recognition)?);
            } else {
                println!("{}", recognition.text);
            }
            Ok(())
        }
        Err(e) => {
            report_failure(&args, &ErrorBody::from(&e));
            std::process::exit(1);
        }
    }
}

/// Read the input as raw image bytes, or as base64 text with `--encoded`.
fn read_payload(args: &Args) -> Result<ImagePayload> {
    let from_stdin = args.input.as_os_str() == "-";
    let bytes = if from_stdin {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        std::fs::read(&args.input)
            .with_context(|| format!("failed to read {}", args.input.display()))?
    };

    let payload = if args.encoded {
        let text = String::from_utf8(bytes).context("encoded input is not UTF-8")?;
        ImagePayload::parse(&text)?
    } else {
        ImagePayload::from_bytes(&bytes, mime_from_path(&args.input))?
    };
    Ok(payload)
}

fn report_failure(args: &Args, body: &ErrorBody) {
    if args.json_logs {
        println!(
            "{}",
            serde_json::to_string(body).unwrap_or_else(|_| body.error.clone())
        );
        return;
    }

    eprintln!("{} {}", style("Error:").red().bold(), body.error);
    if let Some(details) = &body.details {
        eprintln!("{} {}", style("Details:").yellow().bold(), details);
    }
}

fn setup_logging(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ocr_relay={level}")));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .init();
    }
}

fn print_config_summary(config: &Config) {
    let keys = ocr_relay::KeyPool::parse(config.api_keys.as_deref())
        .map(|p| p.size())
        .unwrap_or(0);
    let store = match &config.store {
        Some(StoreConfig::Memory) => "memory".to_string(),
        Some(StoreConfig::File { path }) => format!("file ({})", path.display()),
        Some(StoreConfig::Kv { url, .. }) => format!("kv ({url})"),
        None => "none".to_string(),
    };

    eprintln!("{}", style("Configuration:").bold());
    eprintln!("  Version:     v{}", ocr_relay::VERSION);
    eprintln!("  API keys:    {keys}");
    eprintln!("  Index store: {store}");
    eprintln!("  Model:       {}", config.upstream.model);
    eprintln!("  Base URL:    {}", config.upstream.base_url);
    eprintln!("  Temperature: {}", config.upstream.temperature);
    eprintln!("  Timeout:     {:?}", config.upstream.timeout);
    eprintln!();
}
