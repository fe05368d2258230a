//! Koda Render - command-line front end for the render pipeline
//!
//! Renders one artifact through the same cache and scheduler the web layer
//! uses and prints the poll response as JSON.
//!
//! ## Usage
//!
//! ```text
//! koda-render [--config <path>] [--timeout-ms <n>] [--async] <spectrogram|audio> <params>...
//! koda-render hash <file>
//! koda-render init-config [--config <path>]
//! ```
//!
//! `<params>` are `key=value` pairs or whole query strings:
//!
//! ```text
//! koda-render spectrogram "sourcePath=home/alice/rec.wav&channel=0&call=3&overview=0&contrast=4&hash=..&numcalls=40"
//! ```
//!
//! With `--async` the command does not block on the render; it prints the
//! pending response and then every progress change until the task finishes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use koda_core::audio::hash_file;
use koda_core::config::{default_config_path, load_config, save_config, RenderConfig};
use koda_core::request::parse_query_string;
use koda_core::segment::JsonCallMetadataStore;
use koda_core::services::{AwaitOutcome, TaskStatus};
use koda_core::{ArtifactKind, RenderService};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Command {
    Render {
        kind: ArtifactKind,
        params: HashMap<String, String>,
    },
    Hash(PathBuf),
    InitConfig,
}

struct Options {
    config_path: PathBuf,
    timeout: Option<Duration>,
    detach: bool,
    command: Command,
}

fn usage() -> &'static str {
    "usage: koda-render [--config <path>] [--timeout-ms <n>] [--async] <spectrogram|audio> <key=value|query>...\n       \
     koda-render hash <file>\n       \
     koda-render init-config [--config <path>]"
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut config_path = default_config_path();
    let mut timeout = None;
    let mut detach = false;
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = iter.next().context("--config needs a path")?.into();
            }
            "--timeout-ms" => {
                let ms: u64 = iter
                    .next()
                    .context("--timeout-ms needs a value")?
                    .parse()
                    .context("--timeout-ms must be a whole number")?;
                timeout = Some(Duration::from_millis(ms));
            }
            "--async" => detach = true,
            "-h" | "--help" => bail!("{}", usage()),
            _ => positional.push(arg.as_str()),
        }
    }

    let Some((&first, rest)) = positional.split_first() else {
        bail!("{}", usage());
    };

    let command = match first {
        "hash" => match rest {
            [file] => Command::Hash(PathBuf::from(file)),
            _ => bail!("{}", usage()),
        },
        "init-config" => Command::InitConfig,
        kind => {
            let kind: ArtifactKind = kind.parse().with_context(|| format!("unknown artifact kind '{}'", kind))?;
            let mut params = HashMap::new();
            for raw in rest {
                params.extend(parse_query_string(raw));
            }
            Command::Render { kind, params }
        }
    };

    Ok(Options {
        config_path,
        timeout,
        detach,
        command,
    })
}

fn main() -> Result<ExitCode> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = parse_args(&args)?;

    match options.command {
        Command::Hash(path) => {
            let hash = hash_file(&path).with_context(|| format!("Failed to hash {:?}", path))?;
            println!("{}", hash);
            Ok(ExitCode::SUCCESS)
        }
        Command::InitConfig => {
            if options.config_path.exists() {
                bail!("{:?} already exists", options.config_path);
            }
            save_config(&RenderConfig::default(), &options.config_path)?;
            println!("{}", options.config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Render { kind, params } => {
            let mut config: RenderConfig = load_config(&options.config_path);
            // A one-shot process exits before background prefetches could finish
            config.prefetch_ahead = 0;
            render(config, kind, &params, options.timeout, options.detach)
        }
    }
}

fn render(
    config: RenderConfig,
    kind: ArtifactKind,
    params: &HashMap<String, String>,
    timeout: Option<Duration>,
    detach: bool,
) -> Result<ExitCode> {
    let service = RenderService::spawn(config, Arc::new(JsonCallMetadataStore))
        .context("Failed to start render service")?;

    let wait = if detach { Some(Duration::ZERO) } else { timeout };
    let outcome = match service.request_query(kind, params, wait) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("Request rejected ({}): {}", e.kind(), e);
            print_json(&serde_json::json!({ "status": "error", "message": e.to_string() }))?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let handle = match outcome {
        AwaitOutcome::Ready(path) => {
            print_json(&serde_json::json!({ "status": "success", "progress": 100, "file_path": path }))?;
            return Ok(ExitCode::SUCCESS);
        }
        AwaitOutcome::Failed(failure) => {
            print_json(&serde_json::json!({ "status": "error", "message": failure.message }))?;
            return Ok(ExitCode::FAILURE);
        }
        AwaitOutcome::Pending(handle) => handle,
    };

    // Poll until the task finishes, printing every change
    let mut last = None;
    loop {
        let Some(state) = service.poll(handle.id) else {
            bail!("task {} disappeared", handle.id);
        };
        let snapshot = (state.status, state.progress);
        if last != Some(snapshot) {
            print_json(&state)?;
            last = Some(snapshot);
        }
        match state.status {
            TaskStatus::Success => return Ok(ExitCode::SUCCESS),
            TaskStatus::Error => return Ok(ExitCode::FAILURE),
            TaskStatus::Queued | TaskStatus::Processing => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("Failed to serialize response")?);
    Ok(())
}
