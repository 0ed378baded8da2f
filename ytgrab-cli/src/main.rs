use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error};
use tracing_subscriber::EnvFilter;

mod cli;
mod render;
mod select;

use cli::CliArgs;
use render::Renderer;
use ytgrab_engine::{
    Catalog, DEFAULT_USER_AGENT, DirectExtractor, EventPayload, Extracted, ExternalHelper,
    ExtractorRegistry, HttpTransport, JobRunner, ProgressBus, PromptBroker, PromptResolution,
    TransportConfig,
};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let default_level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => exit(code),
        Err(err) => {
            error!(error = %err, "fatal");
            eprintln!("ytgrab: {err}");
            exit(1);
        }
    }
}

async fn run(args: CliArgs) -> anyhow::Result<i32> {
    let options = args.to_options().map_err(anyhow::Error::msg)?;

    let transport = HttpTransport::new(&TransportConfig {
        request_timeout: options.timeout,
        ..TransportConfig::default()
    })?;
    let extractors = Arc::new(
        ExtractorRegistry::new().register(Arc::new(DirectExtractor::new(transport.clone()))),
    );

    if args.list_formats {
        return list_formats(&extractors, &args).await;
    }

    let mut options = options;
    if args.select {
        let url = args
            .urls
            .first()
            .ok_or_else(|| anyhow::anyhow!("--select needs a URL"))?;
        let token = CancellationToken::new();
        match extractors.extract(url, &token).await? {
            Extracted::Single(descriptor) => {
                match select::choose_format(&descriptor.formats)? {
                    Some(format) => options.itag = Some(format.itag),
                    None => return Ok(0),
                }
            }
            Extracted::Playlist(_) => {
                anyhow::bail!("--select works on single videos, not playlists");
            }
        }
    }

    let catalog = match &args.catalog {
        Some(path) => Some(Catalog::open(path).await?),
        None => None,
    };

    let bus = ProgressBus::new();
    bus.spawn_reaper();
    let broker = PromptBroker::new(options.prompt_timeout);
    let helper = Arc::new(ExternalHelper::new(&args.ffmpeg));
    if !helper.is_available() {
        debug!(binary = %args.ffmpeg, "external helper unavailable; fallback strategies disabled");
    }

    let runner = JobRunner::new(
        bus.clone(),
        transport,
        extractors,
        broker.clone(),
        helper,
        catalog,
        DEFAULT_USER_AGENT,
    );

    let mut submitted = runner.submit(args.urls.clone(), options);
    let mut events = bus
        .subscribe(&submitted.job_id, 0)
        .expect("job just created");

    let interactive = !args.json;
    let mut renderer = if args.json {
        Renderer::Json
    } else {
        Renderer::Tty(Box::new(render::TtyRenderer::new()))
    };

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                renderer.handle(&event);
                if let EventPayload::Duplicate { prompt_id, filename, .. } = &event.payload
                    && interactive
                {
                    spawn_prompt_reader(&runner, prompt_id.clone(), filename.clone());
                }
                if event.payload.is_done() {
                    break;
                }
            }
            maybe_item = submitted.items.recv() => {
                if let Some(outcome) = maybe_item {
                    renderer.item(&outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if cancel_requested {
                    eprintln!("aborting");
                    return Ok(130);
                }
                cancel_requested = true;
                eprintln!("cancelling... (press ctrl-c again to abort)");
                runner.cancel(&submitted.job_id);
            }
        }
    }

    // Drain the remaining item records for JSON consumers.
    while let Ok(outcome) = submitted.items.try_recv() {
        renderer.item(&outcome);
    }

    let summary = submitted.done.await?;
    Ok(summary.exit_code)
}

async fn list_formats(extractors: &ExtractorRegistry, args: &CliArgs) -> anyhow::Result<i32> {
    let url = args
        .urls
        .first()
        .ok_or_else(|| anyhow::anyhow!("--list-formats needs a URL"))?;
    let token = CancellationToken::new();
    match extractors.extract(url, &token).await? {
        Extracted::Single(descriptor) => {
            println!("{}", select::table_header());
            for format in &descriptor.formats {
                println!("{}", select::format_row(format));
            }
            Ok(0)
        }
        Extracted::Playlist(playlist) => {
            println!("playlist `{}` with {} entries:", playlist.title, playlist.entries.len());
            for entry in &playlist.entries {
                println!("  {}", entry.url);
            }
            Ok(0)
        }
    }
}

/// Ask the operator about a duplicate on the terminal, off the event loop.
fn spawn_prompt_reader(runner: &JobRunner, prompt_id: String, filename: String) {
    let runner = runner.clone();
    tokio::spawn(async move {
        eprintln!("`{filename}` exists: [o]verwrite / [s]kip / [r]ename / new name?");
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        if reader.read_line(&mut line).await.is_err() {
            return;
        }
        let answer = line.trim();
        let resolution = match answer {
            "o" | "O" | "overwrite" => PromptResolution::Overwrite,
            "" | "s" | "S" | "skip" => PromptResolution::Skip,
            "r" | "R" | "rename" => PromptResolution::RenameAuto,
            other => PromptResolution::Rename {
                new_name: other.to_string(),
            },
        };
        if let Err(err) = runner.broker().resolve(&prompt_id, resolution) {
            debug!(error = %err, "prompt resolution not delivered");
        }
    });
}
