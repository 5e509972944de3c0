mod cookies;
mod download;
mod error;
mod options;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cookies::Session;
use crate::options::{clamp_chunk_size, Options};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// file id or share link of the video
    input: String,

    #[clap(short, long)]
    /// output file name, the video title is used when omitted
    output: Option<PathBuf>,

    #[clap(short, long = "chunk_size")]
    /// chunk size in bytes for direct downloads, 0 picks one from the file size
    chunk_size: Option<usize>,

    #[clap(short, long)]
    /// number of frames fetched in parallel
    threads: Option<usize>,

    #[clap(short, long)]
    /// retries per tile and per frame before giving up
    retries: Option<u32>,

    #[clap(long)]
    /// frame rate of a rebuilt video
    fps: Option<u32>,

    #[clap(long)]
    /// cookies exported from a signed-in browser (Netscape or JSON)
    cookies: Option<PathBuf>,

    #[clap(short, long)]
    /// log every request
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_options(args: &Args) -> anyhow::Result<Options> {
    let mut options = Options::from_env().context("invalid environment configuration")?;

    if let Some(threads) = args.threads {
        options.max_parallel_downloads = threads;
    }
    if let Some(retries) = args.retries {
        options.max_download_retries = retries;
    }
    if let Some(chunk_size) = args.chunk_size {
        options.chunk_size = (chunk_size > 0).then(|| clamp_chunk_size(chunk_size));
    }
    if let Some(fps) = args.fps {
        options.frame_rate = fps;
    }

    options.validate()?;
    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let options = build_options(&args)?;
    tracing::debug!(?options, "starting");

    let session = match &args.cookies {
        Some(path) => Session::from_cookie_file(path)
            .with_context(|| format!("cannot load cookies from {}", path.display()))?,
        None => Session::anonymous(),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight work");
            on_interrupt.cancel();
        }
    });

    match download::pipeline::download(&args.input, args.output.as_deref(), &options, session, &cancel).await {
        Ok(path) => {
            info!("finished downloading {}", path.display());
            Ok(())
        }
        Err(err) => {
            if let Some(hint) = err.resume_hint() {
                error!("{}", hint);
            }
            Err(err.into())
        }
    }
}
