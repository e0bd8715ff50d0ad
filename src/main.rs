//! Stream a raw audio file to a recognition session and print the responses

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use futures_util::stream;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use speech_stream::config::{credentials_from_env, default_settings_path, load_settings};
use speech_stream::streaming::MediaError;
use speech_stream::{MediaConfig, ResponseTypes, StreamingClient};

#[derive(Parser, Debug)]
#[command(name = "speech-stream", about = "Stream raw audio to a speech recognition session")]
struct Args {
    /// Raw audio file (16 kHz mono S16LE unless overridden)
    media_path: PathBuf,

    /// WebSocket URL of the session
    #[arg(long)]
    url: String,

    /// Also request captions
    #[arg(long)]
    captions: bool,

    /// Length of each audio chunk in milliseconds
    #[arg(long, default_value_t = 100)]
    chunk_ms: u64,

    #[arg(long, default_value_t = 16000)]
    sample_rate: u32,

    /// Do not reconnect after a dropped connection
    #[arg(long)]
    single_connection: bool,

    /// Settings file (defaults to ~/.config/speech-stream/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Read `path` in chunks of `chunk_size` bytes, paced like a live source
fn file_chunks(
    path: PathBuf,
    chunk_size: usize,
    pace: Duration,
) -> impl futures_util::Stream<Item = Result<Vec<u8>, MediaError>> + Send {
    stream::unfold(None, move |file: Option<tokio::fs::File>| {
        let path = path.clone();
        async move {
            let mut file = match file {
                Some(f) => f,
                None => match tokio::fs::File::open(&path).await {
                    Ok(f) => f,
                    Err(e) => return Some((Err(MediaError::from(e)), None)),
                },
            };

            let mut buf = vec![0u8; chunk_size];
            let mut filled = 0;
            while filled < chunk_size {
                match file.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => return Some((Err(MediaError::from(e)), None)),
                }
            }
            if filled == 0 {
                return None;
            }
            buf.truncate(filled);

            tokio::time::sleep(pace).await;
            Some((Ok(buf), Some(file)))
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let mut settings = match args.config.clone().or_else(default_settings_path) {
        Some(path) => load_settings(&path),
        None => Default::default(),
    };
    settings.apply_env_overrides();
    if args.single_connection {
        settings.reconnect = false;
    }

    let credentials = credentials_from_env().ok_or(
        "set SPEECH_STREAM_ACCESS_TOKEN or SPEECH_STREAM_API_KEY",
    )?;
    let client = StreamingClient::with_settings(credentials, settings)?;

    let media_config = MediaConfig {
        sample_rate: args.sample_rate,
        ..Default::default()
    };
    let chunk_size = (media_config.bytes_per_second() * args.chunk_ms as usize / 1000).max(1);
    let media = file_chunks(
        args.media_path.clone(),
        chunk_size,
        Duration::from_millis(args.chunk_ms),
    );

    let mut response_types = ResponseTypes::TRANSCRIPT;
    if args.captions {
        response_types |= ResponseTypes::CAPTIONS;
    }

    log::info!(
        "Streaming {:?} in {} byte chunks",
        args.media_path,
        chunk_size
    );

    let mut responses = client
        .start_stream(&args.url, media, Some(media_config), response_types)
        .await?;

    while let Some(response) = responses.next().await {
        let response = response?;
        let kind = response
            .response_type()
            .map(|t| t.as_str())
            .unwrap_or("unknown");
        match response.best_transcript() {
            Some(text) if !text.is_empty() => println!("[{}] {}", kind, text),
            _ if response.is_end_of_stream() => println!("[{}] <end of stream>", kind),
            _ => {}
        }
    }

    log::info!(
        "Session finished after {} connection(s)",
        responses.connection_count()
    );
    Ok(())
}
