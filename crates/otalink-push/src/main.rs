use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otalink_proto::wire::DEFAULT_PORT;
use otalink_push::{PushConfig, push_update};

/// Push a project directory to an OTA update device.
#[derive(Parser, Debug)]
#[command(name = "otalink-push", version, about)]
struct Args {
    /// Device address or hostname.
    #[arg(long)]
    host: String,

    /// Device update port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Project directory to upload.
    #[arg(long, default_value = "./src")]
    src: PathBuf,

    /// Device password. Prompted for interactively when omitted.
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("otalink_push=info,otalink_proto=info")),
        )
        .init();

    let args = Args::parse();
    let password = match args.password {
        Some(password) => password,
        None => rpassword::prompt_password("Device password: ")?,
    };

    let config = PushConfig {
        host: args.host,
        port: args.port,
        src: args.src,
        password,
    };

    // Log every 64 KiB so large payloads show signs of life.
    let mut last_logged: u64 = 0;
    let progress = Box::new(move |sent: u64| {
        if sent - last_logged >= 64 * 1024 {
            last_logged = sent;
            info!(sent, "uploading");
        }
    });

    let report = push_update(&config, Some(progress)).await?;
    info!(
        files = report.files,
        uncompressed = report.uncompressed,
        compressed = report.compressed,
        "update applied, device is rebooting"
    );
    Ok(())
}
