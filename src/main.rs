// Entrypoint for the CLI application.
// - Keeps `main` small: parse flags, set up logging, hand off to the UI flow.
// - Returns `anyhow::Result` so any failure exits non-zero with its message.

use clap::Parser;
use drive_transfer::api::DEFAULT_API_URL;
use drive_transfer::config::{
    console_log_level, default_token_path, show_progress, Settings, Target, DEFAULT_CREDENTIALS_FILE,
};
use drive_transfer::{ui, TransferOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Transfer ownership of a Google Drive file to another user.
#[derive(Parser, Debug)]
#[command(name = "drive-transfer")]
#[command(version)]
struct Cli {
    /// ID of the file to transfer (prompted for when omitted)
    #[arg(long, env = "DRIVE_TRANSFER_FILE_ID")]
    file_id: Option<String>,

    /// Email of the new owner (prompted for when omitted)
    #[arg(long = "to", env = "DRIVE_TRANSFER_RECIPIENT")]
    recipient: Option<String>,

    /// OAuth client credentials downloaded from the Cloud console
    #[arg(long, env = "DRIVE_TRANSFER_CREDENTIALS", default_value = DEFAULT_CREDENTIALS_FILE)]
    credentials: PathBuf,

    /// Token cache path [default: <config dir>/drive-transfer/token.json]
    #[arg(long, env = "DRIVE_TRANSFER_TOKEN")]
    token: Option<PathBuf>,

    /// Drive API base URL
    #[arg(long, env = "DRIVE_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Extra permission lookups when the new grant is not visible yet
    #[arg(long, default_value_t = 0)]
    lookup_retries: u32,

    /// Delay before the first lookup retry, doubled on each retry
    #[arg(long, default_value_t = 500)]
    lookup_backoff_ms: u64,

    /// Remove the pending-owner grant again if the transfer fails after it
    #[arg(long)]
    revoke_on_failure: bool,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Log transfer steps (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = console_log_level(verbose);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("drive_transfer={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings {
        api_url: cli.api_url,
        credentials_path: cli.credentials,
        token_path: cli.token.unwrap_or_else(default_token_path),
        timeout: Duration::from_secs(cli.timeout_secs),
        transfer: TransferOptions {
            lookup_retries: cli.lookup_retries,
            lookup_backoff: Duration::from_millis(cli.lookup_backoff_ms),
            revoke_on_failure: cli.revoke_on_failure,
        },
        assume_yes: cli.yes,
        show_progress: show_progress(cli.verbose),
    };
    let target = Target {
        file_id: cli.file_id,
        recipient: cli.recipient,
    };

    ui::run(&settings, target)
}
