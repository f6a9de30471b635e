// Runtime settings. Everything here comes from command-line flags or the
// environment (see `main.rs`); nothing about the target file or recipient
// is compiled in.

use crate::transfer::TransferOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the OAuth client download.
pub const DEFAULT_CREDENTIALS_FILE: &str = "credentials.json";

const APP_DIR: &str = "drive-transfer";
const TOKEN_FILE: &str = "token.json";

/// Token cache under the user's config directory, e.g.
/// `~/.config/drive-transfer/token.json`. Falls back to the working
/// directory when the platform reports no config directory.
pub fn default_token_path() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join(APP_DIR).join(TOKEN_FILE),
        None => PathBuf::from(TOKEN_FILE),
    }
}

/// Console log level for the number of `-v` flags. Step logs stay off by
/// default so they never draw over the spinner.
pub fn console_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// The spinner is only shown while step logs are off.
pub fn show_progress(verbose: u8) -> bool {
    verbose == 0
}

/// What to transfer and to whom. Either may be missing, in which case the
/// terminal flow asks for it.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub file_id: Option<String>,
    pub recipient: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: String,
    pub credentials_path: PathBuf,
    pub token_path: PathBuf,
    pub timeout: Duration,
    pub transfer: TransferOptions,
    /// Skip the confirmation prompt.
    pub assume_yes: bool,
    /// Show a spinner while the transfer runs. Off when step logs are
    /// printed to the console.
    pub show_progress: bool,
}
