// UI layer: the terminal side of a transfer. Missing targets are prompted
// for with `dialoguer`, the user confirms before anything is changed, and
// a spinner runs while the network calls are in flight.

use crate::api::{DriveClient, Permission};
use crate::auth::SessionProvider;
use crate::config::{Settings, Target};
use crate::error::TransferError;
use crate::transfer::OwnershipTransfer;
use anyhow::{Context, Result};
use dialoguer::{Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Run one ownership transfer end to end: resolve the target, authorize,
/// confirm, transfer, report.
pub fn run(settings: &Settings, target: Target) -> Result<()> {
    let file_id = match target.file_id {
        Some(id) => id,
        None => prompt_non_empty("File ID")?,
    };
    let recipient = match target.recipient {
        Some(email) => email,
        None => prompt_non_empty("New owner email")?,
    };

    if !settings.assume_yes && !confirm_transfer(&file_id, &recipient)? {
        println!("Aborted, nothing was changed.");
        return Ok(());
    }

    let provider = SessionProvider::new(
        settings.credentials_path.clone(),
        settings.token_path.clone(),
        settings.timeout,
    )?;
    println!("Authorizing with Google...");
    let session = provider.authorize().context("Authorization failed")?;

    let client = DriveClient::new(&settings.api_url, session.access_token(), settings.timeout)?;
    let transfer = OwnershipTransfer::with_options(client, settings.transfer.clone());

    // Step logs and a spinner would redraw over each other on stderr.
    let spinner = if settings.show_progress {
        spinner(&format!("Transferring {} to {}...", file_id, recipient))?
    } else {
        ProgressBar::hidden()
    };
    let result = transfer.transfer_ownership(&file_id, &recipient);
    spinner.finish_and_clear();

    match result {
        Ok(permission) => {
            print_success(&recipient, &permission);
            Ok(())
        }
        Err(e) => {
            if let Some(note) = pending_grant_note(&e, settings.transfer.revoke_on_failure, &file_id, &recipient) {
                println!("{}", note);
            }
            // Reported once, by `main`, with the full cause chain.
            Err(transfer_failure(e))
        }
    }
}

fn transfer_failure(e: TransferError) -> anyhow::Error {
    let step = e.step();
    anyhow::Error::new(e).context(format!("Error transferring ownership ({} step)", step))
}

fn pending_grant_note(e: &TransferError, revoked: bool, file_id: &str, recipient: &str) -> Option<String> {
    if !e.left_pending_grant() || revoked {
        return None;
    }
    Some(format!(
        "Note: {} still holds writer access with a pending ownership request on {}.",
        recipient, file_id
    ))
}

/// `Input::interact_text()` re-asks until the validator accepts.
fn prompt_non_empty(prompt: &str) -> Result<String> {
    let value: String = Input::new()
        .with_prompt(prompt)
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("a value is required")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    Ok(value.trim().to_string())
}

fn confirm_transfer(file_id: &str, recipient: &str) -> Result<bool> {
    let answer = Confirm::new()
        .with_prompt(format!(
            "Transfer ownership of {} to {}? You will lose ownership of the file.",
            file_id, recipient
        ))
        .default(false)
        .interact()?;
    Ok(answer)
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

fn print_success(recipient: &str, permission: &Permission) {
    let owner = permission.email_address.as_deref().unwrap_or(recipient);
    println!("Ownership transferred to {} successfully!", owner);
    println!("Permission ID: {}", permission.id);
}
