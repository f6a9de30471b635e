// Library root
// -----------
// This crate exposes the pieces behind the `drive-transfer` binary, which
// hands ownership of a Google Drive file to another user.
//
// Module responsibilities:
// - `transfer`: the grant / lookup / promotion sequence.
// - `api`: permission types, the `PermissionStore` trait and the Drive v3
//   HTTP client implementing it.
// - `auth`: OAuth sign-in and the token cache.
// - `config`: runtime settings and default paths.
// - `error`: typed errors of the store and the transfer.
// - `ui`: prompts, confirmation and output for the terminal.
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod transfer;
pub mod ui;

pub use api::{DriveClient, Permission, PermissionStore};
pub use error::{LookupError, StoreError, TransferError};
pub use transfer::{OwnershipTransfer, TransferOptions};
