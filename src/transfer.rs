// Ownership transfer coordinator
// ------------------------------
// Drive will not hand a file to someone directly. The recipient first gets
// writer access flagged `pendingOwner`, then that permission is updated to
// `owner` with `transferOwnership=true`. This module runs the three calls
// (grant, lookup, promotion) in order and stops at the first failure.
//
// The operation is not transactional: a failure after the grant leaves the
// pending writer permission in place unless `revoke_on_failure` is set.

use crate::api::{NewPermission, Permission, PermissionStore, PermissionUpdate, Role, UpdateFlags, LIST_FIELDS};
use crate::error::{LookupError, TransferError};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Knobs for the opt-in recovery behaviour. The default does exactly one
/// lookup and never cleans up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Extra lookups after a "no access" result, for stores that are only
    /// eventually consistent.
    pub lookup_retries: u32,
    /// Wait before the first retry; doubled after each attempt.
    pub lookup_backoff: Duration,
    /// Delete the granted permission when lookup or promotion fails.
    pub revoke_on_failure: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            lookup_retries: 0,
            lookup_backoff: Duration::from_millis(500),
            revoke_on_failure: false,
        }
    }
}

/// Moves ownership of one resource to one recipient through a
/// `PermissionStore`.
pub struct OwnershipTransfer<S> {
    store: S,
    options: TransferOptions,
}

impl<S: PermissionStore> OwnershipTransfer<S> {
    pub fn new(store: S) -> Self {
        Self::with_options(store, TransferOptions::default())
    }

    pub fn with_options(store: S, options: TransferOptions) -> Self {
        OwnershipTransfer { store, options }
    }

    /// Run grant, lookup and promotion for `resource_id` and return the
    /// promoted permission (role `owner`).
    ///
    /// Running this twice for the same pair is not idempotent: the second
    /// grant may add another pending permission or be rejected by the store.
    pub fn transfer_ownership(&self, resource_id: &str, recipient: &str) -> Result<Permission, TransferError> {
        info!(resource_id, recipient, "starting ownership transfer");

        let granted = self.grant(resource_id, recipient)?;

        let result = self
            .find_permission_id(resource_id, recipient)
            .map_err(TransferError::Lookup)
            .and_then(|permission_id| self.promote(resource_id, &permission_id));

        match result {
            Ok(promoted) => {
                info!(resource_id, recipient, permission_id = %promoted.id, "ownership transferred");
                Ok(promoted)
            }
            Err(err) => {
                if self.options.revoke_on_failure {
                    self.revoke(resource_id, &granted.id);
                }
                Err(err)
            }
        }
    }

    fn grant(&self, resource_id: &str, recipient: &str) -> Result<Permission, TransferError> {
        info!(resource_id, recipient, "granting writer access with pending owner flag");
        let granted = self
            .store
            .create_permission(resource_id, &NewPermission::pending_owner(recipient))
            .map_err(|source| TransferError::Grant {
                recipient: recipient.to_string(),
                source,
            })?;
        info!(permission_id = %granted.id, "access granted");
        Ok(granted)
    }

    /// Id of the permission whose email equals `recipient` exactly.
    /// Only a missing record is retried; a store error ends the lookup.
    pub fn find_permission_id(&self, resource_id: &str, recipient: &str) -> Result<String, LookupError> {
        let mut backoff = self.options.lookup_backoff;
        let mut attempt = 0;
        loop {
            let permissions = self
                .store
                .list_permissions(resource_id, LIST_FIELDS)
                .map_err(LookupError::Store)?;

            if let Some(found) = permissions.into_iter().find(|p| p.is_for(recipient)) {
                info!(permission_id = %found.id, "permission found");
                return Ok(found.id);
            }

            if attempt >= self.options.lookup_retries {
                return Err(LookupError::NoAccess {
                    recipient: recipient.to_string(),
                    resource_id: resource_id.to_string(),
                });
            }
            attempt += 1;
            warn!(
                resource_id,
                recipient,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "recipient permission not visible yet, retrying lookup"
            );
            thread::sleep(backoff);
            backoff = backoff.saturating_mul(2);
        }
    }

    fn promote(&self, resource_id: &str, permission_id: &str) -> Result<Permission, TransferError> {
        info!(resource_id, permission_id, "promoting permission to owner");
        let flags = UpdateFlags {
            supports_all_drives: true,
            transfer_ownership: true,
        };
        self.store
            .update_permission(resource_id, permission_id, &PermissionUpdate { role: Role::Owner }, flags)
            .map_err(|source| TransferError::Promotion {
                permission_id: permission_id.to_string(),
                source,
            })
    }

    /// Best effort: the caller still gets the original failure.
    fn revoke(&self, resource_id: &str, permission_id: &str) {
        warn!(resource_id, permission_id, "revoking pending owner grant after failed transfer");
        if let Err(e) = self.store.delete_permission(resource_id, permission_id) {
            error!(resource_id, permission_id, error = %e, "could not revoke pending owner grant");
        }
    }
}
