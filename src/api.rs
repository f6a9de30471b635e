// API client module: the Drive v3 permissions endpoints behind a small
// `PermissionStore` trait. The coordinator in `transfer` only sees the
// trait, so tests can swap in an in-memory store. The real client is
// blocking, like the rest of the CLI.

use crate::error::StoreError;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default base URL of the Drive v3 REST API.
pub const DEFAULT_API_URL: &str = "https://www.googleapis.com/drive/v3";

/// Field projection used when listing permissions. `nextPageToken` must be
/// part of it or pagination silently stops after the first page.
pub const LIST_FIELDS: &str = "nextPageToken,permissions(id,type,emailAddress,role,pendingOwner)";

/// Access level of a permission.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Owner,
    Organizer,
    FileOrganizer,
    Writer,
    Commenter,
    Reader,
    #[serde(other)]
    Other,
}

/// Kind of principal a permission is granted to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    User,
    Group,
    Domain,
    Anyone,
}

/// One permission record on a file, as returned by the API. Everything but
/// the id is optional because list calls only return the projected fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub principal_type: Option<PrincipalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub pending_owner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Permission {
    /// Exact, case-sensitive comparison of the principal email.
    pub fn is_for(&self, email: &str) -> bool {
        self.email_address.as_deref() == Some(email)
    }
}

/// Request body for the grant step.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewPermission {
    pub role: Role,
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
    pub email_address: String,
    pub pending_owner: bool,
}

impl NewPermission {
    /// Writer access flagged as an in-progress ownership transfer. The API
    /// refuses a direct owner grant, so this is always the first step.
    pub fn pending_owner(email: &str) -> Self {
        NewPermission {
            role: Role::Writer,
            principal_type: PrincipalType::User,
            email_address: email.to_string(),
            pending_owner: true,
        }
    }
}

/// Request body for the promotion step.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PermissionUpdate {
    pub role: Role,
}

/// Query flags sent with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateFlags {
    /// Needed for files living in shared drives as well as My Drive.
    pub supports_all_drives: bool,
    /// Marks a role change to owner as an ownership handover.
    pub transfer_ownership: bool,
}

/// The permission list of a remote resource.
///
/// Implementations must give read-after-write consistency between
/// `create_permission` and a following `list_permissions`; the coordinator
/// relies on it unless lookup retries are enabled.
pub trait PermissionStore {
    fn list_permissions(&self, resource_id: &str, fields: &str) -> Result<Vec<Permission>, StoreError>;

    fn create_permission(&self, resource_id: &str, permission: &NewPermission) -> Result<Permission, StoreError>;

    fn update_permission(
        &self,
        resource_id: &str,
        permission_id: &str,
        update: &PermissionUpdate,
        flags: UpdateFlags,
    ) -> Result<Permission, StoreError>;

    fn delete_permission(&self, resource_id: &str, permission_id: &str) -> Result<(), StoreError>;
}

impl<S: PermissionStore + ?Sized> PermissionStore for &S {
    fn list_permissions(&self, resource_id: &str, fields: &str) -> Result<Vec<Permission>, StoreError> {
        (**self).list_permissions(resource_id, fields)
    }

    fn create_permission(&self, resource_id: &str, permission: &NewPermission) -> Result<Permission, StoreError> {
        (**self).create_permission(resource_id, permission)
    }

    fn update_permission(
        &self,
        resource_id: &str,
        permission_id: &str,
        update: &PermissionUpdate,
        flags: UpdateFlags,
    ) -> Result<Permission, StoreError> {
        (**self).update_permission(resource_id, permission_id, update, flags)
    }

    fn delete_permission(&self, resource_id: &str, permission_id: &str) -> Result<(), StoreError> {
        (**self).delete_permission(resource_id, permission_id)
    }
}

/// One page of `permissions.list`.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct PermissionList {
    #[serde(default)]
    permissions: Vec<Permission>,
    next_page_token: Option<String>,
}

/// Google's JSON error envelope: `{"error": {"code": 404, "message": "..."}}`.
#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    message: String,
}

/// Blocking client for the Drive v3 permissions endpoints. Holds the
/// reqwest client, the API base URL and the bearer token of the session.
#[derive(Clone)]
pub struct DriveClient {
    client: Client,
    base_url: Url,
    access_token: String,
}

impl DriveClient {
    /// Build a client for `base_url` that authenticates every request with
    /// `access_token`.
    pub fn new(base_url: &str, access_token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url).map_err(|e| StoreError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(DriveClient {
            client,
            base_url,
            access_token: access_token.to_string(),
        })
    }

    /// `{base}/files/{resource_id}/permissions[/{permission_id}]`, with each
    /// id escaped as a single path segment.
    pub fn permissions_url(&self, resource_id: &str, permission_id: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().extend(["files", resource_id, "permissions"]);
            if let Some(id) = permission_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let res = req.bearer_auth(&self.access_token).send()?;
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().unwrap_or_default();
        debug!(status, body = %body, "drive API rejected request");
        Err(StoreError::api(status, error_message(&body)))
    }
}

/// Pull `error.message` out of a Google error body, falling back to the
/// raw text for anything else.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) => body.trim().to_string(),
    }
}

impl PermissionStore for DriveClient {
    fn list_permissions(&self, resource_id: &str, fields: &str) -> Result<Vec<Permission>, StoreError> {
        let url = self.permissions_url(resource_id, None)?;
        let mut permissions = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.client.get(url.clone()).query(&[("fields", fields)]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let page: PermissionList = self.send(req)?.json()?;
            debug!(resource_id, count = page.permissions.len(), "listed permission page");
            permissions.extend(page.permissions);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(permissions)
    }

    fn create_permission(&self, resource_id: &str, permission: &NewPermission) -> Result<Permission, StoreError> {
        let url = self.permissions_url(resource_id, None)?;
        let req = self.client.post(url).json(permission);
        Ok(self.send(req)?.json()?)
    }

    fn update_permission(
        &self,
        resource_id: &str,
        permission_id: &str,
        update: &PermissionUpdate,
        flags: UpdateFlags,
    ) -> Result<Permission, StoreError> {
        let url = self.permissions_url(resource_id, Some(permission_id))?;
        let all_drives = flags.supports_all_drives.to_string();
        let req = self
            .client
            .patch(url)
            .query(&[
                ("transferOwnership", flags.transfer_ownership.to_string()),
                ("supportsAllDrives", all_drives.clone()),
                ("supportsTeamDrives", all_drives),
            ])
            .json(update);
        Ok(self.send(req)?.json()?)
    }

    fn delete_permission(&self, resource_id: &str, permission_id: &str) -> Result<(), StoreError> {
        let url = self.permissions_url(resource_id, Some(permission_id))?;
        let req = self.client.delete(url).query(&[("supportsAllDrives", "true")]);
        self.send(req)?;
        Ok(())
    }
}
