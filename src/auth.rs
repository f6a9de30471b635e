// Session provider: gets an OAuth access token for the Drive API.
//
// A cached `authorized_user` file (client id, client secret, refresh token)
// is tried first. Without one, or when the refresh is rejected, the
// installed-app flow runs: the consent page is opened in the browser, which
// redirects back to a listener on 127.0.0.1, and the code is exchanged for
// tokens. A newly issued refresh token is written back to the cache.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Full access to the user's Drive.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
/// Per-file access to files the app opened or created.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
/// Scopes requested by the transfer.
pub const SCOPES: [&str; 2] = [DRIVE_SCOPE, DRIVE_FILE_SCOPE];

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const AUTHORIZED_USER: &str = "authorized_user";
/// How long an accepted loopback connection may stay silent. Browsers open
/// spare connections ahead of time; those are dropped after this.
const REDIRECT_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// OAuth client from the Google Cloud console download
/// (`credentials.json`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ClientKey {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize, Debug)]
struct CredentialsFile {
    installed: Option<ClientKey>,
    web: Option<ClientKey>,
}

impl ClientKey {
    /// Parse a console download; desktop (`installed`) clients win over
    /// `web` ones when both are present.
    pub fn from_json(content: &str) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_str(content).context("Parsing client credentials json")?;
        file.installed
            .or(file.web)
            .ok_or_else(|| anyhow!("credentials file has neither an `installed` nor a `web` client"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read client credentials {}", path.display()))?;
        Self::from_json(&content)
    }
}

/// Token cache contents, in the layout Google client libraries use.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthorizedUser {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Caches written by other Google tools omit it.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl AuthorizedUser {
    pub fn new(key: &ClientKey, refresh_token: &str) -> Self {
        AuthorizedUser {
            kind: AUTHORIZED_USER.to_string(),
            client_id: key.client_id.clone(),
            client_secret: key.client_secret.clone(),
            refresh_token: refresh_token.to_string(),
            token_uri: key.token_uri.clone(),
        }
    }
}

/// An authenticated session. Expiry is not tracked: one run of the CLI is
/// far shorter than an access token's lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    access_token: String,
}

impl Session {
    pub fn new(access_token: impl Into<String>) -> Self {
        Session {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Loads, refreshes, obtains and persists OAuth sessions.
pub struct SessionProvider {
    client: Client,
    credentials_path: PathBuf,
    token_path: PathBuf,
    browser: fn(&Url),
}

impl SessionProvider {
    pub fn new(credentials_path: PathBuf, token_path: PathBuf, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(SessionProvider {
            client,
            credentials_path,
            token_path,
            browser: open_browser,
        })
    }

    /// Replace how the consent URL is shown to the user.
    pub fn with_browser(mut self, browser: fn(&Url)) -> Self {
        self.browser = browser;
        self
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Cached session first, interactive flow second.
    pub fn authorize(&self) -> Result<Session> {
        if let Some(user) = self.load_cached() {
            match self.refresh(&user) {
                Ok(session) => {
                    info!(path = %self.token_path.display(), "using cached credentials");
                    return Ok(session);
                }
                Err(e) => warn!(error = %e, "cached credentials rejected, starting browser sign-in"),
            }
        }

        let key = ClientKey::from_file(&self.credentials_path)?;
        let (session, refresh_token) = self.authenticate(&key, &SCOPES)?;
        match refresh_token {
            Some(token) => self.persist(&AuthorizedUser::new(&key, &token))?,
            None => warn!("no refresh token issued, the next run will ask to sign in again"),
        }
        Ok(session)
    }

    /// Read the token cache. A missing or unreadable file is treated as
    /// "no cached session".
    pub fn load_cached(&self) -> Option<AuthorizedUser> {
        let content = match fs::read_to_string(&self.token_path) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %self.token_path.display(), error = %e, "no cached token");
                return None;
            }
        };
        match serde_json::from_str::<AuthorizedUser>(&content) {
            Ok(user) if user.kind == AUTHORIZED_USER => Some(user),
            Ok(user) => {
                warn!(kind = %user.kind, "ignoring token cache of unexpected type");
                None
            }
            Err(e) => {
                warn!(path = %self.token_path.display(), error = %e, "ignoring corrupt token cache");
                None
            }
        }
    }

    /// Write the token cache, creating parent directories. On Unix the file
    /// is created owner-only, since it holds a long-lived refresh token.
    pub fn persist(&self, user: &AuthorizedUser) -> Result<()> {
        if let Some(dir) = self.token_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let payload = serde_json::to_string(user)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.token_path)
            .with_context(|| format!("Failed to open token cache {}", self.token_path.display()))?;
        // `mode` only applies on creation; an older cache may be wider.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(payload.as_bytes())
            .with_context(|| format!("Failed to write token cache {}", self.token_path.display()))?;

        info!(path = %self.token_path.display(), "saved credentials");
        Ok(())
    }

    /// Trade a cached refresh token for a fresh access token.
    pub fn refresh(&self, user: &AuthorizedUser) -> Result<Session> {
        let params = [
            ("client_id", user.client_id.as_str()),
            ("client_secret", user.client_secret.as_str()),
            ("refresh_token", user.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let token = self.request_token(&user.token_uri, &params)?;
        Ok(Session::new(token.access_token))
    }

    /// Browser sign-in through a loopback redirect. Returns the session and
    /// the refresh token, when Google issued one.
    pub fn authenticate(&self, key: &ClientKey, scopes: &[&str]) -> Result<(Session, Option<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind loopback listener")?;
        let redirect_uri = format!("http://127.0.0.1:{}", listener.local_addr()?.port());
        let url = consent_url(key, &redirect_uri, scopes)?;

        (self.browser)(&url);

        let code = wait_for_code(&listener, REDIRECT_READ_TIMEOUT)?;
        debug!("received authorization code");

        let params = [
            ("code", code.as_str()),
            ("client_id", key.client_id.as_str()),
            ("client_secret", key.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        let token = self.request_token(&key.token_uri, &params)?;
        Ok((Session::new(token.access_token), token.refresh_token))
    }

    fn request_token(&self, token_uri: &str, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let res = self
            .client
            .post(token_uri)
            .form(params)
            .send()
            .context("Failed to send token request")?;
        if !res.status().is_success() {
            let status = res.status();
            let txt = res.text().unwrap_or_default();
            bail!("Token request failed: {} - {}", status, txt);
        }
        let token: TokenResponse = res.json().context("Parsing token response json")?;
        debug!(expires_in = token.expires_in, "obtained access token");
        Ok(token)
    }
}

/// Print the consent URL and try to open it in the default browser.
fn open_browser(url: &Url) {
    println!("Open this URL in your browser to authorize access:\n\n  {}\n", url);
    if let Err(e) = open::that(url.as_str()) {
        debug!(error = %e, "could not launch a browser");
    }
}

/// Consent page URL for the installed-app flow. `access_type=offline` with
/// `prompt=consent` makes Google issue a refresh token every time.
pub fn consent_url(key: &ClientKey, redirect_uri: &str, scopes: &[&str]) -> Result<Url> {
    let scope = scopes.join(" ");
    Url::parse_with_params(
        &key.auth_uri,
        &[
            ("client_id", key.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .with_context(|| format!("Invalid auth_uri {}", key.auth_uri))
}

/// Serve the loopback listener until a request carries `code` or `error`.
/// Silent connections time out and unrelated requests get a 404.
fn wait_for_code(listener: &TcpListener, read_timeout: Duration) -> Result<String> {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "failed to accept loopback connection");
                continue;
            }
        };
        stream
            .set_read_timeout(Some(read_timeout))
            .context("Failed to set loopback read timeout")?;

        let request_line = match read_request_head(&stream) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "dropping silent loopback connection");
                continue;
            }
        };

        let outcome = parse_redirect(&request_line);
        let (status, body) = match &outcome {
            Ok(Some(_)) => ("200 OK", "Authorization complete. You can close this tab."),
            Ok(None) => ("404 Not Found", "Not found."),
            Err(_) => ("200 OK", "Authorization failed. Check the terminal for details."),
        };
        respond(&stream, status, body);

        match outcome {
            Ok(Some(code)) => return Ok(code),
            Ok(None) => debug!(request = %request_line.trim(), "ignoring unrelated loopback request"),
            Err(e) => return Err(e),
        }
    }
    bail!("loopback listener stopped before the redirect arrived")
}

/// Read the request line and skip the headers that follow it.
fn read_request_head(stream: &TcpStream) -> std::io::Result<String> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
    }
    Ok(request_line)
}

fn respond(mut stream: &TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()) {
        debug!(error = %e, "could not answer loopback request");
    }
}

/// Extract `code` from a redirect request line such as
/// `GET /?code=4/0Ab&scope=... HTTP/1.1`. `None` for anything else the
/// browser asks for; an `error` parameter means the user denied consent.
pub fn parse_redirect(request_line: &str) -> Result<Option<String>> {
    let target = match request_line.split_whitespace().nth(1) {
        Some(t) => t,
        None => return Ok(None),
    };
    let url = match Url::parse("http://127.0.0.1").and_then(|base| base.join(target)) {
        Ok(u) => u,
        Err(_) => return Ok(None),
    };

    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => bail!("authorization denied: {}", value),
            _ => {}
        }
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(dir: &Path) -> SessionProvider {
        SessionProvider::new(
            dir.join("credentials.json"),
            dir.join("cache").join("token.json"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn key() -> ClientKey {
        ClientKey {
            client_id: "id-123.apps.googleusercontent.com".into(),
            client_secret: "s3cret".into(),
            auth_uri: DEFAULT_AUTH_URI.into(),
            token_uri: DEFAULT_TOKEN_URI.into(),
        }
    }

    #[test]
    fn reads_installed_and_web_clients() {
        let installed = ClientKey::from_json(r#"{"installed":{"client_id":"a","client_secret":"b"}}"#).unwrap();
        assert_eq!(installed.client_id, "a");
        assert_eq!(installed.token_uri, DEFAULT_TOKEN_URI);

        let web = ClientKey::from_json(
            r#"{"web":{"client_id":"w","client_secret":"x","token_uri":"http://localhost/token"}}"#,
        )
        .unwrap();
        assert_eq!(web.client_id, "w");
        assert_eq!(web.token_uri, "http://localhost/token");
    }

    #[test]
    fn rejects_credentials_without_client() {
        let err = ClientKey::from_json(r#"{"other":{}}"#).unwrap_err();
        assert!(err.to_string().contains("installed"));
    }

    #[test]
    fn token_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        assert!(provider.load_cached().is_none());

        let user = AuthorizedUser::new(&key(), "1//refresh");
        provider.persist(&user).unwrap();

        assert_eq!(provider.load_cached(), Some(user));
        let raw = fs::read_to_string(provider.token_path()).unwrap();
        assert!(raw.contains("\"type\":\"authorized_user\""));
    }

    #[cfg(unix)]
    #[test]
    fn token_cache_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.persist(&AuthorizedUser::new(&key(), "r")).unwrap();
        let mode = fs::metadata(provider.token_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_or_foreign_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        fs::create_dir_all(provider.token_path().parent().unwrap()).unwrap();

        fs::write(provider.token_path(), "{not json").unwrap();
        assert!(provider.load_cached().is_none());

        fs::write(
            provider.token_path(),
            r#"{"type":"service_account","client_id":"a","client_secret":"b","refresh_token":"c"}"#,
        )
        .unwrap();
        assert!(provider.load_cached().is_none());
    }

    #[test]
    fn consent_url_requests_offline_access_for_all_scopes() {
        let url = consent_url(&key(), "http://127.0.0.1:4567", &SCOPES).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(get("redirect_uri"), Some("http://127.0.0.1:4567"));
        assert_eq!(get("access_type"), Some("offline"));
        assert_eq!(get("response_type"), Some("code"));
        assert_eq!(get("scope"), Some(format!("{} {}", DRIVE_SCOPE, DRIVE_FILE_SCOPE).as_str()));
    }

    #[test]
    fn parses_code_from_redirect() {
        let code = parse_redirect("GET /?code=4%2F0Ab-xyz&scope=drive HTTP/1.1\r\n").unwrap();
        assert_eq!(code.as_deref(), Some("4/0Ab-xyz"));
    }

    #[test]
    fn reports_denied_consent() {
        let err = parse_redirect("GET /?error=access_denied HTTP/1.1").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[test]
    fn unrelated_requests_carry_no_code() {
        assert_eq!(parse_redirect("GET /favicon.ico HTTP/1.1").unwrap(), None);
        assert_eq!(parse_redirect("").unwrap(), None);
    }

    #[test]
    fn old_cache_without_token_uri_uses_google_endpoint() {
        let user: AuthorizedUser = serde_json::from_str(
            r#"{"type":"authorized_user","client_id":"a","client_secret":"b","refresh_token":"c"}"#,
        )
        .unwrap();
        assert_eq!(user.token_uri, DEFAULT_TOKEN_URI);
    }

    #[test]
    fn cache_keeps_the_client_token_endpoint() {
        let key = ClientKey {
            token_uri: "https://oauth.example.test/token".into(),
            ..key()
        };
        let user = AuthorizedUser::new(&key, "r");
        assert_eq!(user.token_uri, "https://oauth.example.test/token");
    }

    #[cfg(unix)]
    #[test]
    fn persist_tightens_an_existing_cache() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        fs::create_dir_all(provider.token_path().parent().unwrap()).unwrap();
        fs::write(provider.token_path(), "old").unwrap();
        fs::set_permissions(provider.token_path(), fs::Permissions::from_mode(0o644)).unwrap();

        provider.persist(&AuthorizedUser::new(&key(), "r")).unwrap();

        let mode = fs::metadata(provider.token_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(provider.load_cached().map(|u| u.refresh_token), Some("r".to_string()));
    }

    /// Send `request` on a fresh connection and return the full response.
    fn send_request(addr: std::net::SocketAddr, request: &[u8]) -> String {
        use std::io::Read;
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn silent_preconnect_does_not_block_the_redirect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let browser = std::thread::spawn(move || {
            let idle = TcpStream::connect(addr).unwrap();
            let response = send_request(addr, b"GET /?code=abc HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
            drop(idle);
            response
        });

        let code = wait_for_code(&listener, Duration::from_millis(200)).unwrap();

        assert_eq!(code, "abc");
        assert!(browser.join().unwrap().starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn unrelated_request_is_answered_and_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let browser = std::thread::spawn(move || {
            let favicon = send_request(addr, b"GET /favicon.ico HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
            let redirect = send_request(addr, b"GET /?code=xyz&scope=drive HTTP/1.1\r\n\r\n");
            (favicon, redirect)
        });

        let code = wait_for_code(&listener, Duration::from_secs(2)).unwrap();

        assert_eq!(code, "xyz");
        let (favicon, redirect) = browser.join().unwrap();
        assert!(favicon.starts_with("HTTP/1.1 404"));
        assert!(redirect.starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn denied_consent_ends_the_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let browser = std::thread::spawn(move || send_request(addr, b"GET /?error=access_denied HTTP/1.1\r\n\r\n"));

        let err = wait_for_code(&listener, Duration::from_secs(2)).unwrap_err();

        assert!(err.to_string().contains("access_denied"));
        browser.join().unwrap();
    }
}
