//! Client for the Proxmox VE management API.
//!
//! A `Session` is minted by a single authentication exchange against
//! `/api2/json/access/ticket` and then carried on every request as the
//! `PVEAuthCookie` cookie plus the `CSRFPreventionToken` header. API tokens
//! skip the exchange and send an `Authorization` header instead.

use std::fmt;
use std::sync::Arc;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::resources::{ProviderConfigSpec, Secret};

/// Errors returned by the Proxmox API client.
#[derive(Debug, Error)]
pub enum PveError {
    /// The session could not be established.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure.
    #[error("request to Proxmox API failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API rejected the request.
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    /// The VM does not exist.
    #[error("VM {0} not found")]
    NotFound(u32),

    /// The response body could not be parsed.
    #[error("failed to parse response: {0}")]
    Decode(String),
}

impl PveError {
    /// Whether the error means "the VM does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, PveError::NotFound(_))
    }

    /// Whether the session was rejected (expired ticket, revoked token).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, PveError::Api { status, .. } if *status == StatusCode::UNAUTHORIZED.as_u16())
    }

    /// Turn "missing VM" API answers into `NotFound`.
    ///
    /// Proxmox answers 404 for unknown paths but 500 with "does not exist"
    /// when the VM config file is missing.
    fn for_vm(self, vmid: u32) -> Self {
        match self {
            PveError::Api { status, ref body }
                if status == StatusCode::NOT_FOUND.as_u16() || body.contains("does not exist") =>
            {
                PveError::NotFound(vmid)
            }
            other => other,
        }
    }
}

// =============================================================================
// Credentials & connection settings
// =============================================================================

/// Credential material used to mint a session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { username: String, password: String },
    /// Full API token, `USER@REALM!TOKENID=SECRET`.
    Token(String),
}

impl Credentials {
    /// Read credentials from a secret: either `token`, or `username` and
    /// `password`.
    pub fn from_secret(secret: &Secret) -> Result<Self, String> {
        if let Some(token) = secret.get("token") {
            return Ok(Credentials::Token(token.to_string()));
        }
        let username = secret
            .get("username")
            .ok_or_else(|| "missing key username".to_string())?;
        let password = secret
            .get("password")
            .ok_or_else(|| "missing key password".to_string())?;
        Ok(Credentials::Password {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Non-secret identity: the username, or the token ID.
    pub fn identity(&self) -> &str {
        match self {
            Credentials::Password { username, .. } => username,
            Credentials::Token(token) => token.split('=').next().unwrap_or_default(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Token(_) => f
                .debug_tuple("Token")
                .field(&self.identity())
                .finish(),
        }
    }
}

/// Where and how to reach the Proxmox API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Base URL without the `/api2/json` suffix.
    pub url: String,
    pub insecure_skip_tls_verify: bool,
}

impl From<&ProviderConfigSpec> for Endpoint {
    fn from(spec: &ProviderConfigSpec) -> Self {
        Self {
            url: spec.endpoint.trim_end_matches('/').to_string(),
            insecure_skip_tls_verify: spec.insecure_skip_tls_verify,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

enum SessionAuth {
    Ticket { ticket: String, csrf_token: String },
    Token(String),
}

/// An authenticated context for the Proxmox API.
pub struct Session {
    endpoint: String,
    auth: SessionAuth,
    http: reqwest::Client,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ApiData<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_prevention_token: String,
}

impl Session {
    /// Authenticate against the Proxmox API.
    ///
    /// Performs exactly one exchange and never retries; any failure is an
    /// `Auth` error.
    pub async fn connect(endpoint: &Endpoint, credentials: &Credentials) -> Result<Self, PveError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(endpoint.insecure_skip_tls_verify)
            .build()
            .map_err(|e| PveError::Auth(format!("failed to build HTTP client: {e}")))?;

        let (username, password) = match credentials {
            Credentials::Token(token) => {
                return Ok(Self {
                    endpoint: endpoint.url.clone(),
                    auth: SessionAuth::Token(token.clone()),
                    http,
                })
            }
            Credentials::Password { username, password } => (username, password),
        };

        let url = format!("{}/api2/json/access/ticket", endpoint.url);
        debug!(%url, username = %username, "Requesting Proxmox ticket");
        let resp = http
            .post(&url)
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|e| PveError::Auth(format!("failed to authenticate with Proxmox API: {e}")))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| PveError::Auth(format!("failed to read authentication response: {e}")))?;
        if !status.is_success() {
            return Err(PveError::Auth(format!(
                "status {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }

        let ticket = serde_json::from_slice::<ApiData<Ticket>>(&body)
            .map_err(|e| PveError::Auth(format!("failed to parse authentication response: {e}")))?
            .data
            .ok_or_else(|| PveError::Auth("no ticket in authentication response".to_string()))?;

        Ok(Self {
            endpoint: endpoint.url.clone(),
            auth: SessionAuth::Ticket {
                ticket: ticket.ticket,
                csrf_token: ticket.csrf_prevention_token,
            },
            http,
        })
    }

    /// Issue one API call. Any non-2xx status becomes `PveError::Api`.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&T>,
    ) -> Result<Response, PveError> {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.http.request(method.clone(), &url);
        req = match &self.auth {
            SessionAuth::Ticket { ticket, csrf_token } => req
                .header(reqwest::header::COOKIE, format!("PVEAuthCookie={ticket}"))
                .header("CSRFPreventionToken", csrf_token),
            SessionAuth::Token(token) => {
                req.header(reqwest::header::AUTHORIZATION, format!("PVEAPIToken={token}"))
            }
        };
        if let Some(payload) = payload {
            req = req.json(payload);
        }

        debug!(%method, %path, "Proxmox API request");
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PveError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<ApiData<T>, PveError> {
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| PveError::Decode(e.to_string()))
}

// =============================================================================
// VM wire types
// =============================================================================

/// Power state reported by `status/current`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmPowerState {
    Running,
    Creating,
    Deleting,
    Stopped,
    Paused,
    Unknown(String),
}

impl VmPowerState {
    pub fn as_str(&self) -> &str {
        match self {
            VmPowerState::Running => "running",
            VmPowerState::Creating => "creating",
            VmPowerState::Deleting => "deleting",
            VmPowerState::Stopped => "stopped",
            VmPowerState::Paused => "paused",
            VmPowerState::Unknown(s) => s,
        }
    }
}

impl From<&str> for VmPowerState {
    fn from(s: &str) -> Self {
        match s {
            "running" => VmPowerState::Running,
            "creating" => VmPowerState::Creating,
            "deleting" => VmPowerState::Deleting,
            "stopped" => VmPowerState::Stopped,
            "paused" => VmPowerState::Paused,
            other => VmPowerState::Unknown(other.to_string()),
        }
    }
}

/// Remote truth for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedState {
    pub status: VmPowerState,
    pub hostname: String,
    pub id: u32,
}

#[derive(Deserialize)]
struct StatusCurrent {
    status: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    vmid: Option<u32>,
}

/// Proxmox encodes booleans as "1"/"0".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PveBool(pub bool);

impl Serialize for PveBool {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if self.0 { "1" } else { "0" })
    }
}

/// Body of `POST /nodes/<node>/qemu`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateVmPayload {
    pub vmid: u32,
    pub name: String,
    pub memory: u32,
    pub cores: u32,
    pub cpu: String,
    pub sockets: u32,
    pub ide2: String,
    pub net0: String,
    pub numa: PveBool,
    pub ostype: String,
    pub scsi0: String,
    pub scsihw: String,
}

/// Body of `PUT /nodes/<node>/qemu/<vmid>/config`. Omitted fields stay as
/// they are on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateVmPayload {
    pub name: String,
    pub memory: u32,
    pub cores: u32,
    pub sockets: u32,
}

// =============================================================================
// PveClient
// =============================================================================

/// Typed VM operations on one Proxmox node.
#[derive(Debug, Clone)]
pub struct PveClient {
    session: Arc<Session>,
    node: String,
}

impl PveClient {
    pub fn new(session: Arc<Session>, node: impl Into<String>) -> Self {
        Self {
            session,
            node: node.into(),
        }
    }

    fn qemu_path(&self) -> String {
        format!("/api2/json/nodes/{}/qemu", self.node)
    }

    /// Current runtime status of a VM.
    ///
    /// A 200 with `data: null` means the VM does not exist, same as a 404.
    pub async fn get_status(&self, vmid: u32) -> Result<ObservedState, PveError> {
        let path = format!("{}/{vmid}/status/current", self.qemu_path());
        let resp = self
            .session
            .request::<()>(Method::GET, &path, None)
            .await
            .map_err(|e| e.for_vm(vmid))?;

        let current = decode::<StatusCurrent>(resp)
            .await?
            .data
            .ok_or(PveError::NotFound(vmid))?;

        Ok(ObservedState {
            status: VmPowerState::from(current.status.as_str()),
            hostname: current.name.unwrap_or_default(),
            id: current.vmid.unwrap_or(vmid),
        })
    }

    /// Create a VM. Not idempotent on the remote side: callers must only
    /// create after observing the VM is absent.
    pub async fn create(&self, payload: &CreateVmPayload) -> Result<(), PveError> {
        self.session
            .request(Method::POST, &self.qemu_path(), Some(payload))
            .await?;
        Ok(())
    }

    /// Partially update a VM configuration.
    pub async fn update(&self, vmid: u32, payload: &UpdateVmPayload) -> Result<(), PveError> {
        let path = format!("{}/{vmid}/config", self.qemu_path());
        self.session
            .request(Method::PUT, &path, Some(payload))
            .await
            .map_err(|e| e.for_vm(vmid))?;
        Ok(())
    }

    /// Request VM teardown. `NotFound` means the VM is already gone.
    pub async fn delete(&self, vmid: u32) -> Result<(), PveError> {
        let path = format!("{}/{vmid}", self.qemu_path());
        self.session
            .request::<()>(Method::DELETE, &path, None)
            .await
            .map_err(|e| e.for_vm(vmid))?;
        Ok(())
    }
}
