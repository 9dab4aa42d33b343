//! Credential resolution with fallback
//!
//! The broker tries an ordered list of [`TokenSource`] strategies until one returns a token
//! for the storage scope. Every failure is kept so that a run which cannot authenticate reports
//! why each strategy was rejected.
//!
//! The resolved [`Credential`] is shared by every worker. Refreshes go through a single async
//! mutex so that an expiring token triggers one re-authentication rather than one per worker.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tracing::instrument;

use crate::error::{Error, StrategyFailure, TransferError};

pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
/// Tokens are refreshed this many seconds before they expire.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

#[derive(Clone)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl AccessToken {
    fn needs_refresh(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now + chrono::TimeDelta::seconds(REFRESH_MARGIN_SECS) >= self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// How the external bulk-copy tool should log in to match the winning strategy.
#[derive(Clone, PartialEq, Eq)]
pub enum BulkLogin {
    /// URLs carry a signature, no login needed.
    None,
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
    AzureCli,
}

impl std::fmt::Debug for BulkLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkLogin::None => f.write_str("None"),
            BulkLogin::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            BulkLogin::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            BulkLogin::AzureCli => f.write_str("AzureCli"),
        }
    }
}

/// One way of obtaining storage tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> anyhow::Result<AccessToken>;

    fn bulk_login(&self) -> BulkLogin;
}

fn expiry_from_seconds(seconds: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() + chrono::TimeDelta::seconds(seconds)
}

fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

async fn read_token_response(response: reqwest::Response) -> anyhow::Result<AccessToken> {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("unreadable token response (HTTP {status})"))?;
    parse_token_body(status, &body)
}

/// Token or error from a decoded token endpoint reply.
///
/// Entra ID answers with `expires_in` seconds, managed identity endpoints with an
/// `expires_on` epoch, either of which may be a JSON string.
fn parse_token_body(status: reqwest::StatusCode, body: &serde_json::Value) -> anyhow::Result<AccessToken> {
    if !status.is_success() {
        let detail = body
            .get("error_description")
            .or_else(|| body.get("error"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("no error description");
        return Err(anyhow!("HTTP {status}: {detail}"));
    }
    let secret = body
        .get("access_token")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow!("token response has no access_token"))?
        .to_string();
    let expires_at = if let Some(epoch) = body.get("expires_on").and_then(json_i64) {
        chrono::DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| anyhow!("token expiry {epoch} out of range"))?
    } else {
        let seconds = body
            .get("expires_in")
            .and_then(json_i64)
            .ok_or_else(|| anyhow!("token response has no expiry"))?;
        expiry_from_seconds(seconds)
    };
    Ok(AccessToken { secret, expires_at })
}

/// Client-credentials flow for a tenant/client id and secret.
pub struct ServicePrincipal {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority: String,
    http: reqwest::Client,
}

impl ServicePrincipal {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority: DEFAULT_AUTHORITY.to_string(),
            http,
        }
    }

    /// Reads `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.
    pub fn from_env(http: reqwest::Client) -> anyhow::Result<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .ok_or_else(|| anyhow!("{name} is not set"))
        };
        Ok(Self::new(
            var("AZURE_TENANT_ID")?,
            var("AZURE_CLIENT_ID")?,
            var("AZURE_CLIENT_SECRET")?,
            http,
        ))
    }
}

#[async_trait]
impl TokenSource for ServicePrincipal {
    fn name(&self) -> &'static str {
        "service principal"
    }

    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", STORAGE_SCOPE),
            ])
            .send()
            .await
            .with_context(|| format!("token request to {url} failed"))?;
        read_token_response(response).await
    }

    fn bulk_login(&self) -> BulkLogin {
        BulkLogin::ServicePrincipal {
            tenant_id: self.tenant_id.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}

/// Managed identity via App Service (`IDENTITY_ENDPOINT`) or the VM metadata endpoint.
pub struct ManagedIdentity {
    client_id: Option<String>,
    http: reqwest::Client,
}

impl ManagedIdentity {
    pub fn new(client_id: Option<String>, http: reqwest::Client) -> Self {
        Self { client_id, http }
    }
}

#[async_trait]
impl TokenSource for ManagedIdentity {
    fn name(&self) -> &'static str {
        "managed identity"
    }

    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        let mut query = vec![("resource", STORAGE_RESOURCE.to_string())];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }
        let app_service = std::env::var("IDENTITY_ENDPOINT")
            .ok()
            .zip(std::env::var("IDENTITY_HEADER").ok());
        let request = match app_service {
            Some((endpoint, header)) => {
                query.push(("api-version", "2019-08-01".to_string()));
                self.http
                    .get(endpoint)
                    .query(&query)
                    .header("X-IDENTITY-HEADER", header)
            }
            None => {
                query.push(("api-version", "2018-02-01".to_string()));
                self.http
                    .get(IMDS_ENDPOINT)
                    .query(&query)
                    .header("Metadata", "true")
                    // an unreachable metadata endpoint means there is no managed identity
                    .timeout(std::time::Duration::from_secs(2))
            }
        };
        let response = request
            .send()
            .await
            .context("managed identity endpoint unavailable")?;
        read_token_response(response).await
    }

    fn bulk_login(&self) -> BulkLogin {
        BulkLogin::ManagedIdentity {
            client_id: self.client_id.clone(),
        }
    }
}

/// Token from a logged-in Azure CLI session.
pub struct AzureCli {
    program: String,
}

impl AzureCli {
    pub fn new() -> Self {
        Self {
            program: "az".to_string(),
        }
    }
}

impl Default for AzureCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for AzureCli {
    fn name(&self) -> &'static str {
        "azure cli"
    }

    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        let output = tokio::process::Command::new(&self.program)
            .args([
                "account",
                "get-access-token",
                "--resource",
                STORAGE_RESOURCE,
                "--output",
                "json",
            ])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {:?}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ));
        }
        let body: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("unreadable az output")?;
        let secret = body
            .get("accessToken")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow!("az output has no accessToken"))?
            .to_string();
        // older CLI versions only print a local-time expiresOn, assume a short lifetime then
        let expires_at = body
            .get("expires_on")
            .and_then(json_i64)
            .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0))
            .unwrap_or_else(|| expiry_from_seconds(10 * 60));
        Ok(AccessToken { secret, expires_at })
    }

    fn bulk_login(&self) -> BulkLogin {
        BulkLogin::AzureCli
    }
}

/// The platform default chain: environment service principal, then the Azure CLI.
pub struct DefaultChain {
    http: reqwest::Client,
    cli: AzureCli,
    winner: std::sync::OnceLock<BulkLogin>,
}

impl DefaultChain {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cli: AzureCli::new(),
            winner: std::sync::OnceLock::new(),
        }
    }
}

#[async_trait]
impl TokenSource for DefaultChain {
    fn name(&self) -> &'static str {
        "default chain"
    }

    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        let env_failure = match ServicePrincipal::from_env(self.http.clone()) {
            Ok(principal) => match principal.fetch().await {
                Ok(token) => {
                    let _ = self.winner.set(principal.bulk_login());
                    return Ok(token);
                }
                Err(error) => error,
            },
            Err(error) => error,
        };
        match self.cli.fetch().await {
            Ok(token) => {
                let _ = self.winner.set(BulkLogin::AzureCli);
                Ok(token)
            }
            Err(cli_failure) => Err(anyhow!(
                "environment: {env_failure:#}; azure cli: {cli_failure:#}"
            )),
        }
    }

    fn bulk_login(&self) -> BulkLogin {
        self.winner.get().cloned().unwrap_or(BulkLogin::AzureCli)
    }
}

struct CredentialInner {
    source: Arc<dyn TokenSource>,
    current: RwLock<AccessToken>,
    refresh: tokio::sync::Mutex<()>,
}

/// A resolved, renewable credential shared read-only by all workers.
#[derive(Clone)]
pub struct Credential {
    inner: Arc<CredentialInner>,
}

impl Credential {
    pub fn new(source: Arc<dyn TokenSource>, token: AccessToken) -> Self {
        Self {
            inner: Arc::new(CredentialInner {
                source,
                current: RwLock::new(token),
                refresh: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Name of the strategy that produced this credential.
    pub fn strategy(&self) -> &'static str {
        self.inner.source.name()
    }

    pub fn bulk_login(&self) -> BulkLogin {
        self.inner.source.bulk_login()
    }

    fn fresh_secret(&self) -> Option<String> {
        let current = self
            .inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (!current.needs_refresh(chrono::Utc::now())).then(|| current.secret.clone())
    }

    /// Returns a bearer token, refreshing it first if it is about to expire.
    pub async fn token(&self) -> Result<String, TransferError> {
        if let Some(secret) = self.fresh_secret() {
            return Ok(secret);
        }
        let _refresh = self.inner.refresh.lock().await;
        // another worker may have refreshed while we waited
        if let Some(secret) = self.fresh_secret() {
            return Ok(secret);
        }
        tracing::debug!("refreshing token from {}", self.strategy());
        let token = self
            .inner
            .source
            .fetch()
            .await
            .map_err(|error| TransferError::TokenRefresh(format!("{error:#}")))?;
        let secret = token.secret.clone();
        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
        Ok(secret)
    }

    /// Marks `stale` as expired after the service rejected it.
    pub fn invalidate(&self, stale: &str) {
        let mut current = self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.secret == stale {
            current.expires_at = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("strategy", &self.strategy())
            .finish_non_exhaustive()
    }
}

/// Identity settings gathered from the command line and environment.
#[derive(Clone, Debug, Default)]
pub struct AuthSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub managed_identity_client_id: Option<String>,
}

/// A strategy configured without all of its settings; every fetch fails.
struct Incomplete {
    name: &'static str,
    missing: Vec<&'static str>,
}

#[async_trait]
impl TokenSource for Incomplete {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self) -> anyhow::Result<AccessToken> {
        Err(anyhow!("incomplete configuration, missing {}", self.missing.join(", ")))
    }

    fn bulk_login(&self) -> BulkLogin {
        BulkLogin::None
    }
}

/// Resolves a credential once per run.
pub struct CredentialBroker {
    strategies: Vec<Arc<dyn TokenSource>>,
    resolved: tokio::sync::OnceCell<Credential>,
}

impl CredentialBroker {
    pub fn new(strategies: Vec<Arc<dyn TokenSource>>) -> Self {
        Self {
            strategies,
            resolved: tokio::sync::OnceCell::new(),
        }
    }

    /// Builds the fixed chain: explicit service principal, managed identity, default chain.
    pub fn from_settings(settings: &AuthSettings, http: &reqwest::Client) -> Self {
        let mut strategies: Vec<Arc<dyn TokenSource>> = Vec::new();
        let given = |value: &Option<String>| value.clone().filter(|value| !value.is_empty());
        match (
            given(&settings.tenant_id),
            given(&settings.client_id),
            given(&settings.client_secret),
        ) {
            (Some(tenant), Some(client), Some(secret)) => {
                strategies.push(Arc::new(ServicePrincipal::new(tenant, client, secret, http.clone())));
            }
            (None, None, None) => {}
            (tenant, client, secret) => {
                let missing = [
                    ("ARM_TENANT_ID", tenant.is_none()),
                    ("ARM_CLIENT_ID", client.is_none()),
                    ("ARM_CLIENT_SECRET", secret.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, missing)| missing.then_some(name))
                .collect();
                strategies.push(Arc::new(Incomplete {
                    name: "service principal",
                    missing,
                }));
            }
        }
        strategies.push(Arc::new(ManagedIdentity::new(
            settings.managed_identity_client_id.clone(),
            http.clone(),
        )));
        strategies.push(Arc::new(DefaultChain::new(http.clone())));
        Self::new(strategies)
    }

    /// Returns the cached credential, resolving it on first use.
    #[instrument(skip(self))]
    pub async fn resolve(&self) -> Result<Credential, Error> {
        self.resolved
            .get_or_try_init(|| async {
                let mut attempts = Vec::new();
                for source in &self.strategies {
                    match source.fetch().await {
                        Ok(token) => {
                            tracing::info!("authenticated with {}", source.name());
                            return Ok(Credential::new(source.clone(), token));
                        }
                        Err(error) => {
                            tracing::debug!("{} unavailable: {error:#}", source.name());
                            attempts.push(StrategyFailure {
                                strategy: source.name(),
                                reason: format!("{error:#}"),
                            });
                        }
                    }
                }
                Err(Error::Authentication { attempts })
            })
            .await
            .cloned()
    }
}
