use crate::constants::{MANIFEST_ACCEPT, REGISTRY_TIMEOUT_SECS};
use crate::error::{calculate_backoff, is_retryable, ForgeError, Result, RetryConfig};
use crate::log_remote_operation;
use crate::oci::reference::{ImageRef, DOCKER_HUB};
use crate::remote_cache::{Manifest, RemoteRegistry};
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// OCI distribution API client limited to manifest operations.
pub struct HttpRegistry {
    client: Client,
    credentials: HashMap<String, Credentials>,
    /// `<registry> <scope>` -> bearer token
    tokens: Mutex<HashMap<String, String>>,
    retry: RetryConfig,
}

impl HttpRegistry {
    pub fn new(credentials: HashMap<String, Credentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REGISTRY_TIMEOUT_SECS))
            .user_agent(concat!("imageforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForgeError::registry("client", e, false))?;
        Ok(Self {
            client,
            credentials,
            tokens: Mutex::new(HashMap::new()),
            retry: RetryConfig::default(),
        })
    }

    /// Client using the credentials of the host's Docker `config.json`.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let credentials = match docker_config_path(lookup) {
            Some(path) if path.is_file() => load_docker_credentials(&path)?,
            _ => HashMap::new(),
        };
        Self::new(credentials)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn manifest_url(reference: &ImageRef) -> String {
        let scheme = if reference.is_insecure() { "http" } else { "https" };
        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            reference.api_host(),
            reference.repository,
            reference.manifest_reference()
        )
    }

    fn token_key(reference: &ImageRef, scope: &str) -> String {
        format!("{} {}", reference.registry, scope)
    }

    /// Send a request with auth, answering one bearer challenge and retrying
    /// transient failures with backoff.
    async fn send(
        &self,
        operation: &str,
        reference: &ImageRef,
        push: bool,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response> {
        let scope = format!(
            "repository:{}:{}",
            reference.repository,
            if push { "pull,push" } else { "pull" }
        );
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let result = self.send_once(operation, reference, &scope, &build).await;
            let status = match &result {
                Ok(resp) => resp.status().as_u16().to_string(),
                Err(e) => e.to_string(),
            };
            log_remote_operation!(
                operation,
                reference,
                status.as_str(),
                started.elapsed().as_millis() as u64
            );

            match result {
                Err(e) if is_retryable(&e) && attempt + 1 < self.retry.max_attempts => {
                    let delay = calculate_backoff(attempt, &self.retry);
                    tracing::debug!(operation, %reference, attempt, delay_ms = delay, "Retrying registry request");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        operation: &str,
        reference: &ImageRef,
        scope: &str,
        build: &impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response> {
        let key = Self::token_key(reference, scope);
        let cached = self.tokens.lock().get(&key).cloned();

        let resp = self
            .authorize(build(&self.client), reference, cached.as_deref())
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(operation, resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);
        let Some(challenge) = challenge else {
            return Err(ForgeError::registry(operation, "unauthorized", false));
        };

        let token = self.fetch_token(reference, &challenge, scope).await?;
        self.tokens.lock().insert(key, token.clone());

        let resp = build(&self.client)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        check_status(operation, resp)
    }

    fn authorize(
        &self,
        request: RequestBuilder,
        reference: &ImageRef,
        token: Option<&str>,
    ) -> RequestBuilder {
        match (token, self.credentials.get(&reference.registry)) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(creds)) => request.basic_auth(&creds.username, Some(&creds.password)),
            (None, None) => request,
        }
    }

    async fn fetch_token(
        &self,
        reference: &ImageRef,
        challenge: &BearerChallenge,
        scope: &str,
    ) -> Result<String> {
        let scope = challenge.scope.as_deref().unwrap_or(scope);
        let mut query = vec![("scope", scope)];
        if let Some(service) = challenge.service.as_deref() {
            query.push(("service", service));
        }

        let mut request = self.client.get(&challenge.realm).query(&query);
        if let Some(creds) = self.credentials.get(&reference.registry) {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| transport_error("token", e))?;
        let resp = check_status("token", resp)?;

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ForgeError::registry("token", e, false))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| ForgeError::registry("token", "token endpoint returned no token", false))
    }
}

#[async_trait]
impl RemoteRegistry for HttpRegistry {
    async fn manifest_digest(&self, reference: &ImageRef) -> Result<Option<String>> {
        let url = Self::manifest_url(reference);
        let accept = MANIFEST_ACCEPT.join(", ");
        let resp = match self
            .send("head-manifest", reference, false, |c| {
                c.request(Method::HEAD, &url).header(ACCEPT, &accept)
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        match resp
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(digest) => Ok(Some(digest.to_string())),
            // some registries omit the header on HEAD
            None => Ok(self.fetch_manifest(reference).await?.map(|m| m.digest)),
        }
    }

    async fn fetch_manifest(&self, reference: &ImageRef) -> Result<Option<Manifest>> {
        let url = Self::manifest_url(reference);
        let accept = MANIFEST_ACCEPT.join(", ");
        let resp = match self
            .send("get-manifest", reference, false, |c| {
                c.get(&url).header(ACCEPT, &accept)
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MANIFEST_ACCEPT[1])
            .to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|e| transport_error("get-manifest", e))?;
        Ok(Some(Manifest::new(media_type, body.to_vec())))
    }

    async fn put_manifest(&self, reference: &ImageRef, manifest: &Manifest) -> Result<()> {
        let url = Self::manifest_url(reference);
        self.send("put-manifest", reference, true, |c| {
            c.put(&url)
                .header(CONTENT_TYPE, &manifest.media_type)
                .body(manifest.body.clone())
        })
        .await?;
        Ok(())
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> ForgeError {
    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
    ForgeError::registry(operation, err, retryable)
}

fn check_status(operation: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
    Err(ForgeError::registry(operation, format!("HTTP {}", status), retryable))
}

fn is_not_found(err: &ForgeError) -> bool {
    matches!(err, ForgeError::Registry { reason, .. } if reason.starts_with("HTTP 404"))
}

/// Parsed `WWW-Authenticate: Bearer realm=...,service=...,scope=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut fields = HashMap::new();
        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=')?;
            let after = after.trim_start();
            let (value, tail) = match after.strip_prefix('"') {
                Some(quoted) => {
                    let end = quoted.find('"')?;
                    (&quoted[..end], &quoted[end + 1..])
                }
                None => match after.find(',') {
                    Some(end) => (&after[..end], &after[end..]),
                    None => (after, ""),
                },
            };
            fields.insert(key.trim().to_ascii_lowercase(), value.to_string());
            rest = tail.trim_start().trim_start_matches(',').trim_start();
        }

        Some(Self {
            realm: fields.remove("realm")?,
            service: fields.remove("service"),
            scope: fields.remove("scope"),
        })
    }
}

fn docker_config_path(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(dir) = lookup("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    lookup("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// Registry host -> credentials from the `auths` section of a Docker
/// `config.json`. Entries without an inline `auth` are skipped.
pub fn load_docker_credentials(path: &Path) -> Result<HashMap<String, Credentials>> {
    let content = std::fs::read_to_string(path)?;
    parse_docker_credentials(&content)
}

pub fn parse_docker_credentials(content: &str) -> Result<HashMap<String, Credentials>> {
    #[derive(Deserialize)]
    struct DockerConfig {
        #[serde(default)]
        auths: HashMap<String, AuthEntry>,
    }
    #[derive(Deserialize)]
    struct AuthEntry {
        auth: Option<String>,
    }

    let config: DockerConfig = serde_json::from_str(content)?;
    let mut credentials = HashMap::new();

    for (server, entry) in config.auths {
        let Some(auth) = entry.auth.filter(|a| !a.is_empty()) else {
            continue;
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth.trim())
            .map_err(|e| ForgeError::Config(format!("bad auth entry for {}: {}", server, e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| ForgeError::Config(format!("bad auth entry for {}: {}", server, e)))?;
        let Some((username, password)) = decoded.split_once(':') else {
            return Err(ForgeError::Config(format!(
                "auth entry for {} is not user:password",
                server
            )));
        };
        credentials.insert(
            normalize_server(&server),
            Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }

    Ok(credentials)
}

fn normalize_server(server: &str) -> String {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB.to_string(),
        other => other.to_string(),
    }
}
