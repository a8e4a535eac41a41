//! http session: token cache, login/refresh state machine, interrupt cleanup

mod auth;
mod interrupt;
mod prompt;

pub use auth::{store_key, AuthStore, Challenge, TokenPair};
pub(crate) use auth::split_challenge;
pub use interrupt::{CleanupGuard, CleanupRegistry, INTERRUPTED_EXIT};
pub use prompt::{
    CredentialPrompt, Credentials, FixedPrompt, NoPrompt, Registration, TtyPrompt, REGISTER,
};

use std::sync::Mutex;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::redirect::Policy;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{EnvConfig, GlobalConfig, ProxyMode, MAX_REDIRECTS, USER_AGENT};
use crate::error::{Error, Result};

/// login attempts before giving up
pub const LOGIN_ATTEMPTS: u32 = 3;
/// account registrations a single request may trigger; further
/// `REGISTER` answers count as failed attempts
pub const REGISTRATIONS_PER_REQUEST: u32 = 1;

/// longest response body quoted in an error
const ERROR_BODY_LIMIT: usize = 512;

/// shared http client plus everything needed to authenticate its requests
pub struct Session {
    env: EnvConfig,
    global: GlobalConfig,
    client: Client,
    store: Mutex<AuthStore>,
    bearer: Mutex<Option<String>>,
    // serializes refresh/login so parallel workers prompt once
    login: Mutex<()>,
    prompt: Box<dyn CredentialPrompt>,
    cleanup: CleanupRegistry,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access-token")]
    token: String,
    #[serde(rename = "refresh-token", default)]
    refresh_token: Option<String>,
}

impl Session {
    pub fn new(env: EnvConfig, prompt: Box<dyn CredentialPrompt>) -> Result<Self> {
        let global = GlobalConfig::load(&env.config_dir)?;
        let store = AuthStore::load(&env.config_dir)?;
        let client = build_client(&env)?;
        let bearer = env.access_token.clone();
        Ok(Self {
            env,
            global,
            client,
            store: Mutex::new(store),
            bearer: Mutex::new(bearer),
            login: Mutex::new(()),
            prompt,
            cleanup: CleanupRegistry::new(),
        })
    }

    pub fn with_cleanup(mut self, cleanup: CleanupRegistry) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn cleanup(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    /// bearer currently attached to requests
    pub fn bearer(&self) -> Option<String> {
        self.bearer.lock().ok().and_then(|b| b.clone())
    }

    fn set_bearer(&self, token: &str) {
        if let Ok(mut bearer) = self.bearer.lock() {
            *bearer = Some(token.to_string());
        }
    }

    /// issue a request, authenticating on a `JWT`/`Bearer` challenge
    ///
    /// `build` is called once per attempt with the bearer to attach. The
    /// response is returned as-is unless it carries a challenge; check the
    /// status with [`expect_success`].
    pub fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client, Option<&str>) -> RequestBuilder,
    {
        let tried = self.bearer();
        let response = build(&self.client, tried.as_deref()).send()?;
        let Some(challenge) = challenge_of(&response)? else {
            return Ok(response);
        };
        debug!(url = %response.url(), realm = %challenge.realm, "authentication required");
        self.authenticate(&challenge, tried.as_deref(), &build)
    }

    fn authenticate<F>(&self, challenge: &Challenge, tried: Option<&str>, build: &F) -> Result<Response>
    where
        F: Fn(&Client, Option<&str>) -> RequestBuilder,
    {
        let _login = self
            .login
            .lock()
            .map_err(|_| Error::Auth("login state poisoned".into()))?;
        let key = challenge.store_key();

        // another worker may have logged in while we waited
        if let Some(current) = self.bearer().filter(|b| Some(b.as_str()) != tried) {
            if let Some(response) = self.retry(build, &current)? {
                return Ok(response);
            }
        }

        let stored = self.store_get(&key);
        if let Some(tokens) = &stored {
            if Some(tokens.access_token.as_str()) != tried {
                if let Some(response) = self.retry(build, &tokens.access_token)? {
                    self.set_bearer(&tokens.access_token);
                    return Ok(response);
                }
            }
        }

        if challenge.error.is_none() {
            if let Some(tokens) = stored.filter(|t| !t.refresh_token.is_empty()) {
                match self.refresh(challenge.endpoint(), &tokens.refresh_token) {
                    Ok(fresh) => {
                        self.remember(&key, &fresh)?;
                        if let Some(response) = self.retry(build, &fresh.access_token)? {
                            return Ok(response);
                        }
                    }
                    Err(e) => warn!(endpoint = %challenge.endpoint(), error = %e, "token refresh failed"),
                }
            }
        }

        let mut attempt = 0;
        let mut registrations = 0;
        while attempt < LOGIN_ATTEMPTS {
            attempt += 1;
            let creds = self
                .prompt
                .credentials(challenge.endpoint(), &challenge.realm, attempt)?;
            if creds.is_register() {
                if registrations < REGISTRATIONS_PER_REQUEST {
                    registrations += 1;
                    self.register(challenge.endpoint())?;
                    attempt -= 1;
                } else {
                    warn!(
                        endpoint = %challenge.endpoint(),
                        attempt,
                        "already registered an account for this request"
                    );
                }
                continue;
            }
            match self.login(challenge, &creds) {
                Ok(tokens) => {
                    self.remember(&key, &tokens)?;
                    if let Some(response) = self.retry(build, &tokens.access_token)? {
                        return Ok(response);
                    }
                    warn!(endpoint = %challenge.endpoint(), "new token rejected");
                }
                Err(e) => warn!(endpoint = %challenge.endpoint(), attempt, error = %e, "login failed"),
            }
        }

        Err(Error::Auth(format!(
            "{} refused credentials after {LOGIN_ATTEMPTS} attempts",
            challenge.endpoint()
        )))
    }

    /// resend with `token`; `None` if the server challenges again
    fn retry<F>(&self, build: &F, token: &str) -> Result<Option<Response>>
    where
        F: Fn(&Client, Option<&str>) -> RequestBuilder,
    {
        let response = build(&self.client, Some(token)).send()?;
        if challenge_of(&response)?.is_some() {
            return Ok(None);
        }
        self.set_bearer(token);
        Ok(Some(response))
    }

    fn store_get(&self, key: &str) -> Option<TokenPair> {
        self.store.lock().ok().and_then(|s| s.get(key).cloned())
    }

    fn remember(&self, key: &str, tokens: &TokenPair) -> Result<()> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| Error::Auth("auth store poisoned".into()))?;
        store.insert(key.to_string(), tokens.clone());
        store.save()
    }

    fn refresh(&self, endpoint: &str, refresh_token: &str) -> Result<TokenPair> {
        let url = format!("{}/login", endpoint.trim_end_matches('/'));
        debug!(url = %url, "refreshing token");
        let response = self.client.get(&url).bearer_auth(refresh_token).send()?;
        let tokens = parse_tokens(expect_success(response)?)?;
        Ok(TokenPair {
            refresh_token: tokens
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            access_token: tokens.token,
        })
    }

    fn login(&self, challenge: &Challenge, creds: &Credentials) -> Result<TokenPair> {
        let url = format!("{}/login", challenge.endpoint().trim_end_matches('/'));
        let mut body = json!({
            "username": creds.username,
            "password": creds.password,
        });
        if let Some(scope) = &challenge.scope {
            body["scope"] = json!(scope);
        }
        let response = self.client.post(&url).json(&body).send()?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Auth(format!("{url} refused credentials")));
        }
        let tokens = parse_tokens(expect_success(response)?)?;
        info!(endpoint = %challenge.endpoint(), user = %creds.username, "logged in");
        Ok(TokenPair {
            refresh_token: tokens.refresh_token.unwrap_or_else(|| tokens.token.clone()),
            access_token: tokens.token,
        })
    }

    fn register(&self, endpoint: &str) -> Result<()> {
        let registration = self.prompt.registration(endpoint)?;
        let url = format!("{}/accounts", endpoint.trim_end_matches('/'));
        let response = self.client.post(&url).json(&registration).send()?;
        expect_success(response)?;
        info!(email = %registration.email, "account registered, confirm the email before logging in");
        Ok(())
    }
}

fn parse_tokens(response: Response) -> Result<TokenResponse> {
    let url = response.url().to_string();
    let bytes = response.bytes()?;
    serde_json::from_slice(&bytes).map_err(|e| Error::json(url, e))
}

/// the auth challenge of a non-success response, if any
fn challenge_of(response: &Response) -> Result<Option<Challenge>> {
    if response.status().is_success() {
        return Ok(None);
    }
    let Some(header) = response.headers().get(WWW_AUTHENTICATE) else {
        return Ok(None);
    };
    let header = header
        .to_str()
        .map_err(|_| Error::Challenge("header is not valid utf-8".into()))?;
    Challenge::parse(header).map(Some)
}

/// turn a non-2xx response into `Error::HttpStatus`
pub fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let mut message = response.text().unwrap_or_default();
    if message.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    Err(Error::HttpStatus {
        url,
        status: status.as_u16(),
        message,
    })
}

fn build_client(env: &EnvConfig) -> Result<Client> {
    let builder = Client::builder()
        .user_agent(USER_AGENT)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .danger_accept_invalid_certs(env.insecure)
        .timeout(None);
    let builder = match &env.proxy {
        ProxyMode::System => builder,
        ProxyMode::None => builder.no_proxy(),
        ProxyMode::Url(url) => {
            let proxy = reqwest::Proxy::all(url).map_err(|e| Error::InvalidUrl {
                url: url.clone(),
                message: e.to_string(),
            })?;
            builder.proxy(proxy)
        }
    };
    Ok(builder.build()?)
}

/// env pointing at `config_dir`, direct connections
#[cfg(test)]
pub(crate) fn test_env(config_dir: &std::path::Path) -> EnvConfig {
    let dir = config_dir.to_string_lossy().into_owned();
    EnvConfig::from_lookup(move |key| match key {
        "PVR_CONFIG_DIR" => Some(dir.clone()),
        "PVR_HTTP_PROXY" => Some("no".to_string()),
        _ => None,
    })
}
