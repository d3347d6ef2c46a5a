// src/tok.rs
//==================================================================
// rtsess/src/tok.rs - Token store and token-endpoint client
//==================================================================
use crate::dat::*;
use rand::Rng;
use reqwest::{header, redirect, Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use url::Url;

// =============================================================================
// Errors
// =============================================================================
#[derive(Debug, thiserror::Error)]
pub enum AuthFailure
{ #[error("token request transport error: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("token request rejected ({status}): {body}")]
  Rejected { status: u16, body: String },
  #[error("token request forbidden ({status}): {body}")]
  Forbidden { status: u16, body: String },
  #[error("redirect ({status}) without a usable Location header")]
  MissingLocation { status: u16 },
  #[error("gave up after {limit} redirects")]
  TooManyRedirects { limit: u32 },
  #[error("gave up after {attempts} attempts, last status {status}")]
  RetriesExhausted { attempts: u32, status: u16 },
  #[error("malformed token response: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("invalid token endpoint URL: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[error("password has already been changed once")]
  PasswordAlreadyChanged,
  #[error("token response carried an empty access_token")]
  EmptyAccessToken,
}

// =============================================================================
// TokenStore
// =============================================================================
#[derive(Debug, Default)]
struct Stored
{ state: TokenState,
  issued_at: Option<Instant>,
}

/// Current credential state. The renewal path is the only writer.
#[derive(Debug, Default)]
pub struct TokenStore
{ inner: RwLock<Stored>,
}
impl TokenStore
{ pub fn new() -> Self
  { Self::default()
  }
  pub async fn snapshot(&self) -> TokenState
  { self.inner.read().await.state.clone()
  }
  pub async fn access_token(&self) -> String
  { self.inner.read().await.state.access_token.clone()
  }
  pub async fn refresh_token(&self) -> String
  { self.inner.read().await.state.refresh_token.clone()
  }
  pub async fn expires_in(&self) -> Duration
  { Duration::from_millis(self.inner.read().await.state.expires_in_ms)
  }
  /// `fraction` of the current lifetime, never less than `floor`.
  pub async fn renew_after(&self, fraction: f64, floor: Duration) -> Duration
  { renewal_delay(self.inner.read().await.state.expires_in_ms, fraction, floor)
  }
  /// True once `fraction` of the lifetime has elapsed, or if nothing was ever issued.
  pub async fn is_stale(&self, fraction: f64) -> bool
  { let guard = self.inner.read().await;
    match guard.issued_at
    { None => true,
      Some(at) =>
      { let budget = Duration::from_millis(guard.state.expires_in_ms).mul_f64(fraction.clamp(0.0, 1.0));
        at.elapsed() >= budget
      }
    }
  }
  /// Replaces the token fields in one write; the baseline moves only on password grants.
  async fn apply(&self, resp: &TokenResponse, grant: Grant) -> TokenState
  { let expires_in_ms = resp.expires_in.saturating_mul(1000);
    let mut guard = self.inner.write().await;
    guard.state.access_token = resp.access_token.clone();
    guard.state.refresh_token = resp.refresh_token.clone();
    guard.state.expires_in_ms = expires_in_ms;
    if grant == Grant::Password
    { guard.state.original_expires_in_ms = expires_in_ms;
    }
    guard.issued_at = Some(Instant::now());
    guard.state.clone()
  }
}

pub fn renewal_delay(expires_in_ms: u64, fraction: f64, floor: Duration) -> Duration
{ Duration::from_millis(expires_in_ms)
    .mul_f64(fraction.clamp(0.0, 1.0))
    .max(floor)
}

// =============================================================================
// Status policy
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant
{ Password,
  Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step
{ Accept,
  Redirect,
  FallBackToPassword,
  Reject,
  Forbid,
  Retry,
}

pub fn next_step(status: StatusCode, grant: Grant) -> Step
{ match status.as_u16()
  { 200..=299 => Step::Accept
  , 301 | 302 | 307 | 308 => Step::Redirect
  , 400 | 401 if grant == Grant::Refresh => Step::FallBackToPassword
  , 400 | 401 => Step::Reject
  , 403 | 451 => Step::Forbid
  , _ => Step::Retry
  }
}

// =============================================================================
// AuthClient
// =============================================================================
pub struct AuthClient
{ http: Client,
  auth_url: String,
  creds: Mutex<Credentials>,
  password_changed: AtomicBool,
  store: Arc<TokenStore>,
  policy: AuthPolicy,
  // one grant in flight at a time
  grant_lock: Mutex<()>,
}
impl AuthClient
{ pub fn new(settings: &SessionSettings, store: Arc<TokenStore>) -> Result<Self, AuthFailure>
  { let mut builder = Client::builder()
      .redirect(redirect::Policy::none())
      .timeout(settings.policy.http_timeout);
    if let Some(proxy) = &settings.proxy
    { log::debug!("Routing token requests through proxy {}:{}", proxy.host, proxy.port);
      builder = builder.proxy(reqwest::Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))?);
    }
    Url::parse(&settings.auth_url)?;
    Ok
    ( AuthClient
      { http: builder.build()?
      , auth_url: settings.auth_url.clone()
      , creds: Mutex::new(settings.creds.clone())
      , password_changed: AtomicBool::new(false)
      , store
      , policy: settings.policy.clone()
      , grant_lock: Mutex::new(())
      }
    )
  }

  pub fn store(&self) -> Arc<TokenStore>
  { self.store.clone()
  }

  pub async fn credentials(&self) -> Credentials
  { self.creds.lock().await.clone()
  }

  pub async fn authenticate
  ( &self
  , use_previous_refresh_token: bool
  , redirect_url: Option<&str>
  ) -> Result<TokenState, AuthFailure>
  { let _in_flight = self.grant_lock.lock().await;
    let grant = if use_previous_refresh_token { Grant::Refresh } else { Grant::Password };
    self.run_grant(grant, redirect_url, None).await
  }

  /// One-time password change, carried on a password grant.
  pub async fn change_password(&self, new_password: &str) -> Result<TokenState, AuthFailure>
  { let _in_flight = self.grant_lock.lock().await;
    if self.password_changed.load(Ordering::SeqCst)
    { return Err(AuthFailure::PasswordAlreadyChanged);
    }
    log::info!("Changing password for the configured user...");
    let state = self.run_grant(Grant::Password, None, Some(new_password)).await?;
    self.creds.lock().await.password = new_password.to_string();
    self.password_changed.store(true, Ordering::SeqCst);
    log::info!("Password changed; later password grants use the new password");
    Ok(state)
  }

  async fn run_grant
  ( &self
  , mut grant: Grant
  , redirect_url: Option<&str>
  , new_password: Option<&str>
  ) -> Result<TokenState, AuthFailure>
  { let mut url = Url::parse(redirect_url.unwrap_or(&self.auth_url))?;
    let mut redirects = 0u32;
    let mut retries = 0u32;
    loop
    { let params = self.grant_params(&mut grant, new_password).await;
      log::debug!("Sending {:?} grant to {}", grant, url);
      let resp = self.http
        .post(url.clone())
        .header(header::USER_AGENT, "rtsess/0.1")
        .form(&params)
        .send()
        .await?;
      let status = resp.status();
      log::trace!("Token endpoint answered {} for {:?} grant", status, grant);
      match next_step(status, grant)
      { Step::Accept =>
        { let body = resp.text().await?;
          let parsed: TokenResponse = serde_json::from_str(&body)?;
          if parsed.access_token.is_empty()
          { log::error!("Token endpoint answered {} without an access token", status);
            return Err(AuthFailure::EmptyAccessToken);
          }
          if !parsed.extra.is_empty()
          { log::trace!("Token response extra fields: {:?}", parsed.extra.keys().collect::<Vec<_>>());
          }
          let state = self.store.apply(&parsed, grant).await;
          log::info!
          ( "OK {:?} grant! access token {} expires in {} ms"
          , grant, redact(&state.access_token), state.expires_in_ms
          );
          return Ok(state);
        }
        Step::Redirect =>
        { let location = resp.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthFailure::MissingLocation { status: status.as_u16() })?;
          let next = url.join(location)?;
          redirects += 1;
          if redirects > self.policy.max_redirects
          { log::error!("Token endpoint redirect chain exceeded {} hops", self.policy.max_redirects);
            return Err(AuthFailure::TooManyRedirects { limit: self.policy.max_redirects });
          }
          log::warn!("Token endpoint redirected ({}) to {}", status, next);
          url = next;
        }
        Step::FallBackToPassword =>
        { log::warn!("Refresh grant refused ({}), retrying as password grant", status);
          grant = Grant::Password;
          url = Url::parse(&self.auth_url)?;
        }
        Step::Reject =>
        { let body = resp.text().await.unwrap_or_default();
          log::error!("Password grant refused ({}): {}", status, body);
          return Err(AuthFailure::Rejected { status: status.as_u16(), body });
        }
        Step::Forbid =>
        { let body = resp.text().await.unwrap_or_default();
          log::error!("Token endpoint forbids access ({}): {}", status, body);
          return Err(AuthFailure::Forbidden { status: status.as_u16(), body });
        }
        Step::Retry =>
        { retries += 1;
          if retries > self.policy.max_retries
          { log::error!("Token endpoint still failing ({}) after {} attempts", status, retries);
            return Err(AuthFailure::RetriesExhausted { attempts: retries, status: status.as_u16() });
          }
          let backoff = self.backoff(retries);
          log::warn!("Token endpoint returned {} (attempt {}), retrying in {:?}", status, retries, backoff);
          tokio::time::sleep(backoff).await;
        }
      }
    }
  }

  /// Form fields for `grant`; an empty refresh token demotes it to a password grant.
  async fn grant_params(&self, grant: &mut Grant, new_password: Option<&str>) -> Vec<(&'static str, String)>
  { let creds = self.creds.lock().await.clone();
    if *grant == Grant::Refresh
    { let refresh = self.store.refresh_token().await;
      if !refresh.is_empty()
      { return vec!
        [ ("username", creds.username)
        , ("client_id", creds.client_id)
        , ("refresh_token", refresh)
        , ("grant_type", "refresh_token".to_string())
        ];
      }
      log::debug!("No refresh token held yet, using password grant");
      *grant = Grant::Password;
    }
    let mut params = vec!
    [ ("username", creds.username)
    , ("client_id", creds.client_id)
    , ("password", creds.password)
    , ("grant_type", "password".to_string())
    , ("takeExclusiveSignOnControl", "true".to_string())
    , ("scope", creds.scope)
    ];
    if let Some(np) = new_password
    { params.push(("newPassword", np.to_string()));
    }
    params
  }

  fn backoff(&self, attempt: u32) -> Duration
  { let base = self.policy.backoff_base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(6)));
    let jitter_cap = (base.as_millis() / 4) as u64;
    let jitter = if jitter_cap > 0 { rand::thread_rng().gen_range(0..=jitter_cap) } else { 0 };
    base + Duration::from_millis(jitter)
  }
}
