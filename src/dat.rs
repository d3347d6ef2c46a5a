// src/dat.rs
// =============================================================================
// rtsess/src/dat.rs - Session, token and wire-message types
// =============================================================================
  use serde::{Deserialize, Serialize};
  use serde_json::Value;
  use std::collections::HashMap;
  use std::fmt;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Duration;
  pub(crate) use crate::ser::*; // ← flex deserializers for gateway quirks

// =================================================================
// Public Types
// =================================================================

// -----------------------------------------------------------------
// Settings
// -----------------------------------------------------------------
pub const DEFAULT_AUTH_URL: &str = "https://api.refinitiv.com:443/auth/oauth2/v1/token";
pub const DEFAULT_SCOPE: &str = "trapi.streaming.pricing.read";
pub const DEFAULT_APP_ID: &str = "256";
pub const DEFAULT_POSITION: &str = "127.0.0.1/net";
pub const DEFAULT_RIC: &str = "/TRI.N";
pub const DEFAULT_SERVICE: &str = "ELEKTRON_DD";
pub const WS_SUBPROTOCOL: &str = "tr_json2";
pub const LOGIN_STREAM_ID: i64 = 1;
pub const ITEM_STREAM_ID: i64 = 2;

#[derive(Clone)]
pub struct Credentials
{ pub username: String,
  pub client_id: String,
  pub password: String,
  pub scope: String,
  pub app_id: String,
  pub position: String,
}
impl fmt::Debug for Credentials
{ fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
  { f.debug_struct("Credentials")
      .field("username", &self.username)
      .field("client_id", &self.client_id)
      .field("password", &"[REDACTED]")
      .field("scope", &self.scope)
      .field("app_id", &self.app_id)
      .field("position", &self.position)
      .finish()
  }
}

/// Status-policy knobs for the token endpoint.
#[derive(Debug, Clone)]
pub struct AuthPolicy
{ pub max_redirects: u32,
  pub max_retries: u32,
  pub backoff_base: Duration,
  pub http_timeout: Duration,
}
impl Default for AuthPolicy
{ fn default() -> Self
  { AuthPolicy
    { max_redirects: 5
    , max_retries: 5
    , backoff_base: Duration::from_secs(1)
    , http_timeout: Duration::from_secs(30)
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProxyInfo
{ pub host: String,
  pub port: u16,
}

/// Everything needed to bring one session up. Built by the binary from its
/// command line, or by hand when embedding the library.
#[derive(Debug, Clone)]
pub struct SessionSettings
{ pub auth_url: String,
  pub host: String,
  pub port: u16,
  pub ws_path: String,
  /// wss:// when true; plain ws:// is for local gateways
  pub tls: bool,
  pub creds: Credentials,
  pub subscription: Subscription,
  pub proxy: Option<ProxyInfo>,
  pub new_password: Option<String>,
  pub policy: AuthPolicy,
  pub renew_fraction: f64,
  pub min_renew_sleep: Duration,
}
impl SessionSettings
{ pub fn new(host: impl Into<String>, creds: Credentials) -> Self
  { SessionSettings
    { auth_url: DEFAULT_AUTH_URL.to_string()
    , host: host.into()
    , port: 443
    , ws_path: "/WebSocket".to_string()
    , tls: true
    , creds
    , subscription: Subscription::default()
    , proxy: None
    , new_password: None
    , policy: AuthPolicy::default()
    , renew_fraction: 0.90
    , min_renew_sleep: Duration::from_secs(1)
    }
  }
  pub fn ws_url(&self) -> String
  { let scheme = if self.tls { "wss" } else { "ws" };
    format!("{}://{}:{}{}", scheme, self.host, self.port, self.ws_path)
  }
}

// -----------------------------------------------------------------
// Token / session state
// -----------------------------------------------------------------
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenState
{ pub access_token: String,
  pub refresh_token: String,
  pub expires_in_ms: u64,
  /// expiry recorded by the most recent password grant
  pub original_expires_in_ms: u64,
}
impl TokenState
{ pub fn expiry_drifted(&self) -> bool
  { self.expires_in_ms != self.original_expires_in_ms
  }
}
impl fmt::Debug for TokenState
{ fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
  { f.debug_struct("TokenState")
      .field("access_token", &redact(&self.access_token))
      .field("refresh_token", &redact(&self.refresh_token))
      .field("expires_in_ms", &self.expires_in_ms)
      .field("original_expires_in_ms", &self.original_expires_in_ms)
      .finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState
{ Connecting,
  Open,
  Closing,
  Closed,
  Aborted,
}
impl ConnectionState
{ pub fn is_terminal(self) -> bool
  { matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
  }
}

/// Flips false→true once, on the first good login refresh.
#[derive(Debug, Default)]
pub struct SessionFlags
{ logged_in: AtomicBool,
}
impl SessionFlags
{ pub fn logged_in(&self) -> bool
  { self.logged_in.load(Ordering::SeqCst)
  }
  /// Returns true only for the caller that performed the transition.
  pub fn mark_logged_in(&self) -> bool
  { self.logged_in
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription
{ pub ric: String,
  pub service: String,
}
impl Default for Subscription
{ fn default() -> Self
  { Subscription { ric: DEFAULT_RIC.to_string(), service: DEFAULT_SERVICE.to_string() }
  }
}

// -----------------------------------------------------------------------------
// Token endpoint response
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse
{ pub access_token: String,
  pub refresh_token: String,
  #[serde(deserialize_with = "de_u64_flex")]
  pub expires_in: u64,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

// -----------------------------------------------------------------------------
// Inbound messages
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MsgType
{ Refresh,
  Update,
  Status,
  Ping,
  Pong,
  Other(String),
  #[default]
  Missing,
}
impl From<String> for MsgType
{ fn from(s: String) -> Self
  { match s.as_str()
    { "Refresh" => MsgType::Refresh
    , "Update" => MsgType::Update
    , "Status" => MsgType::Status
    , "Ping" => MsgType::Ping
    , "Pong" => MsgType::Pong
    , _ => MsgType::Other(s)
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain
{ Login,
  MarketPrice,
  Other(String),
}
impl From<String> for Domain
{ fn from(s: String) -> Self
  { match s.as_str()
    { "Login" => Domain::Login
    , "MarketPrice" => Domain::MarketPrice
    , _ => Domain::Other(s)
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct StreamState
{ #[serde(rename = "Stream", default, skip_serializing_if = "Option::is_none")]
  pub stream: Option<String>,
  #[serde(rename = "Data", default, skip_serializing_if = "Option::is_none")]
  pub data: Option<String>,
  #[serde(rename = "Code", default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(rename = "Text", default, skip_serializing_if = "Option::is_none")]
  pub text: Option<String>,
}
impl StreamState
{ /// Stream field present and anything but "Open".
  pub fn stream_closed(&self) -> bool
  { matches!(self.stream.as_deref(), Some(s) if s != "Open")
  }
  pub fn data_ok(&self) -> bool
  { self.data.as_deref() == Some("Ok")
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MsgKey
{ #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(rename = "Service", default, deserialize_with = "de_opt_string_or_number", skip_serializing_if = "Option::is_none")]
  pub service: Option<String>,
  #[serde(rename = "NameType", default, skip_serializing_if = "Option::is_none")]
  pub name_type: Option<String>,
  #[serde(rename = "Elements", default, skip_serializing_if = "Option::is_none")]
  pub elements: Option<Value>,
}

/// One logical message out of a (possibly batched) frame.
#[derive(Debug, Clone, Deserialize)]
pub struct DecodedMessage
{ #[serde(rename = "Type", default, deserialize_with = "de_tag")]
  pub msg_type: MsgType,
  #[serde(rename = "Domain", default, deserialize_with = "de_opt_tag")]
  pub domain: Option<Domain>,
  #[serde(rename = "ID", default)]
  pub id: Option<i64>,
  #[serde(rename = "Key", default)]
  pub key: Option<MsgKey>,
  #[serde(rename = "State", default)]
  pub state: Option<StreamState>,
  #[serde(rename = "Elements", default)]
  pub elements: Option<Value>,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}
impl DecodedMessage
{ pub fn is_login(&self) -> bool
  { self.domain == Some(Domain::Login)
  }
}

// -----------------------------------------------------------------------------
// Outbound messages
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize)]
pub struct LoginElements
{ #[serde(rename = "ApplicationId")]
  pub application_id: String,
  #[serde(rename = "Position")]
  pub position: String,
  #[serde(rename = "AuthenticationToken")]
  pub authentication_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginKey
{ #[serde(rename = "NameType")]
  pub name_type: &'static str,
  #[serde(rename = "Elements")]
  pub elements: LoginElements,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest
{ #[serde(rename = "ID")]
  pub id: i64,
  #[serde(rename = "Domain")]
  pub domain: &'static str,
  #[serde(rename = "Key")]
  pub key: LoginKey,
  /// Some(false) on a credential update over an open login stream
  #[serde(rename = "Refresh", skip_serializing_if = "Option::is_none")]
  pub refresh: Option<bool>,
}
impl LoginRequest
{ pub fn new(creds: &Credentials, access_token: &str, is_refresh: bool) -> Self
  { LoginRequest
    { id: LOGIN_STREAM_ID
    , domain: "Login"
    , key: LoginKey
      { name_type: "AuthnToken"
      , elements: LoginElements
        { application_id: creds.app_id.clone()
        , position: creds.position.clone()
        , authentication_token: access_token.to_string()
        }
      }
    , refresh: if is_refresh { Some(false) } else { None }
    }
  }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemKey
{ #[serde(rename = "Name")]
  pub name: String,
  #[serde(rename = "Service")]
  pub service: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemRequest
{ #[serde(rename = "ID")]
  pub id: i64,
  #[serde(rename = "Key")]
  pub key: ItemKey,
}
impl ItemRequest
{ pub fn new(sub: &Subscription) -> Self
  { ItemRequest
    { id: ITEM_STREAM_ID
    , key: ItemKey { name: sub.ric.clone(), service: sub.service.clone() }
    }
  }
}

pub const PONG: &str = r#"{"Type":"Pong"}"#;

// -----------------------------------------------------------------------------
// Logging helper
// -----------------------------------------------------------------------------
/// First and last four characters only; short secrets are fully masked.
pub fn redact(secret: &str) -> String
{ let n = secret.chars().count();
  if n <= 8
  { return "*".repeat(n);
  }
  let head: String = secret.chars().take(4).collect();
  let tail: String = secret.chars().skip(n - 4).collect();
  format!("{}...{}", head, tail)
}
