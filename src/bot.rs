// src/bot.rs
//==================================================================
// rtsess/src/bot.rs - Session lifecycle: renewal loop, receive loop, shutdown
//==================================================================
use crate::dat::*;
use crate::rtr::*;
use crate::tok::*;
use crate::wss::*;
use crate::StreamTx;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
// =============================================================================
// External Types (for API usage)
// =============================================================================
#[derive(Debug, Clone)]
pub enum CoreError
{   OAuth(String)
  , WebSocket(String)
  , StreamClosed(String)
  , ParseFailure(String)
  , ParseWarning(String)
  , Unrecoverable(String)
}
pub struct CoreConfig
{   pub error_tx: mpsc::UnboundedSender<CoreError>
  , pub shutdown_rx: mpsc::Receiver<String>
  , pub data_tx: Option<StreamTx>
}

// =============================================================================
// Shutdown: one signal, raised once, seen by every loop
// =============================================================================
#[derive(Debug, Clone)]
pub struct Shutdown
{ tx: Arc<watch::Sender<bool>>,
  fired: Arc<AtomicBool>,
}
impl Default for Shutdown
{ fn default() -> Self
  { let (tx, _) = watch::channel(false);
    Shutdown { tx: Arc::new(tx), fired: Arc::new(AtomicBool::new(false)) }
  }
}
impl Shutdown
{ pub fn new() -> Self
  { Self::default()
  }
  /// True only for the first caller.
  pub fn trigger(&self, reason: &str) -> bool
  { if self.fired.swap(true, Ordering::SeqCst)
    { log::trace!("Shutdown already raised, ignoring [{}]", reason);
      return false;
    }
    log::info!("Shutdown raised: [{}]", reason);
    self.tx.send_replace(true);
    true
  }
  pub fn is_triggered(&self) -> bool
  { self.fired.load(Ordering::SeqCst)
  }
  pub async fn wait(&self)
  { let mut rx = self.tx.subscribe();
    let _ = rx.wait_for(|fired| *fired).await;
  }
  /// false when woken by shutdown instead of the timer
  pub async fn sleep(&self, duration: Duration) -> bool
  { tokio::select!
    { _ = tokio::time::sleep(duration) => true,
      _ = self.wait() => false,
    }
  }
}

// =============================================================================
// RenewalScheduler
// =============================================================================
pub struct RenewalScheduler
{ auth: Arc<AuthClient>,
  conn: Arc<SessionConnection>,
  flags: Arc<SessionFlags>,
  shutdown: Shutdown,
  fraction: f64,
  floor: Duration,
}
impl RenewalScheduler
{ pub fn new
  ( auth: Arc<AuthClient>
  , conn: Arc<SessionConnection>
  , flags: Arc<SessionFlags>
  , shutdown: Shutdown
  , fraction: f64
  , floor: Duration
  ) -> Self
  { RenewalScheduler { auth, conn, flags, shutdown, fraction, floor }
  }

  pub async fn run(self) -> Result<()>
  { log::debug!("RENEWAL LOOP STARTED | fraction={} floor={:?}", self.fraction, self.floor);
    loop
    { let wait = self.auth.store().renew_after(self.fraction, self.floor).await;
      log::debug!("Next token renewal in {:?}", wait);
      if !self.shutdown.sleep(wait).await
      { log::debug!("RENEWAL LOOP: GOOD EXIT - shutdown");
        return Ok(());
      }
      self.check_connection()?;
      if self.flags.logged_in()
      { // dropping the renewal cancels its request and any retry backoff
        tokio::select!
        { res = self.renew_once() => { res?; }
          _ = self.shutdown.wait() =>
          { log::debug!("RENEWAL LOOP: GOOD EXIT - shutdown during renewal");
            return Ok(());
          }
        }
      }
      else
      { log::debug!("Not logged in yet, skipping this renewal cycle");
      }
      self.check_connection()?;
    }
  }

  /// Refresh grant, full grant on expiry drift, then login re-sent as a refresh.
  pub async fn renew_once(&self) -> Result<TokenState>
  { let mut state = self.auth
      .authenticate(true, None)
      .await
      .context("token refresh failed")?;
    if state.expiry_drifted()
    { log::warn!
      ( "Token lifetime changed from {} ms to {} ms, re-authenticating with password"
      , state.original_expires_in_ms, state.expires_in_ms
      );
      state = self.auth
        .authenticate(false, None)
        .await
        .context("full re-authentication after expiry change failed")?;
    }
    let creds = self.auth.credentials().await;
    self.conn
      .send_json(&LoginRequest::new(&creds, &state.access_token, true))
      .await
      .context("failed to re-send login")?;
    log::info!("Login refreshed with token {}", redact(&state.access_token));
    Ok(state)
  }

  fn check_connection(&self) -> Result<()>
  { let state = self.conn.state();
    if state == ConnectionState::Aborted
    { anyhow::bail!("connection to {} aborted", self.conn.url());
    }
    Ok(())
  }
}

// =============================================================================
// Receive loop
// =============================================================================
pub(crate) async fn receive_loop
( conn: Arc<SessionConnection>
, router: MessageRouter
, flags: Arc<SessionFlags>
, shutdown: Shutdown
, mut data_tx: Option<StreamTx>
, error_tx: mpsc::UnboundedSender<CoreError>
) -> Result<()>
{ log::debug!("RECEIVE LOOP STARTED | url={}", conn.url());
  loop
  { let received = tokio::select!
    { _ = shutdown.wait() =>
      { log::debug!("RECEIVE LOOP: GOOD EXIT - shutdown");
        return Ok(());
      }
      res = conn.receive_message() => res
    };
    let batch = match received
    { Ok(batch) => batch,
      Err(RecvError::Decode(e)) =>
      { let msg = format!("dropping undecodable frame: {e}");
        log::warn!("{msg}");
        let _ = error_tx.send(CoreError::ParseFailure(msg));
        continue;
      }
      Err(e) =>
      { let msg = format!("receive failed: {e}");
        log::debug!("RECEIVE LOOP EXIT FAIL - {msg}");
        let _ = error_tx.send(CoreError::WebSocket(msg.clone()));
        return Err(anyhow::anyhow!(msg));
      }
    };
    for msg in batch
    { match router.handle(&msg, &flags)
      { RouterAction::SendPong =>
        { conn.send(PONG).await.context("failed to answer ping")?;
        }
        RouterAction::SendSubscription(req) =>
        { conn.send_json(&req).await.context("failed to send item request")?;
        }
        RouterAction::FatalClose(reason) =>
        { let _ = error_tx.send(CoreError::StreamClosed(reason.clone()));
          return Err(anyhow::anyhow!(reason));
        }
        RouterAction::None if msg.is_login() || msg.msg_type == MsgType::Pong => {}
        RouterAction::None if msg.state.as_ref().is_some_and(|s| s.stream_closed()) =>
        { let reason = format!
          ( "item stream {:?} closed by gateway: {:?}"
          , msg.id, msg.state
          );
          log::error!("RECEIVE LOOP EXIT FAIL - {reason}");
          let _ = error_tx.send(CoreError::StreamClosed(reason.clone()));
          return Err(anyhow::anyhow!(reason));
        }
        RouterAction::None =>
        { if let MsgType::Other(t) = &msg.msg_type
          { let _ = error_tx.send(CoreError::ParseWarning(format!("unrecognised message type: {t}")));
          }
          forward(&mut data_tx, msg).await;
        }
      }
    }
  }
}

async fn forward(data_tx: &mut Option<StreamTx>, msg: DecodedMessage)
{ let Some(tx) = data_tx.as_ref() else
  { log::debug!("Market data (no consumer): {:?} id={:?}", msg.msg_type, msg.id);
    return;
  };
  if tx.send(msg).await.is_err()
  { log::warn!("Market data consumer went away, no longer forwarding");
    *data_tx = None;
  }
}

// =============================================================================
// Orchestrator
// =============================================================================
pub async fn fn_run_session
( settings: SessionSettings
, config: CoreConfig
) -> Result<()>
{ let CoreConfig { error_tx, mut shutdown_rx, data_tx } = config;
  log::debug!("ENTRY! fn_run_session host={} ric={}", settings.host, settings.subscription.ric);
  let shutdown = Shutdown::new();
  // external trigger → shared signal
  let ext = shutdown.clone();
  let trigger_handle = tokio::spawn
  ( async move
    { tokio::select!
      { res = shutdown_rx.recv() =>
        { ext.trigger(res.as_deref().unwrap_or("shutdown channel dropped"));
        }
        _ = ext.wait() => {}
      }
    }
  );
  let result = run_phases(&settings, &shutdown, data_tx, error_tx).await;
  shutdown.trigger("session finished");
  let _ = trigger_handle.await;
  match &result
  { Ok(()) => log::info!("Session ended cleanly"),
    Err(e) => log::error!("Session ended with failure: {e:#}"),
  }
  result
}

async fn run_phases
( settings: &SessionSettings
, shutdown: &Shutdown
, data_tx: Option<StreamTx>
, error_tx: mpsc::UnboundedSender<CoreError>
) -> Result<()>
{ // ------------------------------------------------------------
  log::debug!("SESSION 1. Authenticating");
  // ------------------------------------------------------------
  let store = Arc::new(TokenStore::new());
  let auth = Arc::new
  ( AuthClient::new(settings, store)
      .map_err(|e| report(&error_tx, CoreError::OAuth, "token client setup failed", e))?
  );
  let first = tokio::select!
  { res = initial_grant(&auth, settings) => res
      .map_err(|e| report(&error_tx, CoreError::OAuth, "initial authentication failed", e))?,
    _ = shutdown.wait() => return Ok(()),
  };
  // ------------------------------------------------------------
  log::debug!("SESSION 2. Connecting");
  // ------------------------------------------------------------
  let ws_url = settings.ws_url();
  let conn = tokio::select!
  { res = SessionConnection::connect(&ws_url) => Arc::new
    ( res.map_err(|e| report(&error_tx, CoreError::WebSocket, "connect failed", e))?
    ),
    _ = shutdown.wait() => return Ok(()),
  };
  let result = run_connected(settings, shutdown, auth, conn.clone(), first, data_tx, error_tx).await;
  // ------------------------------------------------------------
  log::debug!("SESSION 5. Teardown");
  // ------------------------------------------------------------
  shutdown.trigger("tearing down connection");
  conn.close().await;
  result
}

async fn run_connected
( settings: &SessionSettings
, shutdown: &Shutdown
, auth: Arc<AuthClient>
, conn: Arc<SessionConnection>
, first: TokenState
, data_tx: Option<StreamTx>
, error_tx: mpsc::UnboundedSender<CoreError>
) -> Result<()>
{ // ------------------------------------------------------------
  log::debug!("SESSION 3. Login");
  // ------------------------------------------------------------
  let creds = auth.credentials().await;
  conn.send_json(&LoginRequest::new(&creds, &first.access_token, false))
    .await
    .map_err(|e| report(&error_tx, CoreError::WebSocket, "login send failed", e))?;
  // ------------------------------------------------------------
  log::debug!("SESSION 4. Receive + renewal");
  // ------------------------------------------------------------
  let flags = Arc::new(SessionFlags::default());
  let scheduler = RenewalScheduler::new
  ( auth
  , conn.clone()
  , flags.clone()
  , shutdown.clone()
  , settings.renew_fraction
  , settings.min_renew_sleep
  );
  let renew_shutdown = shutdown.clone();
  let renew_error_tx = error_tx.clone();
  let renew_handle = tokio::spawn
  ( async move
    { let res = scheduler.run().await;
      if let Err(e) = &res
      { let _ = renew_error_tx.send(CoreError::OAuth(format!("{e:#}")));
        renew_shutdown.trigger("token renewal failed");
      }
      res
    }
  );
  let router = MessageRouter::new(settings.subscription.clone());
  let recv_result = receive_loop(conn, router, flags, shutdown.clone(), data_tx, error_tx.clone()).await;
  shutdown.trigger(if recv_result.is_ok() { "receive loop stopped" } else { "receive loop failed" });
  let renew_result = match renew_handle.await
  { Ok(res) => res,
    Err(e) =>
    { let msg = format!("renewal task panicked: {e}");
      let _ = error_tx.send(CoreError::Unrecoverable(msg.clone()));
      Err(anyhow::anyhow!(msg))
    }
  };
  recv_result.and(renew_result)
}

async fn initial_grant(auth: &AuthClient, settings: &SessionSettings) -> Result<TokenState, AuthFailure>
{ match settings.new_password.as_deref()
  { Some(np) => auth.change_password(np).await,
    None => auth.authenticate(false, None).await,
  }
}

fn report<E: std::fmt::Display>
( error_tx: &mpsc::UnboundedSender<CoreError>
, kind: fn(String) -> CoreError
, what: &str
, e: E
) -> anyhow::Error
{ let msg = format!("{what}: {e}");
  log::error!("{msg}");
  let _ = error_tx.send(kind(msg.clone()));
  anyhow::anyhow!(msg)
}
