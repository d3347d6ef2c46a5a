// src/lib.rs
// ==================================================================
// rtsess/src/lib.rs - Public API with flat re-exports
// ==================================================================
pub mod dat;
pub mod ser;
pub mod tok;
pub mod wss;
pub mod rtr;
pub mod bot;

// ------------------------------------------------------------------
// Public re-exports – flat, ergonomic API
// Users can do: use rtsess::{SessionSettings, fn_run_session, ...};
// ------------------------------------------------------------------

// Lifecycle & config
pub use bot::
{   CoreConfig
  , CoreError
  , fn_run_session
  , RenewalScheduler
  , Shutdown
};

// Components
pub use tok::{AuthClient, AuthFailure, Grant, Step, TokenStore, next_step, renewal_delay};
pub use wss::{SessionConnection, ConnectError, SendError, RecvError, FrameBuffer, decode_frame};
pub use rtr::{MessageRouter, RouterAction};

// Data types
pub use dat::
{ // ===== SETTINGS =====
    SessionSettings
  , Credentials
  , AuthPolicy
  , ProxyInfo
  , Subscription
  // ===== SESSION STATE =====
  , TokenState
  , ConnectionState
  , SessionFlags
  // ===== WIRE =====
  , DecodedMessage
  , MsgType
  , Domain
  , MsgKey
  , StreamState
  , LoginRequest
  , ItemRequest
  , PONG
  , redact
};


/// Convenience type for the market-data channel: `Sender<DecodedMessage>`
pub type StreamTx = tokio::sync::mpsc::Sender<dat::DecodedMessage>;
