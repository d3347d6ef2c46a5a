// src/wss.rs
//==================================================================
// rtsess/src/wss.rs - The one persistent gateway connection
//==================================================================
use crate::dat::*;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// =============================================================================
// Errors
// =============================================================================
#[derive(Debug, thiserror::Error)]
pub enum ConnectError
{ #[error("invalid gateway request for {url}: {source}")]
  Request { url: String, source: tokio_tungstenite::tungstenite::Error },
  #[error("websocket handshake with {url} failed: {source}")]
  Handshake { url: String, source: tokio_tungstenite::tungstenite::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError
{ #[error("connection is {0:?}, cannot send")]
  NotOpen(ConnectionState),
  #[error("websocket send failed: {0}")]
  Transport(#[from] tokio_tungstenite::tungstenite::Error),
  #[error("could not encode outbound message: {0}")]
  Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError
{ #[error("connection is {0:?}, cannot receive")]
  NotOpen(ConnectionState),
  #[error("gateway closed the connection: {0}")]
  Closed(String),
  #[error("websocket receive failed: {0}")]
  Transport(#[from] tokio_tungstenite::tungstenite::Error),
  #[error("undecodable frame: {0}")]
  Decode(#[from] serde_json::Error),
}

// =============================================================================
// Frame reassembly
// =============================================================================
/// Collects continuation chunks until the end-of-message flag.
#[derive(Debug, Default)]
pub struct FrameBuffer
{ pending: Option<Vec<u8>>,
}
impl FrameBuffer
{ /// Complete message bytes once `fin` is seen. A lone final chunk is
  /// handed back borrowed.
  pub fn push<'a>(&mut self, chunk: &'a [u8], fin: bool) -> Option<Cow<'a, [u8]>>
  { if let Some(buf) = self.pending.as_mut()
    { buf.extend_from_slice(chunk);
      if !fin
      { return None;
      }
      return self.pending.take().map(Cow::Owned);
    }
    if fin
    { Some(Cow::Borrowed(chunk))
    }
    else
    { self.pending = Some(chunk.to_vec());
      None
    }
  }
  pub fn is_partial(&self) -> bool
  { self.pending.is_some()
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Batch
{ Many(Vec<DecodedMessage>),
  One(Box<DecodedMessage>),
}

/// Decodes one complete frame; the gateway batches messages as a JSON array.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<DecodedMessage>, serde_json::Error>
{ match serde_json::from_slice::<Batch>(bytes)
  { Ok(Batch::Many(v)) => Ok(v),
    Ok(Batch::One(m)) => Ok(vec![*m]),
    // re-run as a plain array so the error names the real problem
    Err(_) => serde_json::from_slice::<Vec<DecodedMessage>>(bytes),
  }
}

// =============================================================================
// SessionConnection
// =============================================================================
pub struct SessionConnection
{ url: String,
  sink: Mutex<WsSink>,
  source: Mutex<(WsSource, FrameBuffer)>,
  state_tx: watch::Sender<ConnectionState>,
  closed: AtomicBool,
}
impl SessionConnection
{ /// Opens the websocket with the `tr_json2` sub-protocol.
  pub async fn connect(url: &str) -> Result<Self, ConnectError>
  { log::debug!("ENTRY! SessionConnection::connect url = {}", url);
    let (state_tx, _) = watch::channel(ConnectionState::Connecting);
    let mut request = url
      .into_client_request()
      .map_err(|source| ConnectError::Request { url: url.to_string(), source })?;
    request.headers_mut().insert
    ( "Sec-WebSocket-Protocol"
    , HeaderValue::from_static(WS_SUBPROTOCOL)
    );
    let (ws_stream, resp) = match connect_async(request).await
    { Ok(pair) => pair,
      Err(source) =>
      { state_tx.send_replace(ConnectionState::Aborted);
        log::debug!("SessionConnection EXIT FAIL - handshake with {} failed: {}", url, source);
        return Err(ConnectError::Handshake { url: url.to_string(), source });
      }
    };
    log::trace!("Handshake response status {} headers {:?}", resp.status(), resp.headers());
    let (sink, source) = ws_stream.split();
    state_tx.send_replace(ConnectionState::Open);
    log::info!("Connected to {} ({})", url, WS_SUBPROTOCOL);
    Ok
    ( SessionConnection
      { url: url.to_string()
      , sink: Mutex::new(sink)
      , source: Mutex::new((source, FrameBuffer::default()))
      , state_tx
      , closed: AtomicBool::new(false)
      }
    )
  }

  pub fn url(&self) -> &str
  { &self.url
  }
  pub fn state(&self) -> ConnectionState
  { *self.state_tx.borrow()
  }
  pub fn watch_state(&self) -> watch::Receiver<ConnectionState>
  { self.state_tx.subscribe()
  }

  /// Serialised: the sink lock is held for the whole frame write.
  pub async fn send(&self, text: &str) -> Result<(), SendError>
  { let state = self.state();
    if state != ConnectionState::Open
    { return Err(SendError::NotOpen(state));
    }
    let mut sink = self.sink.lock().await;
    log::trace!("SEND {}", text);
    if let Err(e) = sink.send(Message::Text(text.to_string().into())).await
    { self.abort(&e);
      return Err(SendError::Transport(e));
    }
    Ok(())
  }

  pub async fn send_json<T: serde::Serialize>(&self, msg: &T) -> Result<(), SendError>
  { let text = serde_json::to_string(msg)?;
    self.send(&text).await
  }

  /// Next complete frame, decoded into its batched messages.
  /// Only the receive loop calls this.
  ///
  /// tungstenite reassembles fragmented messages before handing them
  /// over, so text and binary messages arrive whole and pass through
  /// the frame buffer borrowed. Raw `Frame` values are never yielded on
  /// read; the arm below only keeps the match total.
  pub async fn receive_message(&self) -> Result<Vec<DecodedMessage>, RecvError>
  { let mut guard = self.source.lock().await;
    let (source, frames) = &mut *guard;
    loop
    { let state = self.state();
      if state != ConnectionState::Open
      { return Err(RecvError::NotOpen(state));
      }
      let msg = match source.next().await
      { Some(Ok(msg)) => msg,
        Some(Err(e)) =>
        { self.abort(&e);
          return Err(RecvError::Transport(e));
        }
        None =>
        { self.state_tx.send_replace(ConnectionState::Aborted);
          return Err(RecvError::Closed("stream ended without a close frame".to_string()));
        }
      };
      let decoded = match msg
      { Message::Text(text) => frames.push(text.as_str().as_bytes(), true).map(|b| decode_frame(&b)),
        Message::Binary(bin) => frames.push(&bin, true).map(|b| decode_frame(&b)),
        Message::Frame(frame) =>
        { let fin = frame.header().is_final;
          let payload = frame.into_payload();
          frames.push(&payload, fin).map(|b| decode_frame(&b))
        }
        Message::Ping(_) | Message::Pong(_) => continue,
        Message::Close(frame) =>
        { let reason = frame
            .map(|f| format!("{} {}", f.code, &*f.reason))
            .unwrap_or_else(|| "no close frame".to_string());
          log::warn!("Gateway closed the connection: {}", reason);
          self.state_tx.send_replace(ConnectionState::Closed);
          return Err(RecvError::Closed(reason));
        }
      };
      match decoded
      { Some(Ok(batch)) =>
        { log::trace!("RECV frame with {} message(s)", batch.len());
          return Ok(batch);
        }
        Some(Err(e)) => return Err(RecvError::Decode(e)),
        None => log::trace!("Buffered continuation chunk"),
      }
    }
  }

  /// Idempotent; only the first call sends a close frame.
  pub async fn close(&self)
  { if self.closed.swap(true, Ordering::SeqCst)
    { log::trace!("SessionConnection::close already done");
      return;
    }
    let state = self.state();
    if state.is_terminal()
    { log::debug!("Connection already {:?}, nothing to close", state);
      return;
    }
    self.state_tx.send_replace(ConnectionState::Closing);
    let mut sink = self.sink.lock().await;
    if let Err(e) = sink.send(Message::Close(None)).await
    { log::debug!("Close frame not delivered: {}", e);
    }
    let _ = sink.close().await;
    self.state_tx.send_replace(ConnectionState::Closed);
    log::info!("Connection to {} closed", self.url);
  }

  fn abort(&self, e: &tokio_tungstenite::tungstenite::Error)
  { log::error!("Connection to {} aborted: {}", self.url, e);
    self.state_tx.send_replace(ConnectionState::Aborted);
  }
}
