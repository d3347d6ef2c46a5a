// src/rtr.rs
//==================================================================
// rtsess/src/rtr.rs - What to do about each inbound message
//==================================================================
use crate::dat::*;

#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction
{ None,
  SendSubscription(ItemRequest),
  SendPong,
  FatalClose(String),
}

/// Pure dispatch on `(Type, Domain)`; the only side effect is the
/// logged-in transition on `SessionFlags`.
#[derive(Debug, Clone)]
pub struct MessageRouter
{ subscription: Subscription,
}
impl MessageRouter
{ pub fn new(subscription: Subscription) -> Self
  { MessageRouter { subscription }
  }

  pub fn subscription(&self) -> &Subscription
  { &self.subscription
  }

  pub fn handle(&self, msg: &DecodedMessage, flags: &SessionFlags) -> RouterAction
  { match (&msg.msg_type, msg.is_login())
    { (MsgType::Ping, _) =>
      { log::trace!("Ping received, answering with Pong");
        RouterAction::SendPong
      }
      (MsgType::Refresh, true) =>
      { if let Some(state) = msg.state.as_ref().filter(|s| s.stream_closed())
        { let reason = format!("login stream closed by gateway: {}", describe(state));
          log::error!("{}", reason);
          return RouterAction::FatalClose(reason);
        }
        let accepted = msg.state.as_ref().map_or(true, |s| s.data_ok());
        if !accepted
        { log::warn!("Login refresh without Data=Ok: {:?}", msg.state);
          return RouterAction::None;
        }
        if flags.mark_logged_in()
        { log::info!
          ( "Logged in; subscribing to {} on {}"
          , self.subscription.ric, self.subscription.service
          );
          RouterAction::SendSubscription(ItemRequest::new(&self.subscription))
        }
        else
        { log::debug!("Login refresh acknowledged");
          RouterAction::None
        }
      }
      (MsgType::Status, true) =>
      { match msg.state.as_ref().filter(|s| s.stream_closed())
        { Some(state) =>
          { let reason = format!("login stream status: {}", describe(state));
            log::error!("{}", reason);
            RouterAction::FatalClose(reason)
          }
          None =>
          { log::debug!("Login status: {:?}", msg.state);
            RouterAction::None
          }
        }
      }
      _ => RouterAction::None,
    }
  }
}

fn describe(state: &StreamState) -> String
{ format!
  ( "Stream={} Data={} Text={}"
  , state.stream.as_deref().unwrap_or("-")
  , state.data.as_deref().unwrap_or("-")
  , state.text.as_deref().unwrap_or("-")
  )
}
