//rtsess/src/ser.rs - seralization functions
// src/ser.rs
use serde::{de::{Deserializer, Visitor}, Deserialize};
use serde_json::Value;
use std::fmt;

/// Flex u64: accepts int, whole float, or numeric string → u64
/// (the token endpoint sends `"expires_in":"300"`)
pub(crate) fn de_u64_flex<'de, D>(deserializer: D)
-> Result<u64, D::Error>
where D: Deserializer<'de>,
{ struct U64FlexVisitor;
  impl<'de> Visitor<'de> for U64FlexVisitor
  { type Value = u64;
    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result
    { f.write_str("u64|non-negative i64|string representation of an integer")
    }
    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    { Ok(v)
    }
    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E>
    { u64::try_from(v).map_err(|_| E::custom(format!("negative value: {v}")))
    }
    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E>
    { if v.is_finite() && v >= 0.0 && v.fract() == 0.0
      { Ok(v as u64)
      } else
      { Err(E::custom(format!("not a whole non-negative number: {v}")))
      }
    }
    fn visit_str<E: serde::de::Error>(self, v: &str)
    -> Result<Self::Value, E>
    { v.trim().parse::<u64>().map_err(serde::de::Error::custom)
    }
  }
  deserializer.deserialize_any(U64FlexVisitor)
}

pub(crate) fn de_opt_string_or_number<'de, D>(deserializer: D)
-> Result<Option<String>, D::Error>
where D: Deserializer<'de>,
{ let opt = Option::<Value>::deserialize(deserializer)?;
  Ok
  ( match opt
    { None | Some(Value::Null) => None,
      Some(Value::String(s)) => Some(s),
      Some(Value::Number(n)) => Some(n.to_string()),
      Some(other) => return Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
  )
}

/// String tag → closed-but-extensible enum (unknown tags are kept, not rejected)
pub(crate) fn de_tag<'de, D, T>(deserializer: D)
-> Result<T, D::Error>
where D: Deserializer<'de>,
      T: From<String>,
{ let s = String::deserialize(deserializer)?;
  Ok(T::from(s))
}

pub(crate) fn de_opt_tag<'de, D, T>(deserializer: D)
-> Result<Option<T>, D::Error>
where D: Deserializer<'de>,
      T: From<String>,
{ let opt = Option::<String>::deserialize(deserializer)?;
  Ok(opt.map(T::from))
}
