use crate::core::{DecodeError, SecurityConfig};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::trace;

type HmacSha1 = Hmac<Sha1>;

/// Length of the trailing HMAC-SHA1 tag.
pub const MAC_SIZE: usize = 20;

/// Optional message authentication for outbound and inbound packets.
#[derive(Clone, Debug)]
pub enum Security {
  None,
  Mac(KeyRing),
}

#[derive(Clone, Debug)]
pub struct KeyRing {
  current: Vec<u8>,
  last: Option<Vec<u8>>,
  default: Option<Vec<u8>>,
}

impl Security {
  pub fn from_config(config: Option<&SecurityConfig>) -> Security {
    match config {
      None => Security::None,
      Some(cfg) => Security::Mac(KeyRing {
        current: cfg.key.clone(),
        last: cfg.last_key.clone(),
        default: cfg.default_key.clone(),
      }),
    }
  }

  /// Appends the tag computed with the current key.
  pub fn seal(&self, mut bytes: Vec<u8>) -> Vec<u8> {
    if let Security::Mac(ring) = self {
      if let Some(tag) = tag(&ring.current, &bytes) {
        bytes.extend_from_slice(&tag);
      }
    }
    bytes
  }

  /// Verifies and strips the trailing tag, trying the current, last and default keys in turn.
  pub fn open<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let ring = match self {
      Security::None => return Ok(bytes),
      Security::Mac(ring) => ring,
    };
    if bytes.len() < MAC_SIZE {
      return Err(DecodeError::Truncated {
        needed: MAC_SIZE,
        have: bytes.len(),
      });
    }
    let (payload, received) = bytes.split_at(bytes.len() - MAC_SIZE);
    let keys = std::iter::once(&ring.current)
      .chain(ring.last.iter())
      .chain(ring.default.iter());
    for (i, key) in keys.enumerate() {
      if verify(key, payload, received) {
        if i > 0 {
          trace!("packet verified with fallback key {}", i);
        }
        return Ok(payload);
      }
    }
    Err(DecodeError::BadMac)
  }

  /// Makes `key` current. The previous current key is still accepted until the next rotation.
  pub fn rotate(&mut self, key: Vec<u8>) {
    match self {
      Security::None => {
        *self = Security::Mac(KeyRing {
          current: key,
          last: None,
          default: None,
        })
      }
      Security::Mac(ring) => {
        let old = std::mem::replace(&mut ring.current, key);
        ring.last = Some(old);
      }
    }
  }

  pub fn overhead(&self) -> usize {
    match self {
      Security::None => 0,
      Security::Mac(_) => MAC_SIZE,
    }
  }
}

fn tag(key: &[u8], data: &[u8]) -> Option<[u8; MAC_SIZE]> {
  let mut mac = HmacSha1::new_from_slice(key).ok()?;
  mac.update(data);
  let mut out = [0u8; MAC_SIZE];
  out.copy_from_slice(&mac.finalize().into_bytes());
  Some(out)
}

fn verify(key: &[u8], data: &[u8], received: &[u8]) -> bool {
  match HmacSha1::new_from_slice(key) {
    Ok(mut mac) => {
      mac.update(data);
      mac.verify_slice(received).is_ok()
    }
    Err(_) => false,
  }
}

#[cfg(test)]
fn keyed(key: &str) -> Security {
  Security::from_config(Some(&SecurityConfig {
    key: key.as_bytes().to_vec(),
    last_key: None,
    default_key: Some(b"cluster-default".to_vec()),
  }))
}

#[test]
fn test_mac_round_trip_and_tamper() {
  let sec = keyed("alpha");
  let sealed = sec.seal(b"heartbeat body".to_vec());
  assert_eq!(sealed.len(), 14 + MAC_SIZE);
  assert_eq!(sec.open(&sealed).unwrap(), b"heartbeat body");
  let mut tampered = sealed.clone();
  tampered[0] ^= 1;
  assert!(matches!(sec.open(&tampered), Err(DecodeError::BadMac)));
  assert!(matches!(keyed("beta").open(&sealed), Err(DecodeError::BadMac)));
}

#[test]
fn test_mac_key_rotation_fallback() {
  let old = keyed("alpha");
  let mut rotated = keyed("alpha");
  rotated.rotate(b"beta".to_vec());
  // In-flight packets sealed with the old key are still accepted.
  let sealed = old.seal(b"in flight".to_vec());
  assert_eq!(rotated.open(&sealed).unwrap(), b"in flight");
  // Nodes that have never been keyed fall back to the default key.
  let default = keyed("cluster-default").seal(b"bootstrap".to_vec());
  assert_eq!(rotated.open(&default).unwrap(), b"bootstrap");
  // The old node does not know the new key.
  assert!(old.open(&rotated.seal(b"new".to_vec())).is_err());
}
