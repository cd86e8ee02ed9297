use crate::core::{DecodeError, Identity, Timestamp, View};
use im::OrdSet;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::TryFrom;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/*
Every packet starts with a fixed header: the cluster magic (u32) and a type tag (u8). Everything
is big endian. Variable sized parts (addresses, bitsets, payloads) carry their own length prefix,
so a truncated datagram is always detected instead of being misread.
 */
pub const HEADER_SIZE: usize = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
  Heartbeat = 1,
  PingHeartbeat = 2,
  Message = 3,
  Serialized = 4,
}

/// The periodic announcement of a node's view and vote.
#[derive(Clone, Debug, PartialEq)]
pub struct Heartbeat {
  pub sender: Identity,
  pub sender_address: Option<SocketAddr>,
  pub time: Timestamp,
  pub view: View,
  /// The sender's current vote.
  pub candidate: Identity,
  pub preferred: bool,
  /// Peers the sender wants to exchange application messages with.
  pub msg_links: OrdSet<i32>,
  pub controller: Option<SocketAddr>,
  /// Sequence number of this heartbeat from this sender.
  pub order: u64,
  /// Ids the sender heard from since its previous heartbeat. Only carried by ping heartbeats.
  pub pings: OrdSet<i32>,
}

/// Application payload on a message connection.
#[derive(Clone, Debug, PartialEq)]
pub struct AppMessage {
  pub sender: Identity,
  pub time: Timestamp,
  pub seq: u64,
  pub payload: Vec<u8>,
}
impl AppMessage {
  /// Decodes the payload of a [`MessageType::Serialized`] envelope.
  pub fn object<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
    Ok(serde_cbor::from_slice(&self.payload)?)
  }

  pub fn envelope<T: Serialize>(
    sender: Identity,
    time: Timestamp,
    seq: u64,
    item: &T,
  ) -> Result<AppMessage, serde_cbor::Error> {
    Ok(AppMessage {
      sender: sender,
      time: time,
      seq: seq,
      payload: serde_cbor::to_vec(item)?,
    })
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
  Heartbeat(Heartbeat),
  PingHeartbeat(Heartbeat),
  Message(AppMessage),
  Serialized(AppMessage),
}
impl Packet {
  pub fn message_type(&self) -> MessageType {
    match self {
      Packet::Heartbeat(_) => MessageType::Heartbeat,
      Packet::PingHeartbeat(_) => MessageType::PingHeartbeat,
      Packet::Message(_) => MessageType::Message,
      Packet::Serialized(_) => MessageType::Serialized,
    }
  }

  pub fn sender(&self) -> &Identity {
    match self {
      Packet::Heartbeat(hb) | Packet::PingHeartbeat(hb) => &hb.sender,
      Packet::Message(m) | Packet::Serialized(m) => &m.sender,
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&self.sender().magic.to_be_bytes());
    buf.push(self.message_type().into());
    match self {
      Packet::Heartbeat(hb) => put_heartbeat(&mut buf, hb, false),
      Packet::PingHeartbeat(hb) => put_heartbeat(&mut buf, hb, true),
      Packet::Message(m) | Packet::Serialized(m) => {
        m.sender.put(&mut buf);
        buf.extend_from_slice(&m.time.to_be_bytes());
        buf.extend_from_slice(&m.seq.to_be_bytes());
        buf.extend_from_slice(&(m.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&m.payload);
      }
    }
    buf
  }

  /// Decodes a packet, dropping anything not addressed to the cluster named by `magic`.
  pub fn decode(bytes: &[u8], magic: u32) -> Result<Packet, DecodeError> {
    let mut rd = Reader::new(bytes);
    let found = rd.u32()?;
    if found != magic {
      return Err(DecodeError::BadMagic {
        expected: magic,
        found: found,
      });
    }
    let tag = rd.u8()?;
    let tpe = MessageType::try_from(tag).map_err(|_| DecodeError::UnknownType(tag))?;
    let packet = match tpe {
      MessageType::Heartbeat => Packet::Heartbeat(rd.heartbeat(false)?),
      MessageType::PingHeartbeat => Packet::PingHeartbeat(rd.heartbeat(true)?),
      MessageType::Message => Packet::Message(rd.app_message()?),
      MessageType::Serialized => Packet::Serialized(rd.app_message()?),
    };
    rd.finish()?;
    Ok(packet)
  }
}

fn put_heartbeat(buf: &mut Vec<u8>, hb: &Heartbeat, ping: bool) {
  hb.sender.put(buf);
  put_addr(buf, hb.sender_address.as_ref());
  buf.extend_from_slice(&hb.time.to_be_bytes());
  put_bitset(buf, hb.view.members());
  buf.push(hb.view.is_stable() as u8);
  buf.extend_from_slice(&hb.view.timestamp().to_be_bytes());
  buf.extend_from_slice(&hb.view.view_number().to_be_bytes());
  hb.candidate.put(buf);
  buf.push(hb.preferred as u8);
  put_bitset(buf, &hb.msg_links);
  put_addr(buf, hb.controller.as_ref());
  buf.extend_from_slice(&hb.order.to_be_bytes());
  if ping {
    put_bitset(buf, &hb.pings);
  }
}

fn put_addr(buf: &mut Vec<u8>, addr: Option<&SocketAddr>) {
  match addr {
    None => buf.push(0),
    Some(SocketAddr::V4(a)) => {
      buf.push(6);
      buf.extend_from_slice(&a.ip().octets());
      buf.extend_from_slice(&a.port().to_be_bytes());
    }
    Some(SocketAddr::V6(a)) => {
      buf.push(18);
      buf.extend_from_slice(&a.ip().octets());
      buf.extend_from_slice(&a.port().to_be_bytes());
    }
  }
}

// Negative ids never name a node and are not representable.
fn put_bitset(buf: &mut Vec<u8>, set: &OrdSet<i32>) {
  let len = set
    .get_max()
    .filter(|max| **max >= 0)
    .map(|max| *max as usize / 8 + 1)
    .unwrap_or(0);
  let mut bits = vec![0u8; len];
  for id in set.iter().filter(|id| **id >= 0) {
    bits[*id as usize / 8] |= 1 << (*id as usize % 8);
  }
  buf.extend_from_slice(&(len as u16).to_be_bytes());
  buf.extend_from_slice(&bits);
}

struct Reader<'a> {
  buf: &'a [u8],
  pos: usize,
}
impl<'a> Reader<'a> {
  fn new(buf: &'a [u8]) -> Reader<'a> {
    Reader { buf: buf, pos: 0 }
  }

  fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
    let have = self.buf.len() - self.pos;
    if have < n {
      return Err(DecodeError::Truncated {
        needed: n,
        have: have,
      });
    }
    let slice = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(slice)
  }

  fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
    let mut arr = [0u8; N];
    arr.copy_from_slice(self.take(N)?);
    Ok(arr)
  }

  fn u8(&mut self) -> Result<u8, DecodeError> {
    Ok(self.take(1)?[0])
  }

  fn bool(&mut self) -> Result<bool, DecodeError> {
    Ok(self.u8()? != 0)
  }

  fn u16(&mut self) -> Result<u16, DecodeError> {
    Ok(u16::from_be_bytes(self.array()?))
  }

  fn u32(&mut self) -> Result<u32, DecodeError> {
    Ok(u32::from_be_bytes(self.array()?))
  }

  fn i32(&mut self) -> Result<i32, DecodeError> {
    Ok(i32::from_be_bytes(self.array()?))
  }

  fn u64(&mut self) -> Result<u64, DecodeError> {
    Ok(u64::from_be_bytes(self.array()?))
  }

  fn i64(&mut self) -> Result<i64, DecodeError> {
    Ok(i64::from_be_bytes(self.array()?))
  }

  fn identity(&mut self) -> Result<Identity, DecodeError> {
    Ok(Identity::new(self.u32()?, self.i32()?, self.i64()?))
  }

  fn addr(&mut self) -> Result<Option<SocketAddr>, DecodeError> {
    let len = self.u8()?;
    match len {
      0 => Ok(None),
      6 => {
        let ip = Ipv4Addr::from(self.array::<4>()?);
        Ok(Some(SocketAddr::new(IpAddr::V4(ip), self.u16()?)))
      }
      18 => {
        let ip = Ipv6Addr::from(self.array::<16>()?);
        Ok(Some(SocketAddr::new(IpAddr::V6(ip), self.u16()?)))
      }
      x => Err(DecodeError::InvalidAddress(x)),
    }
  }

  fn bitset(&mut self) -> Result<OrdSet<i32>, DecodeError> {
    let len = self.u16()? as usize;
    let bits = self.take(len)?;
    let mut set = OrdSet::new();
    for (i, byte) in bits.iter().enumerate() {
      for bit in 0..8 {
        if byte & (1 << bit) != 0 {
          set.insert((i * 8 + bit) as i32);
        }
      }
    }
    Ok(set)
  }

  fn heartbeat(&mut self, ping: bool) -> Result<Heartbeat, DecodeError> {
    let sender = self.identity()?;
    let sender_address = self.addr()?;
    let time = self.i64()?;
    let members = self.bitset()?;
    let stable = self.bool()?;
    let timestamp = self.i64()?;
    let view_number = self.u64()?;
    let candidate = self.identity()?;
    let preferred = self.bool()?;
    let msg_links = self.bitset()?;
    let controller = self.addr()?;
    let order = self.u64()?;
    let pings = if ping { self.bitset()? } else { OrdSet::new() };
    Ok(Heartbeat {
      sender: sender,
      sender_address: sender_address,
      time: time,
      view: View::new(members, stable, timestamp, view_number),
      candidate: candidate,
      preferred: preferred,
      msg_links: msg_links,
      controller: controller,
      order: order,
      pings: pings,
    })
  }

  fn app_message(&mut self) -> Result<AppMessage, DecodeError> {
    let sender = self.identity()?;
    let time = self.i64()?;
    let seq = self.u64()?;
    let len = self.u32()? as usize;
    let payload = self.take(len)?.to_vec();
    Ok(AppMessage {
      sender: sender,
      time: time,
      seq: seq,
      payload: payload,
    })
  }

  fn finish(self) -> Result<(), DecodeError> {
    match self.buf.len() - self.pos {
      0 => Ok(()),
      x => Err(DecodeError::Trailing(x)),
    }
  }
}

#[cfg(test)]
use im::ordset;

#[cfg(test)]
fn sample_heartbeat() -> Heartbeat {
  Heartbeat {
    sender: Identity::new(0xfeed, 3, 1_600_000_000_000),
    sender_address: Some("10.1.2.3:4567".parse().unwrap()),
    time: 1_600_000_000_500,
    view: View::new(ordset![0, 3, 9, 17], true, 1_600_000_000_123, 42),
    candidate: Identity::new(0xfeed, 17, 99),
    preferred: true,
    msg_links: ordset![9],
    controller: Some("[::1]:80".parse().unwrap()),
    order: 7,
    pings: ordset![0, 17],
  }
}

#[test]
fn test_heartbeat_reconstruction() {
  let hb = sample_heartbeat();
  let bytes = Packet::PingHeartbeat(hb.clone()).encode();
  assert_eq!(Packet::decode(&bytes, 0xfeed).unwrap(), Packet::PingHeartbeat(hb.clone()));

  // Plain heartbeats do not carry pings.
  let bytes = Packet::Heartbeat(hb.clone()).encode();
  match Packet::decode(&bytes, 0xfeed).unwrap() {
    Packet::Heartbeat(decoded) => {
      assert_eq!(decoded.view, hb.view);
      assert_eq!(decoded.msg_links, hb.msg_links);
      assert!(decoded.pings.is_empty());
    }
    other => panic!("decoded {:?}", other),
  }
}

#[test]
fn test_serialized_envelope() {
  let sender = Identity::new(1, 2, 3);
  let msg = AppMessage::envelope(sender, 10, 0, &vec!["left".to_string(), "right".to_string()])
    .unwrap();
  let bytes = Packet::Serialized(msg).encode();
  match Packet::decode(&bytes, 1).unwrap() {
    Packet::Serialized(m) => {
      assert_eq!(m.sender, sender);
      assert_eq!(m.object::<Vec<String>>().unwrap(), vec!["left", "right"]);
    }
    other => panic!("decoded {:?}", other),
  }
}

#[test]
fn test_malformed_packets() {
  let bytes = Packet::Heartbeat(sample_heartbeat()).encode();
  assert!(matches!(
    Packet::decode(&bytes, 0xbeef),
    Err(DecodeError::BadMagic { .. })
  ));
  assert!(matches!(
    Packet::decode(&bytes[..bytes.len() - 3], 0xfeed),
    Err(DecodeError::Truncated { .. })
  ));
  let mut longer = bytes.clone();
  longer.push(0);
  assert!(matches!(Packet::decode(&longer, 0xfeed), Err(DecodeError::Trailing(1))));
  let mut unknown = bytes;
  unknown[4] = 77;
  assert!(matches!(Packet::decode(&unknown, 0xfeed), Err(DecodeError::UnknownType(77))));
}
