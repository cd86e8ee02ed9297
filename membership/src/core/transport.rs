use async_trait::async_trait;
use hashbrown::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::task::Poll;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65507;

/// Moves encoded packets between nodes. Delivery is unreliable and unordered unless the
/// implementation says otherwise.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  async fn send(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

  /// Waits for the next inbound packet and the address it came from.
  async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)>;

  fn local_addr(&self) -> SocketAddr;

  /// Releases the sockets. Pending and later calls fail with [`io::ErrorKind::BrokenPipe`].
  fn close(&self);
}

pub(crate) fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::BrokenPipe, "transport closed")
}

/// Wakes everything waiting on a transport once it is closed.
#[derive(Default)]
pub(crate) struct Closer {
  closed: AtomicBool,
  notify: Notify,
}
impl Closer {
  /// Returns whether this call closed it.
  pub(crate) fn close(&self) -> bool {
    let first = !self.closed.swap(true, Ordering::SeqCst);
    self.notify.notify_waiters();
    first
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Runs `fut` unless the transport is closed before it completes.
  pub(crate) async fn guard<T, F>(&self, fut: F) -> io::Result<T>
  where
    F: Future<Output = io::Result<T>>,
  {
    let notified = self.notify.notified();
    if self.is_closed() {
      return Err(closed_error());
    }
    tokio::select! {
      res = fut => res,
      _ = notified => Err(closed_error()),
    }
  }
}

fn poll_slot<S, T, F>(slot: &RwLock<Option<S>>, f: F) -> Poll<io::Result<T>>
where
  F: FnOnce(&S) -> Poll<io::Result<T>>,
{
  match slot.read() {
    Ok(guard) => match guard.as_ref() {
      Some(socket) => f(socket),
      None => Poll::Ready(Err(closed_error())),
    },
    Err(_) => Poll::Ready(Err(closed_error())),
  }
}

fn take_slot<S>(slot: &RwLock<Option<S>>) -> Option<S> {
  match slot.write() {
    Ok(mut guard) => guard.take(),
    Err(e) => e.into_inner().take(),
  }
}

/// Datagrams over one UDP socket.
///
/// The socket is only borrowed for the duration of each poll, so [`close`](Transport::close)
/// releases the port immediately, even while a receive is pending.
pub struct UdpTransport {
  socket: RwLock<Option<UdpSocket>>,
  addr: SocketAddr,
  closer: Closer,
}
impl UdpTransport {
  pub async fn bind(addr: SocketAddr) -> io::Result<UdpTransport> {
    let socket = UdpSocket::bind(addr).await?;
    Self::wrap(socket)
  }

  /// Binds the group's port on all interfaces and joins the group on `interface`.
  pub async fn multicast(group: SocketAddrV4, interface: Ipv4Addr) -> io::Result<UdpTransport> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port())).await?;
    socket.join_multicast_v4(*group.ip(), interface)?;
    socket.set_multicast_loop_v4(true)?;
    Self::wrap(socket)
  }

  fn wrap(socket: UdpSocket) -> io::Result<UdpTransport> {
    let addr = socket.local_addr()?;
    Ok(UdpTransport {
      socket: RwLock::new(Some(socket)),
      addr: addr,
      closer: Closer::default(),
    })
  }
}
#[async_trait]
impl Transport for UdpTransport {
  async fn send(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
    let sending = poll_fn(|cx| poll_slot(&self.socket, |s| s.poll_send_to(cx, bytes, to)));
    self.closer.guard(sending).await.map(|_| ())
  }

  async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let receiving = poll_fn(|cx| {
      poll_slot(&self.socket, |s| {
        let mut rb = ReadBuf::new(&mut buf);
        s.poll_recv_from(cx, &mut rb)
          .map_ok(|from| (rb.filled().len(), from))
      })
    });
    let (len, from) = self.closer.guard(receiving).await?;
    buf.truncate(len);
    Ok((buf, from))
  }

  fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  fn close(&self) {
    if self.closer.close() {
      take_slot(&self.socket);
      info!("closed udp socket {}", self.addr);
    }
  }
}

/// Prefixes `bytes` with its length as a big endian u16.
pub fn frame(bytes: &[u8]) -> io::Result<Vec<u8>> {
  if bytes.len() > u16::MAX as usize {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("frame of {} bytes exceeds {}", bytes.len(), u16::MAX),
    ));
  }
  let mut buf = Vec::with_capacity(bytes.len() + 2);
  buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
  buf.extend_from_slice(bytes);
  Ok(buf)
}

type Inbound = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;
type Writer = Arc<Mutex<Option<OwnedWriteHalf>>>;
type Tasks = Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>;

/// Reliable, ordered delivery over length-prefixed TCP streams. One outbound stream is kept per
/// destination and reopened once if a write fails. Each destination has its own writer lock, so
/// a slow connect to one peer does not hold up sends to the others.
pub struct TcpTransport {
  addr: SocketAddr,
  listener: Arc<RwLock<Option<TcpListener>>>,
  writers: std::sync::Mutex<HashMap<SocketAddr, Writer>>,
  inbound_tx: Inbound,
  inbound_rx: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
  tasks: Tasks,
  closer: Closer,
}
impl TcpTransport {
  pub async fn bind(addr: SocketAddr) -> io::Result<TcpTransport> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let listener = Arc::new(RwLock::new(Some(listener)));
    let (tx, rx) = mpsc::unbounded_channel();
    let tasks: Tasks = Arc::default();
    let acceptor = tokio::spawn(accept_loop(listener.clone(), tx.clone(), tasks.clone()));
    track(&tasks, acceptor);
    Ok(TcpTransport {
      addr: addr,
      listener: listener,
      writers: std::sync::Mutex::new(HashMap::new()),
      inbound_tx: tx,
      inbound_rx: Mutex::new(rx),
      tasks: tasks,
      closer: Closer::default(),
    })
  }

  fn writer(&self, to: SocketAddr) -> Writer {
    let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
    writers
      .entry(to)
      .or_insert_with(|| Arc::new(Mutex::new(None)))
      .clone()
  }

  async fn open(&self, to: SocketAddr) -> io::Result<OwnedWriteHalf> {
    let (rd, wr) = TcpStream::connect(to).await?.into_split();
    track(&self.tasks, tokio::spawn(read_frames(rd, to, self.inbound_tx.clone())));
    Ok(wr)
  }

  async fn write(&self, framed: &[u8], to: SocketAddr) -> io::Result<()> {
    let slot = self.writer(to);
    let mut writer = slot.lock().await;
    if let Some(wr) = writer.as_mut() {
      if wr.write_all(framed).await.is_ok() {
        return Ok(());
      }
      debug!("stream to {} broke, reopening", to);
      *writer = None;
    }
    let mut wr = self.open(to).await?;
    wr.write_all(framed).await?;
    *writer = Some(wr);
    Ok(())
  }
}
#[async_trait]
impl Transport for TcpTransport {
  async fn send(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
    let framed = frame(bytes)?;
    self.closer.guard(self.write(&framed, to)).await
  }

  async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
    let receiving = async {
      self
        .inbound_rx
        .lock()
        .await
        .recv()
        .await
        .ok_or_else(closed_error)
    };
    self.closer.guard(receiving).await
  }

  fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  fn close(&self) {
    if !self.closer.close() {
      return;
    }
    take_slot(&*self.listener);
    for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
      task.abort();
    }
    self.writers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    info!("closed tcp transport {}", self.addr);
  }
}
impl Drop for TcpTransport {
  fn drop(&mut self) {
    self.close();
  }
}

fn track(tasks: &Tasks, task: JoinHandle<()>) {
  let mut tasks = tasks.lock().unwrap_or_else(|e| e.into_inner());
  tasks.retain(|t| !t.is_finished());
  tasks.push(task);
}

async fn accept_loop(listener: Arc<RwLock<Option<TcpListener>>>, tx: Inbound, tasks: Tasks) {
  loop {
    match poll_fn(|cx| poll_slot(&*listener, |l| l.poll_accept(cx))).await {
      Ok((stream, from)) => {
        let (rd, _) = stream.into_split();
        track(&tasks, tokio::spawn(read_frames(rd, from, tx.clone())));
      }
      Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
      Err(e) => warn!("tcp accept failed: {}", e),
    }
  }
}

async fn read_frames(mut rd: OwnedReadHalf, from: SocketAddr, tx: Inbound) {
  loop {
    let len = match rd.read_u16().await {
      Ok(len) => len as usize,
      Err(_) => break,
    };
    let mut buf = vec![0u8; len];
    if let Err(e) = rd.read_exact(&mut buf).await {
      debug!("stream from {} ended mid-frame: {}", from, e);
      break;
    }
    if tx.send((buf, from)).is_err() {
      break;
    }
  }
}

#[test]
fn test_frame_prefix() {
  let framed = frame(&[9, 8, 7]).unwrap();
  assert_eq!(framed, vec![0, 3, 9, 8, 7]);
  assert!(frame(&vec![0u8; 70000]).is_err());
}

#[tokio::test]
async fn test_udp_transport_loopback() {
  let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  a.send(b"ping", b.local_addr()).await.unwrap();
  let (bytes, from) = b.recv().await.unwrap();
  assert_eq!(bytes, b"ping");
  assert_eq!(from, a.local_addr());
}

#[tokio::test]
async fn test_tcp_transport_frames() {
  let a = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  let b = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  a.send(b"first", b.local_addr()).await.unwrap();
  a.send(b"second", b.local_addr()).await.unwrap();
  assert_eq!(b.recv().await.unwrap().0, b"first");
  assert_eq!(b.recv().await.unwrap().0, b"second");
}

#[tokio::test]
async fn test_udp_close_releases_the_port() {
  let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  let addr = a.local_addr();
  a.close();
  a.close();
  let rebound = UdpTransport::bind(addr).await;
  assert!(rebound.is_ok(), "{:?}", rebound.err());
  assert_eq!(a.recv().await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
  assert!(a.send(b"late", addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_wakes_a_pending_receive() {
  let a = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
  let waiting = tokio::spawn({
    let a = a.clone();
    async move { a.recv().await }
  });
  tokio::time::sleep(std::time::Duration::from_millis(20)).await;
  a.close();
  let res = tokio::time::timeout(std::time::Duration::from_secs(1), waiting).await;
  assert!(res.unwrap().unwrap().is_err());
}

#[tokio::test]
async fn test_tcp_close_releases_the_listener() {
  let a = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  let addr = a.local_addr();
  a.close();
  let rebound = TcpTransport::bind(addr).await;
  assert!(rebound.is_ok(), "{:?}", rebound.err());
  assert!(a.send(b"late", addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_peer_does_not_block_others() {
  let a = Arc::new(TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
  let b = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
  // Non-routable, so the connect either hangs or fails, depending on the host.
  let blackhole: SocketAddr = "10.255.255.1:9".parse().unwrap();
  let stuck = tokio::spawn({
    let a = a.clone();
    async move { a.send(b"void", blackhole).await }
  });
  tokio::time::sleep(std::time::Duration::from_millis(20)).await;
  let sent = tokio::time::timeout(std::time::Duration::from_secs(1), a.send(b"live", b.local_addr()));
  assert!(sent.await.unwrap().is_ok());
  assert_eq!(b.recv().await.unwrap().0, b"live");
  a.close();
  let _ = stuck.await;
}
