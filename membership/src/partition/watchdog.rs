use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::error;

enum Command {
  Start {
    token: u64,
    label: &'static str,
    deadline: Instant,
  },
  Stop(u64),
  Shutdown,
}

/// Reports upcalls that run past a time limit.
///
/// A dedicated thread keeps the deadlines, so an upcall that never returns is still reported. The
/// upcall itself is never interrupted.
pub struct Watchdog {
  limit: Duration,
  tx: Sender<Command>,
  next: AtomicU64,
  overruns: Arc<AtomicU64>,
  thread: Mutex<Option<JoinHandle<()>>>,
}
impl Watchdog {
  pub fn new(limit: Duration) -> Watchdog {
    let (tx, rx) = unbounded();
    let overruns = Arc::new(AtomicU64::new(0));
    let counter = overruns.clone();
    let thread = std::thread::Builder::new()
      .name("upcall-watchdog".to_string())
      .spawn(move || {
        let mut pending: HashMap<u64, (&'static str, Instant)> = HashMap::new();
        loop {
          let next = pending.values().map(|(_, d)| *d).min();
          let cmd = match next {
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
          };
          match cmd {
            Ok(Command::Start {
              token,
              label,
              deadline,
            }) => {
              pending.insert(token, (label, deadline));
            }
            Ok(Command::Stop(token)) => {
              pending.remove(&token);
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
          }
          let now = Instant::now();
          pending.retain(|_, (label, deadline)| {
            if *deadline > now {
              return true;
            }
            counter.fetch_add(1, Ordering::Relaxed);
            error!("{} upcall still running after {:?}", label, limit);
            false
          });
        }
      })
      .ok();
    Watchdog {
      limit: limit,
      tx: tx,
      next: AtomicU64::new(0),
      overruns: overruns,
      thread: Mutex::new(thread),
    }
  }

  pub fn limit(&self) -> Duration {
    self.limit
  }

  /// Starts timing an upcall. The timer stops when the guard is dropped.
  pub fn start(&self, label: &'static str) -> WatchGuard {
    let token = self.next.fetch_add(1, Ordering::Relaxed);
    let _ = self.tx.send(Command::Start {
      token: token,
      label: label,
      deadline: Instant::now() + self.limit,
    });
    WatchGuard {
      tx: self.tx.clone(),
      token: token,
    }
  }

  /// How many upcalls have overrun so far.
  pub fn overruns(&self) -> u64 {
    self.overruns.load(Ordering::Relaxed)
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(Command::Shutdown);
    let handle = self.thread.lock().ok().and_then(|mut t| t.take());
    if let Some(handle) = handle {
      let _ = handle.join();
    }
  }
}
impl Drop for Watchdog {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Stops its upcall's timer when dropped. It may be moved to the thread running the upcall.
pub struct WatchGuard {
  tx: Sender<Command>,
  token: u64,
}
impl Drop for WatchGuard {
  fn drop(&mut self) {
    let _ = self.tx.send(Command::Stop(self.token));
  }
}

#[test]
fn test_watchdog_reports_overrun() {
  let dog = Watchdog::new(Duration::from_millis(20));
  {
    let _guard = dog.start("fast");
  }
  {
    let _guard = dog.start("slow");
    std::thread::sleep(Duration::from_millis(80));
  }
  dog.shutdown();
  assert_eq!(dog.overruns(), 1);
}

#[test]
fn test_watchdog_shutdown_is_idempotent() {
  let dog = Watchdog::new(Duration::from_millis(20));
  dog.shutdown();
  dog.shutdown();
  let _guard = dog.start("after shutdown");
  assert_eq!(dog.overruns(), 0);
}
