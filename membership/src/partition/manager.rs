use crate::core::{AppMessage, Identity, View};
use crate::partition::Watchdog;
use crossbeam::channel::{bounded, RecvTimeoutError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

/// An application message that passed its sequence check.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
  pub message: AppMessage,
  /// Sent with `send_object`, so [`AppMessage::object`] can decode the payload.
  pub serialized: bool,
}
impl Delivery {
  pub fn sender(&self) -> Identity {
    self.message.sender
  }
}

/// Receives upcalls from a [`PartitionManager`].
///
/// Each upcall runs on its own thread. The manager waits for it up to the upcall timeout and then
/// moves on to the next listener, so a listener that panics or hangs is reported but never keeps
/// the others from being notified. A listener that overruns may see its next upcall while the
/// previous one is still running.
pub trait PartitionListener: Send + Sync + 'static {
  fn partition_notification(&self, view: &View, leader: Identity);

  fn object_notification(&self, _delivery: &Delivery) {}
}

pub struct PartitionManager {
  listeners: RwLock<Vec<Arc<dyn PartitionListener>>>,
  watchdog: Watchdog,
  terminated: AtomicBool,
}
impl PartitionManager {
  pub fn new(upcall_timeout: Duration) -> PartitionManager {
    PartitionManager {
      listeners: RwLock::new(Vec::new()),
      watchdog: Watchdog::new(upcall_timeout),
      terminated: AtomicBool::new(false),
    }
  }

  pub fn register(&self, listener: Arc<dyn PartitionListener>) {
    if let Ok(mut listeners) = self.listeners.write() {
      listeners.push(listener);
    }
  }

  /// Returns whether `listener` was registered.
  pub fn deregister(&self, listener: &Arc<dyn PartitionListener>) -> bool {
    match self.listeners.write() {
      Ok(mut listeners) => {
        let before = listeners.len();
        // Compare data pointers only, vtables may be duplicated across codegen units.
        let target = Arc::as_ptr(listener) as *const ();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
      }
      Err(_) => false,
    }
  }

  pub fn listener_count(&self) -> usize {
    self.listeners.read().map(|l| l.len()).unwrap_or(0)
  }

  pub fn notify(&self, view: &View, leader: Identity) {
    let view = view.clone();
    self.upcall("partition", move |l| l.partition_notification(&view, leader));
  }

  pub fn receive_object(&self, delivery: &Delivery) {
    let delivery = delivery.clone();
    self.upcall("object", move |l| l.object_notification(&delivery));
  }

  /// Upcalls already running finish, later ones are skipped.
  pub fn terminate(&self) {
    if !self.terminated.swap(true, Ordering::SeqCst) {
      debug!("partition manager terminated");
    }
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated.load(Ordering::SeqCst)
  }

  /// Number of upcalls that overran the timeout.
  pub fn overruns(&self) -> u64 {
    self.watchdog.overruns()
  }

  fn upcall<F>(&self, label: &'static str, f: F)
  where
    F: Fn(&dyn PartitionListener) + Send + Sync + 'static,
  {
    // Snapshot, so listeners may register or deregister from inside an upcall.
    let listeners = match self.listeners.read() {
      Ok(l) => l.clone(),
      Err(_) => return,
    };
    let f = Arc::new(f);
    for listener in listeners {
      if self.is_terminated() {
        return;
      }
      let guard = self.watchdog.start(label);
      let (done_tx, done_rx) = bounded(1);
      let call = f.clone();
      let spawned = std::thread::Builder::new()
        .name(format!("{}-upcall", label))
        .spawn(move || {
          let _guard = guard;
          if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (*call)(&*listener))) {
            error!("{} listener panicked: {}", label, panic_message(&*panic));
          }
          let _ = done_tx.send(());
        });
      if let Err(e) = spawned {
        error!("could not start {} upcall: {}", label, e);
        continue;
      }
      // A listener that overruns keeps its thread, later listeners are not held up.
      if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(self.watchdog.limit()) {
        warn!("{} listener overran {:?}, moving on", label, self.watchdog.limit());
      }
    }
  }
}
fn panic_message(panic: &(dyn Any + Send)) -> &str {
  panic
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| panic.downcast_ref::<String>().map(|s| s.as_str()))
    .unwrap_or("non-string panic")
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::time::Instant;

#[cfg(test)]
struct Counting {
  views: AtomicUsize,
  objects: AtomicUsize,
  panics: bool,
  sleep: Duration,
}

#[cfg(test)]
impl Counting {
  fn new(panics: bool, sleep: Duration) -> Arc<Counting> {
    Arc::new(Counting {
      views: AtomicUsize::new(0),
      objects: AtomicUsize::new(0),
      panics: panics,
      sleep: sleep,
    })
  }
}

#[cfg(test)]
impl PartitionListener for Counting {
  fn partition_notification(&self, _: &View, _: Identity) {
    self.views.fetch_add(1, Ordering::SeqCst);
    std::thread::sleep(self.sleep);
    if self.panics {
      panic!("listener failure");
    }
  }

  fn object_notification(&self, _: &Delivery) {
    self.objects.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn test_faulty_listener_is_isolated() {
  let pm = PartitionManager::new(Duration::from_millis(20));
  let bad = Counting::new(true, Duration::from_millis(60));
  let good = Counting::new(false, Duration::ZERO);
  pm.register(bad.clone());
  pm.register(good.clone());
  let view = View::singleton(0, 0);
  pm.notify(&view, Identity::new(1, 0, 0));
  pm.notify(&view, Identity::new(1, 0, 0));
  assert_eq!(bad.views.load(Ordering::SeqCst), 2);
  assert_eq!(good.views.load(Ordering::SeqCst), 2);
  drop(pm);
}

#[test]
fn test_hung_listener_does_not_hold_up_others() {
  let pm = PartitionManager::new(Duration::from_millis(50));
  let hung = Counting::new(false, Duration::from_secs(3));
  let good = Counting::new(false, Duration::ZERO);
  pm.register(hung.clone());
  pm.register(good.clone());
  let view = View::singleton(0, 0);
  let started = Instant::now();
  for _ in 0..3 {
    pm.notify(&view, Identity::new(1, 0, 0));
  }
  assert!(started.elapsed() < Duration::from_millis(1000), "{:?}", started.elapsed());
  assert_eq!(good.views.load(Ordering::SeqCst), 3);
  assert_eq!(hung.views.load(Ordering::SeqCst), 3);
  std::thread::sleep(Duration::from_millis(60));
  assert_eq!(pm.overruns(), 3);
}

#[test]
fn test_overrun_is_counted() {
  let pm = PartitionManager::new(Duration::from_millis(20));
  pm.register(Counting::new(false, Duration::from_millis(80)));
  pm.notify(&View::singleton(0, 0), Identity::new(1, 0, 0));
  std::thread::sleep(Duration::from_millis(40));
  assert_eq!(pm.overruns(), 1);
}

#[test]
fn test_deregister_and_terminate() {
  let pm = PartitionManager::new(Duration::from_millis(200));
  let a = Counting::new(false, Duration::ZERO);
  let handle: Arc<dyn PartitionListener> = a.clone();
  pm.register(handle.clone());
  assert_eq!(pm.listener_count(), 1);
  let delivery = Delivery {
    message: AppMessage {
      sender: Identity::new(1, 3, 0),
      time: 0,
      seq: 1,
      payload: vec![],
    },
    serialized: false,
  };
  pm.receive_object(&delivery);
  assert_eq!(a.objects.load(Ordering::SeqCst), 1);
  assert!(pm.deregister(&handle));
  assert!(!pm.deregister(&handle));
  pm.receive_object(&delivery);
  assert_eq!(a.objects.load(Ordering::SeqCst), 1);

  pm.register(handle);
  pm.terminate();
  pm.terminate();
  pm.receive_object(&delivery);
  pm.notify(&View::singleton(0, 0), Identity::new(1, 0, 0));
  assert_eq!(a.objects.load(Ordering::SeqCst), 1);
  assert_eq!(a.views.load(Ordering::SeqCst), 0);
}
