//! The asynchronous reactor: a single-threaded cooperative completion
//! pump over POSIX AIO.
//!
//! One service binds to exactly one kernel thread, the thread that created
//! it. Everything except [`ServicePoster::post`] must happen on that
//! thread; `post` is the one door other threads may knock on, and it wakes
//! the owner out of `aio_suspend` with a process-global interrupt signal.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::deadline::DeadlineTracker;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

type PostedFn = Box<dyn FnOnce() + Send + 'static>;

/// The empty handler: delivery alone is the point, it makes
/// `aio_suspend` return `EINTR`.
extern "C" fn interrupt_handler(_sig: libc::c_int) {}

fn pick_signal() -> libc::c_int {
    // Prefer an unclaimed realtime signal so we cannot collide with
    // anything else in the process that picked a classic signal.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let lo = libc::SIGRTMIN();
        let hi = libc::SIGRTMAX();
        for sig in lo..=hi {
            let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::sigaction(sig, std::ptr::null(), &mut old)
            };
            if rc == 0 && old.sa_sigaction == libc::SIG_DFL {
                return sig;
            }
        }
    }
    libc::SIGUSR1
}

/// The process-global signal used to interrupt `run_until`. Installed once
/// on first use and never removed; the handler is stateless.
pub fn interruption_signal() -> libc::c_int {
    static SIGNAL: OnceLock<libc::c_int> = OnceLock::new();
    *SIGNAL.get_or_init(|| {
        let sig = pick_signal();
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        let handler: extern "C" fn(libc::c_int) = interrupt_handler;
        sa.sa_sigaction = handler as usize as libc::sighandler_t;
        // Deliberately no SA_RESTART: the wakeup depends on EINTR.
        sa.sa_flags = 0;
        unsafe {
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
        sig
    })
}

fn change_signal_mask(how: libc::c_int, sig: libc::c_int) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::pthread_sigmask(how, &set, std::ptr::null_mut());
    }
}

fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

pub(crate) struct Shared {
    owner: libc::pthread_t,
    posts: Mutex<VecDeque<PostedFn>>,
    work_queued: AtomicUsize,
    /// True while the owner is parked (or about to park) in `aio_suspend`
    /// with the interrupt signal unblocked.
    need_signal: AtomicBool,
}

// `pthread_t` is an opaque token on some platforms; we only ever hand it
// to pthread_kill and pthread_equal, which are thread-safe. Everything
// else in here is a mutex or an atomic.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    pub(crate) fn work_enqueued(&self, n: usize) {
        self.work_queued.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn work_done(&self) {
        self.work_queued.fetch_sub(1, Ordering::AcqRel);
    }

    fn post(&self, f: PostedFn) {
        self.posts.lock().push_back(f);
        self.work_enqueued(1);
        // If the owner raised the flag it is committed to parking with the
        // signal unblocked; one signal is enough, because a signal sent
        // while still blocked stays pending and fires inside aio_suspend.
        if self.need_signal.swap(false, Ordering::AcqRel) {
            unsafe {
                libc::pthread_kill(self.owner, interruption_signal());
            }
        }
    }
}

pub(crate) struct ServiceInner {
    pub(crate) shared: Arc<Shared>,
    /// In-flight kernel control blocks, each pointing back at its
    /// submission state.
    pending: RefCell<Vec<*mut libc::aiocb>>,
}

impl ServiceInner {
    pub(crate) fn register(&self, cbs: impl IntoIterator<Item = *mut libc::aiocb>) {
        self.pending.borrow_mut().extend(cbs);
    }

    pub(crate) fn deregister(&self, cb: *mut libc::aiocb) {
        self.pending.borrow_mut().retain(|&p| p != cb);
    }

    fn on_owning_thread(&self) -> bool {
        unsafe { libc::pthread_equal(libc::pthread_self(), self.shared.owner) != 0 }
    }

    pub(crate) fn run_until(&self, deadline: Option<Deadline>) -> Result<bool> {
        let shared = &self.shared;
        if shared.work_queued.load(Ordering::Acquire) == 0 {
            return Ok(false);
        }
        if !self.on_owning_thread() {
            return Err(Error::new(ErrorKind::OperationNotSupported));
        }
        let tracker = DeadlineTracker::new(deadline);
        loop {
            // At most one posted callable per round, so a steady stream of
            // posts cannot starve i/o completions.
            let posted = shared.posts.lock().pop_front();
            if let Some(f) = posted {
                f();
                shared.work_done();
                return Ok(shared.work_queued.load(Ordering::Acquire) != 0);
            }
            if self.pending.borrow().is_empty() {
                return Ok(shared.work_queued.load(Ordering::Acquire) != 0);
            }

            // Park in aio_suspend with the interrupt signal unblocked for
            // exactly that window. The flag must go up before the final
            // queue check or a post arriving in between would be missed.
            shared.need_signal.store(true, Ordering::SeqCst);
            if !shared.posts.lock().is_empty() {
                shared.need_signal.store(false, Ordering::SeqCst);
                continue;
            }
            let ts = tracker.remaining().map(to_timespec);
            let sig = interruption_signal();
            change_signal_mask(libc::SIG_UNBLOCK, sig);
            let rc = {
                let pending = self.pending.borrow();
                unsafe {
                    libc::aio_suspend(
                        pending.as_ptr() as *const *const libc::aiocb,
                        pending.len() as libc::c_int,
                        ts.as_ref()
                            .map_or(std::ptr::null(), |t| t as *const libc::timespec),
                    )
                }
            };
            let err = if rc == -1 {
                std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO)
            } else {
                0
            };
            change_signal_mask(libc::SIG_BLOCK, sig);
            shared.need_signal.store(false, Ordering::SeqCst);

            match err {
                0 => {
                    self.reap_completions();
                    return Ok(shared.work_queued.load(Ordering::Acquire) != 0);
                }
                libc::EAGAIN => return Err(Error::new(ErrorKind::TimedOut)),
                libc::EINTR => {
                    // Interrupted: most likely a post. Recompute the
                    // remaining deadline and go round again.
                    tracker.check()?;
                    continue;
                }
                e => return Err(Error::from_errno(e)),
            }
        }
    }

    /// Walks the in-flight list, delivering every control block the kernel
    /// has finished with and compacting the list.
    fn reap_completions(&self) {
        let snapshot: Vec<*mut libc::aiocb> = self.pending.borrow().clone();
        for cb in snapshot {
            let err = unsafe { libc::aio_error(cb) };
            if err == libc::EINPROGRESS {
                continue;
            }
            let bytes = unsafe { libc::aio_return(cb) };
            self.deregister(cb);
            self.shared.work_done();
            let err = if err < 0 { libc::EIO } else { err };
            let sival = unsafe { (*cb).aio_sigevent.sigev_value.sival_ptr };
            unsafe {
                crate::async_file::dispatch_completion(sival, cb, err, bytes);
            }
        }
    }
}

/// An asynchronous I/O multiplexer bound to the thread that created it.
///
/// Unlike general-purpose executors this reactor is deliberately single
/// threaded: file I/O gains nothing from hopping kernel threads, and the
/// cooperative model keeps completion delivery on the thread whose cache
/// holds the data. Run a separate service per thread that wants async
/// file I/O.
pub struct IoService {
    inner: Rc<ServiceInner>,
}

impl IoService {
    /// Creates a service owned by the calling thread, installing the
    /// process-global interrupt signal handler if this is the first
    /// service in the process.
    pub fn new() -> IoService {
        let sig = interruption_signal();
        // Keep the signal blocked on the owner outside the aio_suspend
        // window, so a wakeup cannot evaporate between rounds.
        change_signal_mask(libc::SIG_BLOCK, sig);
        IoService {
            inner: Rc::new(ServiceInner {
                shared: Arc::new(Shared {
                    owner: unsafe { libc::pthread_self() },
                    posts: Mutex::new(VecDeque::new()),
                    work_queued: AtomicUsize::new(0),
                    need_signal: AtomicBool::new(false),
                }),
                pending: RefCell::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn inner(&self) -> Rc<ServiceInner> {
        Rc::clone(&self.inner)
    }

    /// Outstanding work items: queued posts plus in-flight I/O items.
    pub fn work_queued(&self) -> usize {
        self.inner.shared.work_queued.load(Ordering::Acquire)
    }

    /// Pumps one round of work.
    ///
    /// Returns `Ok(true)` if work remains after the round, `Ok(false)`
    /// when the service is idle, `TimedOut` when the deadline expired
    /// first, and `OperationNotSupported` when called from a thread other
    /// than the owner.
    pub fn run_until(&self, deadline: Option<Deadline>) -> Result<bool> {
        self.inner.run_until(deadline)
    }

    /// Pumps until the current work is gone, waiting indefinitely.
    pub fn run(&self) -> Result<bool> {
        self.run_until(None)
    }

    /// Schedules `f` to run on the owning thread during a future `run`.
    /// The only thread-safe entry point; see also [`poster`](Self::poster)
    /// for a cloneable token other threads can hold.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.shared.post(Box::new(f));
    }

    /// A cloneable, `Send + Sync` token for posting from other threads.
    pub fn poster(&self) -> ServicePoster {
        ServicePoster {
            shared: Arc::clone(&self.inner.shared),
        }
    }
}

impl Default for IoService {
    fn default() -> IoService {
        IoService::new()
    }
}

impl std::fmt::Debug for IoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoService")
            .field("work_queued", &self.work_queued())
            .field("pending", &self.inner.pending.borrow().len())
            .finish()
    }
}

/// Posts callables to an [`IoService`] from any thread.
#[derive(Clone)]
pub struct ServicePoster {
    shared: Arc<Shared>,
}

impl ServicePoster {
    /// Schedules `f` to run on the service's owning thread during a
    /// future `run`.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(f));
    }
}

impl std::fmt::Debug for ServicePoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePoster").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_service_reports_no_work() {
        let s = IoService::new();
        assert_eq!(s.work_queued(), 0);
        assert_eq!(s.run().unwrap(), false);
    }

    #[test]
    fn posts_run_on_the_owning_thread() {
        let s = IoService::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let owner = std::thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel::<std::thread::ThreadId>();
        let poster = s.poster();
        let t = std::thread::spawn(move || {
            poster.post(move || {
                tx.send(std::thread::current().id()).unwrap();
            });
        });
        t.join().unwrap();
        assert_eq!(s.work_queued(), 1);
        {
            let hit = Arc::clone(&hit);
            s.post(move || {
                hit.fetch_add(1, Ordering::SeqCst);
            });
        }
        while s.run().unwrap() {}
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().unwrap(), owner);
        assert_eq!(s.work_queued(), 0);
    }

    #[test]
    fn interruption_signal_is_stable() {
        assert_eq!(interruption_signal(), interruption_signal());
    }
}
