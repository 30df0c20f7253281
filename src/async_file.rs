//! File handles bound to an [`IoService`] for asynchronous scatter/gather
//! I/O.
//!
//! Each submission builds a pinned per-I/O state holding the kernel
//! control blocks and a one-shot completion handler. The handler is
//! invoked exactly once: on the reactor thread when the kernel finishes,
//! or synchronously when submission itself fails. Dropping a state with
//! items still in flight cancels them and pumps the reactor until they
//! drain, so the kernel can never touch freed memory.

use std::cell::Cell;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::marker::PhantomPinned;
use std::ops::Deref;
use std::path::Path;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use smallvec::SmallVec;

use crate::deadline::Deadline;
use crate::deadline::DeadlineTracker;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::fatal;
use crate::file::Creation;
use crate::file::FileHandle;
use crate::file::Mode;
use crate::handle::Caching;
use crate::handle::HandleFlags;
use crate::io::Buffer;
use crate::io::ConstBuffer;
use crate::io::IoBuffer;
use crate::io::IoRequest;
use crate::path_handle::PathHandle;
use crate::service::IoService;
use crate::service::ServiceInner;

/// What one async submission does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AsyncOp {
    Read,
    Write,
    /// Flush data and metadata.
    Fsync,
    /// Flush data only.
    Fdatasync,
}

/// A raw (pointer, length) snapshot of one buffer; lengths are updated in
/// place as items complete.
#[derive(Clone, Copy, Debug)]
struct RawSlot {
    ptr: *mut u8,
    len: usize,
}

/// The state of one in-flight asynchronous operation.
///
/// Address-stable (pinned): the kernel holds pointers into it until every
/// item completes.
pub struct IoState<'a> {
    inner: Rc<ServiceInner>,
    fd: libc::c_int,
    op: AsyncOp,
    items_to_go: Cell<usize>,
    /// First error among the items, which decides the overall result.
    error: Cell<Option<libc::c_int>>,
    bufs: RefCell<SmallVec<[RawSlot; 4]>>,
    completion: RefCell<Option<Box<dyn FnOnce(Result<u64>) + 'a>>>,
    aiocbs: Box<[libc::aiocb]>,
    _pin: PhantomPinned,
    _marker: PhantomData<&'a mut [u8]>,
}

/// Owning pointer to an in-flight operation's state.
pub type IoStatePtr<'a> = Pin<Box<IoState<'a>>>;

impl<'a> IoState<'a> {
    /// True once every item has completed and the handler has run.
    pub fn is_finished(&self) -> bool {
        self.items_to_go.get() == 0
    }

    /// Total bytes transferred so far across the items.
    pub fn bytes_transferred(&self) -> u64 {
        self.bufs.borrow().iter().map(|s| s.len as u64).sum()
    }

    /// The final outcome, once finished.
    pub fn result(&self) -> Option<Result<u64>> {
        if !self.is_finished() {
            return None;
        }
        Some(self.outcome())
    }

    fn outcome(&self) -> Result<u64> {
        match self.error.get() {
            Some(errno) => Err(Error::from_errno(errno)),
            None => Ok(self.bytes_transferred()),
        }
    }

    pub(crate) fn buffer_lens(&self) -> SmallVec<[usize; 4]> {
        self.bufs.borrow().iter().map(|s| s.len).collect()
    }

    /// Folds one item's completion into the state; the last item fires the
    /// handler.
    fn complete_item(&self, cb: *mut libc::aiocb, errno: libc::c_int, bytes: isize) {
        debug_assert!(self.items_to_go.get() > 0);
        let base = self.aiocbs.as_ptr() as usize;
        let idx = (cb as usize - base) / std::mem::size_of::<libc::aiocb>();
        if self.error.get().is_none() {
            if errno == 0 {
                let mut bufs = self.bufs.borrow_mut();
                if let Some(slot) = bufs.get_mut(idx) {
                    slot.len = bytes.max(0) as usize;
                }
            } else {
                self.error.set(Some(errno));
            }
        }
        let left = self.items_to_go.get() - 1;
        self.items_to_go.set(left);
        if left == 0 {
            if let Some(f) = self.completion.borrow_mut().take() {
                f(self.outcome());
            }
        }
    }
}

impl std::fmt::Debug for IoState<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoState")
            .field("op", &self.op)
            .field("items_to_go", &self.items_to_go.get())
            .field("error", &self.error.get())
            .finish()
    }
}

impl Drop for IoState<'_> {
    fn drop(&mut self) {
        if self.items_to_go.get() == 0 {
            return;
        }
        // Cancel whatever is still in flight, then pump the reactor until
        // the kernel confirms it has let go of our memory.
        for cb in self.aiocbs.iter_mut() {
            let cbp: *mut libc::aiocb = cb;
            if unsafe { libc::aio_error(cbp) } == libc::EINPROGRESS {
                unsafe { libc::aio_cancel(self.fd, cbp) };
            }
        }
        while self.items_to_go.get() > 0 {
            if let Err(e) = self.inner.run_until(None) {
                fatal("draining cancelled async i/o failed", &e);
            }
        }
    }
}

/// Invoked by the reactor for each finished kernel control block.
pub(crate) unsafe fn dispatch_completion(
    sival: *mut libc::c_void,
    cb: *mut libc::aiocb,
    errno: libc::c_int,
    bytes: isize,
) {
    let state = unsafe { &*(sival as *const IoState<'static>) };
    state.complete_item(cb, errno, bytes);
}

fn begin_io<'a>(
    inner: Rc<ServiceInner>,
    fd: libc::c_int,
    op: AsyncOp,
    offset: u64,
    slots: SmallVec<[RawSlot; 4]>,
    completion: Box<dyn FnOnce(Result<u64>) + 'a>,
) -> Result<IoStatePtr<'a>> {
    let items = match op {
        AsyncOp::Read | AsyncOp::Write => slots.len(),
        AsyncOp::Fsync | AsyncOp::Fdatasync => 1,
    };
    if items == 0 {
        return Err(Error::new(ErrorKind::InvalidArgument));
    }
    let aiocbs: Box<[libc::aiocb]> = (0..items)
        .map(|_| unsafe { std::mem::zeroed::<libc::aiocb>() })
        .collect();
    let local_slots = slots.clone();
    let mut state = Box::pin(IoState {
        inner: Rc::clone(&inner),
        fd,
        op,
        items_to_go: Cell::new(items),
        error: Cell::new(None),
        bufs: RefCell::new(slots),
        completion: RefCell::new(Some(completion)),
        aiocbs,
        _pin: PhantomPinned,
        _marker: PhantomData,
    });
    let sival = &*state as *const IoState<'_> as *mut libc::c_void;

    // The state is pinned now; wire the control blocks back to it.
    {
        let st = unsafe { Pin::get_unchecked_mut(state.as_mut()) };
        let mut running = offset;
        for (i, cb) in st.aiocbs.iter_mut().enumerate() {
            cb.aio_fildes = fd;
            cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
            cb.aio_sigevent.sigev_value = libc::sigval { sival_ptr: sival };
            match op {
                AsyncOp::Read | AsyncOp::Write => {
                    cb.aio_buf = local_slots[i].ptr as *mut libc::c_void;
                    cb.aio_nbytes = local_slots[i].len;
                    cb.aio_offset = running as libc::off_t;
                    cb.aio_lio_opcode = if op == AsyncOp::Read {
                        libc::LIO_READ
                    } else {
                        libc::LIO_WRITE
                    };
                    running += local_slots[i].len as u64;
                }
                AsyncOp::Fsync | AsyncOp::Fdatasync => {}
            }
        }
    }

    let mut cb_ptrs: SmallVec<[*mut libc::aiocb; 4]> = {
        let st = unsafe { Pin::get_unchecked_mut(state.as_mut()) };
        st.aiocbs.iter_mut().map(|cb| cb as *mut libc::aiocb).collect()
    };

    inner.register(cb_ptrs.iter().copied());
    inner.shared.work_enqueued(items);

    let rc = match op {
        AsyncOp::Read | AsyncOp::Write => unsafe {
            libc::lio_listio(
                libc::LIO_NOWAIT,
                cb_ptrs.as_mut_ptr() as *const *mut libc::aiocb,
                items as libc::c_int,
                std::ptr::null_mut(),
            )
        },
        AsyncOp::Fsync => unsafe { libc::aio_fsync(libc::O_SYNC, cb_ptrs[0]) },
        AsyncOp::Fdatasync => unsafe { libc::aio_fsync(libc::O_DSYNC, cb_ptrs[0]) },
    };
    if rc != 0 {
        let submit_errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        // Some items may have entered flight anyway. Anything the kernel
        // does not report as in progress completes here and now, keeping
        // the exactly-once handler contract.
        for &cbp in &cb_ptrs {
            let e = unsafe { libc::aio_error(cbp) };
            if e == libc::EINPROGRESS {
                continue;
            }
            inner.deregister(cbp);
            inner.shared.work_done();
            let item_errno = if e > 0 { e } else { submit_errno };
            state.complete_item(cbp, item_errno, -1);
        }
    }
    Ok(state)
}

/// A [`FileHandle`] whose I/O is multiplexed through an [`IoService`].
///
/// Holding the service by `Rc` makes this handle `!Send`, which is the
/// compile-time form of the reactor's rule that all async I/O happens on
/// the owning thread.
pub struct AsyncFileHandle {
    fh: FileHandle,
    inner: Rc<ServiceInner>,
}

impl std::fmt::Debug for AsyncFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFileHandle").field("fh", &self.fh).finish()
    }
}

impl AsyncFileHandle {
    /// Opens a file and binds it to `service`.
    pub fn open_at(
        service: &IoService,
        base: Option<&PathHandle>,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<AsyncFileHandle> {
        let fh = FileHandle::open_at(base, path, mode, creation, caching, flags)?;
        Ok(Self::from_file(service, fh))
    }

    /// Opens a file by path and binds it to `service`.
    pub fn open(
        service: &IoService,
        path: &Path,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<AsyncFileHandle> {
        Self::open_at(service, None, path, mode, creation, caching, flags)
    }

    /// Binds an already open file to `service`.
    pub fn from_file(service: &IoService, fh: FileHandle) -> AsyncFileHandle {
        AsyncFileHandle {
            fh,
            inner: service.inner(),
        }
    }

    /// The underlying file handle.
    pub fn as_file(&self) -> &FileHandle {
        &self.fh
    }

    /// Submits a scatter read. `completion` is invoked exactly once with
    /// the total bytes read or the first error.
    ///
    /// The buffers must stay valid until the returned state reports
    /// finished; dropping the state early cancels and drains first.
    pub fn async_read<'a>(
        &self,
        req: IoRequest<'_, Buffer<'a>>,
        completion: impl FnOnce(Result<u64>) + 'a,
    ) -> Result<IoStatePtr<'a>> {
        let slots = req
            .buffers
            .iter()
            .map(|b| RawSlot {
                ptr: b.as_byte_ptr() as *mut u8,
                len: b.len(),
            })
            .collect();
        begin_io(
            Rc::clone(&self.inner),
            self.fh.fd(),
            AsyncOp::Read,
            req.offset,
            slots,
            Box::new(completion),
        )
    }

    /// Submits a gather write; the mirror of
    /// [`async_read`](Self::async_read).
    pub fn async_write<'a>(
        &self,
        req: IoRequest<'_, ConstBuffer<'a>>,
        completion: impl FnOnce(Result<u64>) + 'a,
    ) -> Result<IoStatePtr<'a>> {
        let slots = req
            .buffers
            .iter()
            .map(|b| RawSlot {
                ptr: b.as_byte_ptr() as *mut u8,
                len: b.len(),
            })
            .collect();
        begin_io(
            Rc::clone(&self.inner),
            self.fh.fd(),
            AsyncOp::Write,
            req.offset,
            slots,
            Box::new(completion),
        )
    }

    /// Submits an asynchronous durability barrier over the whole file:
    /// data only, or data and metadata.
    pub fn async_barrier<'a>(
        &self,
        and_metadata: bool,
        completion: impl FnOnce(Result<u64>) + 'a,
    ) -> Result<IoStatePtr<'a>> {
        let op = if and_metadata { AsyncOp::Fsync } else { AsyncOp::Fdatasync };
        begin_io(
            Rc::clone(&self.inner),
            self.fh.fd(),
            op,
            0,
            SmallVec::new(),
            Box::new(completion),
        )
    }

    /// Submits a scatter read and returns a future for its outcome.
    ///
    /// The future resolves with the bytes transferred once the owning
    /// reactor delivers the completion, so something must keep pumping
    /// [`IoService::run_until`] for it to ever become ready; awaiting it
    /// from a task driven by that same pump is the intended shape.
    /// Dropping the future cancels and drains the submission.
    pub fn read_future<'a>(
        &self,
        req: IoRequest<'_, Buffer<'a>>,
    ) -> Result<IoFuture<'a>> {
        let link = Rc::new(FutureLink::default());
        let state = {
            let link = Rc::clone(&link);
            self.async_read(req, move |r| link.complete(r))?
        };
        Ok(IoFuture { _state: state, link })
    }

    /// Submits a gather write and returns a future for its outcome.
    pub fn write_future<'a>(
        &self,
        req: IoRequest<'_, ConstBuffer<'a>>,
    ) -> Result<IoFuture<'a>> {
        let link = Rc::new(FutureLink::default());
        let state = {
            let link = Rc::clone(&link);
            self.async_write(req, move |r| link.complete(r))?
        };
        Ok(IoFuture { _state: state, link })
    }

    /// Submits a whole-file durability barrier and returns a future for
    /// its outcome.
    pub fn barrier_future(&self, and_metadata: bool) -> Result<IoFuture<'static>> {
        let link = Rc::new(FutureLink::default());
        let state = {
            let link = Rc::clone(&link);
            self.async_barrier(and_metadata, move |r| link.complete(r))?
        };
        Ok(IoFuture { _state: state, link })
    }

    /// Scatter read that blocks the calling thread by pumping the owning
    /// reactor, so other async work keeps completing meanwhile.
    pub fn read<'r, 'a>(
        &self,
        req: IoRequest<'r, Buffer<'a>>,
        deadline: Option<Deadline>,
    ) -> Result<&'r mut [Buffer<'a>]> {
        let tracker = DeadlineTracker::new(deadline);
        let IoRequest { buffers, offset } = req;
        let finished: Rc<Cell<Option<Result<u64>>>> = Rc::new(Cell::new(None));
        let state = {
            let finished = Rc::clone(&finished);
            let mut probe: SmallVec<[Buffer<'a>; 4]> =
                buffers.iter().copied().collect();
            self.async_read(
                IoRequest::new(&mut probe, offset),
                move |r| finished.set(Some(r)),
            )?
        };
        self.pump_to_completion(&tracker, &finished, &state)?;
        let lens = state.buffer_lens();
        let mut used = 0;
        for (b, len) in buffers.iter_mut().zip(lens) {
            b.set_len(len);
            if len > 0 {
                used += 1;
            }
        }
        Ok(&mut buffers[..used])
    }

    /// Gather write that blocks by pumping the owning reactor.
    pub fn write<'r, 'a>(
        &self,
        req: IoRequest<'r, ConstBuffer<'a>>,
        deadline: Option<Deadline>,
    ) -> Result<&'r [ConstBuffer<'a>]> {
        let tracker = DeadlineTracker::new(deadline);
        let IoRequest { buffers, offset } = req;
        let finished: Rc<Cell<Option<Result<u64>>>> = Rc::new(Cell::new(None));
        let state = {
            let finished = Rc::clone(&finished);
            let mut probe: SmallVec<[ConstBuffer<'a>; 4]> =
                buffers.iter().copied().collect();
            self.async_write(
                IoRequest::new(&mut probe, offset),
                move |r| finished.set(Some(r)),
            )?
        };
        self.pump_to_completion(&tracker, &finished, &state)?;
        let lens = state.buffer_lens();
        let mut used = 0;
        for (b, len) in buffers.iter_mut().zip(lens) {
            b.set_len(len);
            if len > 0 {
                used += 1;
            }
        }
        Ok(&buffers[..used])
    }

    /// Barrier that blocks by pumping the owning reactor.
    pub fn barrier(
        &self,
        and_metadata: bool,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        let tracker = DeadlineTracker::new(deadline);
        let finished: Rc<Cell<Option<Result<u64>>>> = Rc::new(Cell::new(None));
        let state = {
            let finished = Rc::clone(&finished);
            self.async_barrier(and_metadata, move |r| finished.set(Some(r)))?
        };
        self.pump_to_completion(&tracker, &finished, &state)?;
        Ok(())
    }

    fn pump_to_completion(
        &self,
        tracker: &DeadlineTracker,
        finished: &Rc<Cell<Option<Result<u64>>>>,
        _state: &IoStatePtr<'_>,
    ) -> Result<()> {
        loop {
            if let Some(r) = finished.take() {
                r?;
                return Ok(());
            }
            tracker.check()?;
            let round = tracker.remaining().map(Deadline::Relative);
            match self.inner.run_until(round) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    // Fall through: the deadline check above returns
                    // TimedOut once the tracker agrees, and dropping the
                    // state cancels and drains the submission.
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Deref for AsyncFileHandle {
    type Target = FileHandle;

    fn deref(&self) -> &FileHandle {
        &self.fh
    }
}

/// Shared slot between a submission's completion handler and the future
/// awaiting it.
#[derive(Default)]
struct FutureLink {
    outcome: Cell<Option<Result<u64>>>,
    waker: RefCell<Option<Waker>>,
}

impl FutureLink {
    fn complete(&self, r: Result<u64>) {
        self.outcome.set(Some(r));
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
    }
}

/// The outcome of one asynchronous operation, awaitable as a [`Future`].
///
/// Completion delivery still happens inside [`IoService::run_until`], so
/// the future only makes progress while the owning reactor is pumped.
/// Dropping it cancels the submission and drains the kernel first.
pub struct IoFuture<'a> {
    _state: IoStatePtr<'a>,
    link: Rc<FutureLink>,
}

impl Future for IoFuture<'_> {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<u64>> {
        if let Some(r) = self.link.outcome.take() {
            return Poll::Ready(r);
        }
        // Completions are delivered on this same thread, so nothing can
        // land between the check above and this store.
        *self.link.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for IoFuture<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoFuture").finish()
    }
}
