//! Level-triggered, single-threaded event multiplexer (spec §4.1).
//!
//! Watches a small set of file descriptors with `poll(2)` and dispatches
//! readiness to registered callbacks, in order, to completion. Handles may
//! be added or removed from within their own callback.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use bitflags::bitflags;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{pipe, read, write};

bitflags! {
    /// Readiness kinds a handle can be watched for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const EXCEPTION = 0b100;
    }
}

impl Interest {
    fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(Interest::READABLE) {
            flags |= PollFlags::POLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            flags |= PollFlags::POLLOUT;
        }
        if self.contains(Interest::EXCEPTION) {
            flags |= PollFlags::POLLPRI;
        }
        flags
    }
}

type Callback = Box<dyn FnMut(RawFd)>;

/// Opaque handle to a registered watch, returned by [`Reactor::watch`].
/// Needed because more than one watch can target the same fd (e.g. the
/// control state machine watches the sink for exception readiness while
/// the stream orchestrator separately watches it for readable
/// readiness); `fd` alone cannot identify which one to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId(u64);

struct Watch {
    id: WatchId,
    fd: RawFd,
    interest: Interest,
    callback: Callback,
}

/// Single-threaded cooperative reactor.
///
/// `watch`/`unwatch`/`run` all take `&self`: every mutable field is behind
/// a `Cell`/`RefCell` rather than requiring `&mut self`, so a callback can
/// call back into the very `Reactor` that is driving it (register a new
/// watch, remove its own, request `stop()`) without a second, conflicting
/// borrow — the `RefCell` borrow around the watch list is only held while
/// building the pollfd set or splicing a single watch in or out, never for
/// the duration of a callback invocation or the whole `run()` loop. Still
/// no locks, no atomics: everything here assumes single-threaded, to-
/// completion dispatch; `stop()` is the only thing ever touched from
/// outside that loop (another OS thread, or a signal handler).
pub struct Reactor {
    watches: RefCell<Vec<Watch>>,
    next_id: Cell<u64>,
    stop_read: OwnedFd,
    stop_write: OwnedFd,
    stopped: Cell<bool>,
}

impl Reactor {
    pub fn new() -> nix::Result<Self> {
        let (stop_read, stop_write) = pipe()?;
        nix::fcntl::fcntl(
            stop_read,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;
        nix::fcntl::fcntl(
            stop_write,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;
        // SAFETY: fresh fds from `pipe()`, not owned elsewhere.
        let stop_read = unsafe { OwnedFd::from_raw_fd(stop_read) };
        let stop_write = unsafe { OwnedFd::from_raw_fd(stop_write) };
        Ok(Reactor {
            watches: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            stop_read,
            stop_write,
            stopped: Cell::new(false),
        })
    }

    /// Raw fd of the write end of the self-pipe, for registering with
    /// `signal_hook::low_level::pipe::register` so a SIGINT handler can
    /// wake the reactor without touching any non-signal-safe state.
    pub fn wakeup_fd(&self) -> RawFd {
        self.stop_write.as_raw_fd()
    }

    /// Register `fd` for `interest`; `callback` is invoked with `fd` on
    /// each matching readiness edge. Multiple watches may target the same
    /// `fd` with different interests (e.g. exception vs. readable) — each
    /// is dispatched independently; `poll(2)` tolerates duplicate fds in
    /// its pollfd set.
    pub fn watch(&self, fd: RawFd, interest: Interest, callback: Callback) -> WatchId {
        let id = WatchId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.watches.borrow_mut().push(Watch { id, fd, interest, callback });
        id
    }

    /// Remove a previously registered watch by id. Safe to call from
    /// within that watch's own callback.
    pub fn unwatch(&self, id: WatchId) {
        self.watches.borrow_mut().retain(|w| w.id != id);
    }

    /// Request that `run` return at the next opportunity. Safe to call
    /// from any thread, or from inside a callback. Not used by this
    /// binary's SIGINT path: a real signal handler can only call
    /// async-signal-safe code, so `main` registers `wakeup_fd()` directly
    /// with `signal_hook` instead of calling through here.
    #[allow(dead_code)]
    pub fn stop(&self) {
        let _ = write(self.stop_write.as_raw_fd(), &[1u8]);
    }

    /// Block until `stop()` is called. A `poll(2)` wait error other than
    /// interrupted-by-signal is fatal and returned.
    pub fn run(&self) -> nix::Result<()> {
        self.stopped.set(false);
        while !self.stopped.get() {
            let stop_fd = self.stop_read.as_raw_fd();
            // SAFETY: fds outlive the poll() call; they're owned by
            // self/self.watches for the duration of this borrow, which we
            // drop before invoking any callback.
            let stop_borrow = unsafe { BorrowedFd::borrow_raw(stop_fd) };

            // Snapshot (id, fd, interest) before borrowing each fd, so the
            // `RefCell` borrow of `watches` doesn't need to outlive the
            // `poll()` call below (a callback invoked later in this same
            // iteration may need to `watch()`/`unwatch()` on `self`).
            let snapshot: Vec<(WatchId, RawFd, Interest)> =
                self.watches.borrow().iter().map(|w| (w.id, w.fd, w.interest)).collect();
            let ids: Vec<WatchId> = snapshot.iter().map(|(id, _, _)| *id).collect();
            // SAFETY: each fd is owned by a live `Watch` until explicitly
            // unwatched; none of that happens between the snapshot above
            // and the `poll()` call below.
            let borrows: Vec<BorrowedFd> =
                snapshot.iter().map(|(_, fd, _)| unsafe { BorrowedFd::borrow_raw(*fd) }).collect();
            let mut pollfds: Vec<PollFd> = Vec::with_capacity(snapshot.len() + 1);
            pollfds.push(PollFd::new(&stop_borrow, PollFlags::POLLIN));
            for ((_, _, interest), borrow) in snapshot.iter().zip(borrows.iter()) {
                pollfds.push(PollFd::new(borrow, interest.to_poll_flags()));
            }

            match poll(&mut pollfds, -1) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }

            if let Some(revents) = pollfds[0].revents() {
                if !revents.is_empty() {
                    self.drain_stop_pipe();
                    self.stopped.set(true);
                    continue;
                }
            }

            let ready: Vec<WatchId> = pollfds[1..]
                .iter()
                .zip(ids.iter())
                .filter(|(pfd, _)| pfd.revents().is_some_and(|r| !r.is_empty()))
                .map(|(_, id)| *id)
                .collect();

            for id in ready {
                if self.stopped.get() {
                    break;
                }
                // Swap the callback out for a no-op placeholder rather than
                // removing the whole watch, so the entry (and thus its
                // presence/absence) stays an honest record of whether
                // `unwatch(id)` was called *from inside this very
                // callback* — checking `self.stopped` instead would race
                // `stop()`, which only writes a byte to the self-pipe and
                // isn't observed until the next `poll()` drains it.
                let taken = {
                    let mut watches = self.watches.borrow_mut();
                    watches.iter_mut().find(|w| w.id == id).map(|w| {
                        let fd = w.fd;
                        let callback = std::mem::replace(&mut w.callback, Box::new(|_| {}));
                        (fd, callback)
                    })
                };
                let Some((fd, mut callback)) = taken else { continue };
                callback(fd);
                let mut watches = self.watches.borrow_mut();
                if let Some(w) = watches.iter_mut().find(|w| w.id == id) {
                    w.callback = callback;
                }
            }
        }
        Ok(())
    }

    fn drain_stop_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.stop_read.as_raw_fd(), &mut buf) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn stop_unblocks_run_with_no_watches() {
        let reactor = Reactor::new().unwrap();
        reactor.stop();
        reactor.run().unwrap();
    }

    /// A watch callback drains the byte that made it ready, then stops the
    /// reactor through a cloned handle — the same `Rc<Reactor>` wiring
    /// `main.rs` uses, and the pattern spec §4.1 requires be safe
    /// ("removing or re-arming a handle from within its own callback").
    #[test]
    fn readable_watch_dispatches_then_stop_from_callback_unblocks_run() {
        let (r, w) = pipe().unwrap();
        let calls = Rc::new(Cell::new(0));
        let reactor = Rc::new(Reactor::new().unwrap());

        let calls_cb = calls.clone();
        let reactor_cb = reactor.clone();
        reactor.watch(
            r,
            Interest::READABLE,
            Box::new(move |fd| {
                let mut buf = [0u8; 1];
                read(fd, &mut buf).unwrap();
                calls_cb.set(calls_cb.get() + 1);
                reactor_cb.stop();
            }),
        );
        write(w, &[1u8]).unwrap();

        reactor.run().unwrap();
        assert_eq!(calls.get(), 1);
    }

    /// A callback may register a brand-new watch on the very reactor that
    /// is currently dispatching it (the orchestrator does exactly this on
    /// STREAMON, from inside a callback the control state machine's own
    /// watch triggered) without deadlocking or panicking on a borrow.
    #[test]
    fn watch_can_register_another_watch_from_within_a_callback() {
        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();
        let reactor = Rc::new(Reactor::new().unwrap());
        let inner_calls = Rc::new(Cell::new(0));

        let reactor_cb = reactor.clone();
        let inner_calls_cb = inner_calls.clone();
        let reactor_for_inner = reactor.clone();
        reactor.watch(
            r1,
            Interest::READABLE,
            Box::new(move |fd| {
                let mut buf = [0u8; 1];
                read(fd, &mut buf).unwrap();
                let inner_calls_cb2 = inner_calls_cb.clone();
                let reactor_stop = reactor_for_inner.clone();
                reactor_for_inner.watch(
                    r2,
                    Interest::READABLE,
                    Box::new(move |fd2| {
                        let mut buf2 = [0u8; 1];
                        read(fd2, &mut buf2).unwrap();
                        inner_calls_cb2.set(inner_calls_cb2.get() + 1);
                        reactor_stop.stop();
                    }),
                );
                write(w2, &[1u8]).unwrap();
                let _ = reactor_cb.wakeup_fd();
            }),
        );
        write(w1, &[1u8]).unwrap();

        reactor.run().unwrap();
        assert_eq!(inner_calls.get(), 1);
    }

    /// Level-triggered: a byte left undrained keeps the fd ready across
    /// iterations, so a callback that unwatches itself on the first edge
    /// must not be invoked again on the second.
    #[test]
    fn unwatch_from_callback_stops_further_dispatch() {
        let (r, w) = pipe().unwrap();
        let calls = Rc::new(Cell::new(0));
        let reactor = Rc::new(Reactor::new().unwrap());

        let calls_cb = calls.clone();
        let reactor_cb = reactor.clone();
        let id = Rc::new(Cell::new(None));
        let id_cb = id.clone();
        let watch_id = reactor.watch(
            r,
            Interest::READABLE,
            Box::new(move |_fd| {
                calls_cb.set(calls_cb.get() + 1);
                if let Some(id) = id_cb.get() {
                    reactor_cb.unwatch(id);
                }
                reactor_cb.stop();
            }),
        );
        id.set(Some(watch_id));
        write(w, &[1u8]).unwrap();

        reactor.run().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(reactor.watches.borrow().len(), 0);
    }
}
