//! `poll(2)` based reactor.
//!
//! Registrations and timers live behind a `RefCell`; the borrow is always
//! released before a callback runs so callbacks can freely re-enter.

// Descriptors are registered by number; `poll` needs them as `BorrowedFd`.
#![allow(unsafe_code)]

use super::{Reactor, Readiness, ReadinessCallback, TimerCallback, TimerToken};
use crate::config::TransportConfig;
use crate::{GatewayError, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

struct Registration {
    interest: Readiness,
    callback: ReadinessCallback,
    /// Distinguishes a re-registration of a reused descriptor number from
    /// the registration that was polled.
    generation: u64,
}

#[derive(Default)]
struct ReactorState {
    registrations: BTreeMap<RawFd, Registration>,
    timers: BTreeMap<(Instant, u64), TimerCallback>,
    timer_deadlines: HashMap<u64, Instant>,
    next_token: u64,
    next_generation: u64,
}

/// Single-threaded reactor driving readiness callbacks and one-shot timers.
#[derive(Default)]
pub struct PollReactor {
    state: RefCell<ReactorState>,
    stopped: Cell<bool>,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `max_wait` (less if a timer is due sooner), then dispatch
    /// ready descriptors followed by expired timers.
    ///
    /// Returns the number of callbacks invoked.
    pub fn run_once(&self, max_wait: Duration) -> Result<usize> {
        let wait = self.next_wait(max_wait);
        let snapshot: Vec<(RawFd, Readiness, u64)> = self
            .state
            .borrow()
            .registrations
            .iter()
            .map(|(fd, reg)| (*fd, reg.interest, reg.generation))
            .collect();

        let mut dispatched = 0;
        if snapshot.is_empty() {
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        } else {
            let ready = match Self::wait_ready(&snapshot, wait) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => Vec::new(),
                Err(e) => {
                    return Err(GatewayError::socket(
                        "poll failed",
                        std::io::Error::from(e),
                    ))
                }
            };

            for (fd, generation, flags) in ready {
                // The registration may have been dropped or replaced by an
                // earlier callback in this cycle.
                let callback = {
                    let state = self.state.borrow();
                    match state.registrations.get(&fd) {
                        Some(reg) if reg.generation == generation => reg.callback.clone(),
                        _ => continue,
                    }
                };
                trace!(fd, ?flags, "dispatching readiness");
                callback(fd, flags);
                dispatched += 1;
            }
        }

        dispatched += self.fire_due_timers();
        Ok(dispatched)
    }

    /// Run until `predicate` returns true or `timeout` elapses.
    ///
    /// Returns whether the predicate was satisfied.
    pub fn run_until(&self, mut predicate: impl FnMut() -> bool, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(Duration::from_millis(10));
            self.run_once(slice)?;
        }
    }

    /// Run until [`stop`](Self::stop) is called from a callback.
    pub fn run(&self) -> Result<()> {
        while !self.stopped.get() {
            self.run_once(TransportConfig::DEFAULT_POLL_WAIT)?;
        }
        self.stopped.set(false);
        Ok(())
    }

    /// Make [`run`](Self::run) return after the current cycle.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.state.borrow().registrations.contains_key(&fd)
    }

    pub fn registration_count(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    fn next_wait(&self, max_wait: Duration) -> Duration {
        let state = self.state.borrow();
        match state.timers.keys().next() {
            Some((deadline, _)) => deadline
                .saturating_duration_since(Instant::now())
                .min(max_wait),
            None => max_wait,
        }
    }

    fn wait_ready(
        snapshot: &[(RawFd, Readiness, u64)],
        wait: Duration,
    ) -> std::result::Result<Vec<(RawFd, u64, Readiness)>, Errno> {
        let mut poll_fds: Vec<PollFd<'_>> = snapshot
            .iter()
            .map(|(fd, interest, _)| {
                // SAFETY: owners unregister a descriptor before closing it, and
                // the borrowed handles do not outlive this function.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, to_poll_flags(*interest))
            })
            .collect();

        // Round up so sub-millisecond timer waits do not spin.
        let millis = wait.as_micros().div_ceil(1000).min(u16::MAX as u128) as u16;
        poll(&mut poll_fds, PollTimeout::from(millis))?;

        Ok(poll_fds
            .iter()
            .zip(snapshot)
            .filter_map(|(pfd, (fd, _, generation))| {
                let flags = from_poll_flags(pfd.revents()?);
                (!flags.is_empty()).then_some((*fd, *generation, flags))
            })
            .collect())
    }

    fn fire_due_timers(&self) -> usize {
        let now = Instant::now();
        // Timers scheduled by callbacks in this pass wait for the next cycle.
        let token_limit = self.state.borrow().next_token;
        let mut fired = 0;
        loop {
            let callback = {
                let mut state = self.state.borrow_mut();
                let due = match state.timers.keys().next() {
                    Some(&(deadline, token)) if deadline <= now && token < token_limit => {
                        (deadline, token)
                    }
                    _ => break,
                };
                state.timer_deadlines.remove(&due.1);
                match state.timers.remove(&due) {
                    Some(callback) => callback,
                    None => break,
                }
            };
            callback();
            fired += 1;
        }
        fired
    }
}

impl Reactor for PollReactor {
    fn register_readiness(&self, fd: RawFd, interest: Readiness, callback: ReadinessCallback) {
        if fd < 0 {
            warn!(fd, "ignoring registration of invalid descriptor");
            return;
        }
        let replaced = {
            let mut state = self.state.borrow_mut();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.registrations.insert(
                fd,
                Registration {
                    interest,
                    callback,
                    generation,
                },
            )
        };
        // Dropping a callback may drop its owner, which can re-enter here
        drop(replaced);
    }

    fn unregister_readiness(&self, fd: RawFd) {
        let removed = self.state.borrow_mut().registrations.remove(&fd);
        drop(removed);
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerToken {
        let mut state = self.state.borrow_mut();
        let token = state.next_token;
        state.next_token += 1;
        let deadline = Instant::now() + delay;
        state.timers.insert((deadline, token), callback);
        state.timer_deadlines.insert(token, deadline);
        TimerToken(token)
    }

    fn cancel(&self, token: TimerToken) {
        let removed = {
            let mut state = self.state.borrow_mut();
            state
                .timer_deadlines
                .remove(&token.0)
                .and_then(|deadline| state.timers.remove(&(deadline, token.0)))
        };
        drop(removed);
    }
}

fn to_poll_flags(interest: Readiness) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.contains(Readiness::READABLE) {
        flags |= PollFlags::POLLIN;
    }
    if interest.contains(Readiness::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn from_poll_flags(revents: PollFlags) -> Readiness {
    let mut flags = Readiness::empty();
    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
        flags |= Readiness::READABLE;
    }
    if revents.contains(PollFlags::POLLOUT) {
        flags |= Readiness::WRITABLE;
    }
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
        flags |= Readiness::ERROR;
    }
    if revents.contains(PollFlags::POLLHUP) {
        flags |= Readiness::HANGUP;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let reactor = PollReactor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (label, delay) in [("late", 20u64), ("early", 1), ("middle", 10)] {
            let order = order.clone();
            reactor.schedule_once(
                Duration::from_millis(delay),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }

        let done = reactor
            .run_until(|| order.borrow().len() == 3, Duration::from_secs(2))
            .unwrap();
        assert!(done);
        assert_eq!(*order.borrow(), vec!["early", "middle", "late"]);
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let reactor = PollReactor::new();
        let fired = Rc::new(Cell::new(false));

        let flag = fired.clone();
        let token = reactor.schedule_once(Duration::from_millis(5), Box::new(move || flag.set(true)));
        reactor.cancel(token);
        // Cancelling twice is harmless
        reactor.cancel(token);

        reactor.run_once(Duration::from_millis(20)).unwrap();
        assert!(!fired.get());
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_readable_callback_and_self_unregister() {
        let reactor = Rc::new(PollReactor::new());
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();
        let hits = Rc::new(Cell::new(0));

        let r = reactor.clone();
        let counter = hits.clone();
        reactor.register_readiness(
            fd,
            Readiness::READABLE,
            Rc::new(move |fd, flags| {
                assert!(flags.contains(Readiness::READABLE));
                counter.set(counter.get() + 1);
                r.unregister_readiness(fd);
            }),
        );

        writer.write_all(b"x").unwrap();
        assert!(reactor.run_until(|| hits.get() == 1, Duration::from_secs(2)).unwrap());

        // Data is still unread, but the registration is gone
        reactor.run_once(Duration::from_millis(10)).unwrap();
        assert_eq!(hits.get(), 1);
        assert!(!reactor.is_registered(fd));
    }

    #[test]
    fn test_hangup_reported_without_interest() {
        let reactor = PollReactor::new();
        let (writer, reader) = UnixStream::pair().unwrap();
        let seen = Rc::new(Cell::new(Readiness::empty()));

        let flags_seen = seen.clone();
        reactor.register_readiness(
            reader.as_raw_fd(),
            Readiness::empty(),
            Rc::new(move |_, flags| flags_seen.set(flags)),
        );
        drop(writer);

        assert!(reactor
            .run_until(|| !seen.get().is_empty(), Duration::from_secs(2))
            .unwrap());
        assert!(seen.get().contains(Readiness::HANGUP));
    }

    /// Touches the reactor from `Drop`, the way an endpoint releases its
    /// descriptor when its last handle goes away.
    struct ReleasesOnDrop {
        reactor: Rc<PollReactor>,
        fd: RawFd,
        dropped: Rc<Cell<bool>>,
    }

    impl Drop for ReleasesOnDrop {
        fn drop(&mut self) {
            self.reactor.unregister_readiness(self.fd);
            self.reactor.cancel(TimerToken(u64::MAX));
            self.dropped.set(true);
        }
    }

    fn releases_on_drop(reactor: &Rc<PollReactor>, fd: RawFd) -> (ReleasesOnDrop, Rc<Cell<bool>>) {
        let dropped = Rc::new(Cell::new(false));
        let owner = ReleasesOnDrop {
            reactor: reactor.clone(),
            fd,
            dropped: dropped.clone(),
        };
        (owner, dropped)
    }

    #[test]
    fn test_cancel_drops_callback_outside_borrow() {
        let reactor = Rc::new(PollReactor::new());
        let (_writer, reader) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();
        reactor.register_readiness(fd, Readiness::READABLE, Rc::new(|_, _| {}));

        let (owner, dropped) = releases_on_drop(&reactor, fd);
        let token = reactor.schedule_once(
            Duration::from_secs(60),
            Box::new(move || drop(owner)),
        );
        reactor.cancel(token);

        assert!(dropped.get());
        assert!(!reactor.is_registered(fd));
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_replaced_and_removed_callbacks_drop_outside_borrow() {
        let reactor = Rc::new(PollReactor::new());
        let (_a, b) = UnixStream::pair().unwrap();
        let (_c, d) = UnixStream::pair().unwrap();
        let watched = b.as_raw_fd();
        let other = d.as_raw_fd();
        reactor.register_readiness(other, Readiness::READABLE, Rc::new(|_, _| {}));

        // Replacing a registration drops the old callback
        let (owner, dropped) = releases_on_drop(&reactor, other);
        reactor.register_readiness(watched, Readiness::READABLE, Rc::new(move |_, _| {
            let _owner = &owner;
        }));
        reactor.register_readiness(watched, Readiness::WRITABLE, Rc::new(|_, _| {}));
        assert!(dropped.get());
        assert!(!reactor.is_registered(other));

        // So does unregistering it
        let (owner, dropped) = releases_on_drop(&reactor, other);
        reactor.register_readiness(watched, Readiness::READABLE, Rc::new(move |_, _| {
            let _owner = &owner;
        }));
        reactor.unregister_readiness(watched);
        assert!(dropped.get());
        assert_eq!(reactor.registration_count(), 0);
    }

    #[test]
    fn test_poll_flag_mapping() {
        assert_eq!(
            to_poll_flags(Readiness::READABLE | Readiness::WRITABLE),
            PollFlags::POLLIN | PollFlags::POLLOUT
        );
        // Error and hang-up are never requested, poll reports them anyway
        assert_eq!(to_poll_flags(Readiness::ERROR | Readiness::HANGUP), PollFlags::empty());

        assert_eq!(
            from_poll_flags(PollFlags::POLLPRI | PollFlags::POLLHUP),
            Readiness::READABLE | Readiness::HANGUP
        );
        assert_eq!(from_poll_flags(PollFlags::POLLNVAL), Readiness::ERROR);
        assert!(from_poll_flags(PollFlags::empty()).is_empty());
    }

    #[test]
    fn test_stop_ends_run() {
        let reactor = Rc::new(PollReactor::new());
        let r = reactor.clone();
        reactor.schedule_once(Duration::from_millis(1), Box::new(move || r.stop()));
        reactor.run().unwrap();
        assert_eq!(reactor.pending_timers(), 0);
    }
}
