//! Readiness and child-exit multiplexer.
//!
//! One broker serves every session of a supervisor. It polls the master
//! descriptors the pumps are interested in, sweeps the registered children
//! with `waitpid(pid, WNOHANG)` between poll slices, and turns both into a
//! single [`Event`] stream.
//!
//! The broker is the only place a child is reaped, and a session's
//! [`Event::ChildExited`] is emitted exactly once. Master EOF and process exit
//! arrive in either order; [`ExitPolicy`] decides which of them releases the
//! exit event. A reaped child's master stays polled until it reaches EOF.
//!
//! No signal handlers are installed. A host process must not reap these
//! children with `waitpid(-1, ..)`; if it does, the exit is reported as
//! [`ExitStatus::Vanished`].

use std::collections::{HashMap, VecDeque};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::pty::{ChildProcess, ExitStatus};
use crate::session::SessionId;

/// Readiness a session's pump wants to hear about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }

    fn poll_flags(&self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.readable {
            flags |= PollFlags::POLLIN;
        }
        if self.writable {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// When a reaped child's exit is released to the supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    /// Release as soon as the child is reaped
    #[default]
    FirstConfirmation,
    /// Release once the child is reaped and the master has reached EOF, or
    /// when the linger period after the reap runs out
    AwaitEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable {
        session: SessionId,
        fd: RawFd,
    },
    Writable {
        session: SessionId,
        fd: RawFd,
    },
    ChildExited {
        session: SessionId,
        pid: Pid,
        status: ExitStatus,
    },
    SignalRaised {
        session: SessionId,
        signal: Signal,
    },
}

impl Event {
    pub fn session(&self) -> SessionId {
        match *self {
            Event::Readable { session, .. }
            | Event::Writable { session, .. }
            | Event::ChildExited { session, .. }
            | Event::SignalRaised { session, .. } => session,
        }
    }
}

#[derive(Debug)]
struct Registration {
    fd: RawFd,
    child: ChildProcess,
    interest: Interest,
    eof: bool,
    reaped_at: Option<Instant>,
    exit_delivered: bool,
}

#[derive(Debug)]
pub struct EventBroker {
    registrations: HashMap<SessionId, Registration>,
    pending: VecDeque<Event>,
    policy: ExitPolicy,
    eof_linger: Duration,
    reap_interval: Duration,
}

impl EventBroker {
    pub fn new(policy: ExitPolicy, eof_linger: Duration, reap_interval: Duration) -> Self {
        EventBroker {
            registrations: HashMap::new(),
            pending: VecDeque::new(),
            policy,
            eof_linger,
            reap_interval: reap_interval.max(Duration::from_millis(1)),
        }
    }

    /// Track a session's master descriptor and take ownership of its child.
    ///
    /// `fd` must stay open until the session is deregistered.
    pub fn register(&mut self, session: SessionId, fd: RawFd, child: ChildProcess) {
        tracing::debug!(%session, fd, pid = child.pid().as_raw(), "registered session");
        self.registrations.insert(
            session,
            Registration {
                fd,
                child,
                interest: Interest::default(),
                eof: false,
                reaped_at: None,
                exit_delivered: false,
            },
        );
    }

    /// Stop tracking a session and hand its child handle back.
    pub fn deregister(&mut self, session: SessionId) -> Option<ChildProcess> {
        self.pending.retain(|event| event.session() != session);
        self.registrations.remove(&session).map(|reg| reg.child)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn pid(&self, session: SessionId) -> Option<Pid> {
        self.registrations.get(&session).map(|reg| reg.child.pid())
    }

    pub fn set_interest(&mut self, session: SessionId, interest: Interest) {
        if let Some(reg) = self.registrations.get_mut(&session) {
            reg.interest = interest;
        }
    }

    /// Record that the session's master reached end of stream.
    ///
    /// The descriptor is no longer polled: a hung-up master reports `POLLHUP`
    /// on every call.
    pub fn mark_eof(&mut self, session: SessionId) {
        if let Some(reg) = self.registrations.get_mut(&session) {
            if !reg.eof {
                tracing::debug!(%session, "master reached end of stream");
                reg.eof = true;
            }
        }
    }

    /// Deliver `signal` to the session's process group.
    ///
    /// A [`Event::SignalRaised`] follows on the next poll.
    pub fn signal(&mut self, session: SessionId, signal: Signal) -> Result<(), Errno> {
        let reg = self.registrations.get(&session).ok_or(Errno::ESRCH)?;
        reg.child.signal_group(signal)?;
        tracing::debug!(%session, %signal, "signalled process group");
        self.pending
            .push_back(Event::SignalRaised { session, signal });
        Ok(())
    }

    /// Wait up to `timeout` (forever when `None`) for at least one event.
    ///
    /// Returns an empty list when the timeout passes without events.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>, Errno> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut events: Vec<Event> = self.pending.drain(..).collect();
            self.sweep_children(&mut events);

            let slice = if events.is_empty() {
                let mut slice = self.reap_interval;
                if let Some(deadline) = deadline {
                    slice = slice.min(deadline.saturating_duration_since(Instant::now()));
                }
                slice
            } else {
                Duration::ZERO
            };
            self.poll_descriptors(slice, &mut events)?;

            if !events.is_empty() {
                return Ok(events);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(events);
            }
        }
    }

    fn sweep_children(&mut self, events: &mut Vec<Event>) {
        let now = Instant::now();
        for (&session, reg) in self.registrations.iter_mut() {
            if reg.exit_delivered {
                continue;
            }
            if reg.reaped_at.is_none() {
                match reg.child.try_reap() {
                    Ok(Some(_)) => reg.reaped_at = Some(now),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(%session, error = %e, "waitpid failed");
                        continue;
                    }
                }
            }
            let release = match self.policy {
                ExitPolicy::FirstConfirmation => true,
                ExitPolicy::AwaitEof => {
                    reg.eof
                        || reg
                            .reaped_at
                            .is_some_and(|at| now.duration_since(at) >= self.eof_linger)
                }
            };
            if let (true, Some(status)) = (release, reg.child.status()) {
                reg.exit_delivered = true;
                events.push(Event::ChildExited {
                    session,
                    pid: reg.child.pid(),
                    status,
                });
            }
        }
    }

    fn poll_descriptors(&mut self, slice: Duration, events: &mut Vec<Event>) -> Result<(), Errno> {
        let watched: Vec<(SessionId, RawFd, Interest)> = self
            .registrations
            .iter()
            .filter(|(_, reg)| !reg.eof && !reg.interest.is_empty())
            .map(|(&session, reg)| (session, reg.fd, reg.interest))
            .collect();

        // SAFETY: registered descriptors stay open until deregistered
        let borrowed: Vec<BorrowedFd<'_>> = watched
            .iter()
            .map(|&(_, fd, _)| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut fds: Vec<PollFd<'_>> = borrowed
            .iter()
            .zip(&watched)
            .map(|(fd, &(_, _, interest))| PollFd::new(fd, interest.poll_flags()))
            .collect();

        let timeout_ms = slice
            .as_micros()
            .div_ceil(1000)
            .min(i32::MAX as u128) as i32;
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e),
        }

        let hangup = PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        for (pfd, &(session, fd, interest)) in fds.iter().zip(&watched) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            let failed = revents.intersects(hangup);
            if interest.readable && (revents.contains(PollFlags::POLLIN) || failed) {
                events.push(Event::Readable { session, fd });
            }
            if interest.writable && (revents.contains(PollFlags::POLLOUT) || failed) {
                events.push(Event::Writable { session, fd });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{fork, ForkResult};

    fn exiting_child(code: i32) -> ChildProcess {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { nix::libc::_exit(code) },
            ForkResult::Parent { child } => ChildProcess::new(child),
        }
    }

    fn collect_until_exit(broker: &mut EventBroker) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let events = broker.poll(Some(Duration::from_millis(50))).unwrap();
            let done = events
                .iter()
                .any(|e| matches!(e, Event::ChildExited { .. }));
            seen.extend(events);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_interest_flags() {
        let both = Interest {
            readable: true,
            writable: true,
        };
        assert_eq!(both.poll_flags(), PollFlags::POLLIN | PollFlags::POLLOUT);
        assert!(Interest::default().is_empty());
    }

    #[test]
    fn test_child_exit_delivered_once() {
        let mut broker = EventBroker::new(
            ExitPolicy::FirstConfirmation,
            Duration::from_millis(100),
            Duration::from_millis(5),
        );
        let session = SessionId::next();
        broker.register(session, -1, exiting_child(3));

        let events = collect_until_exit(&mut broker);
        let exits: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ChildExited { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(exits, vec![ExitStatus::Exited(3)]);

        let later = broker.poll(Some(Duration::from_millis(30))).unwrap();
        assert!(later.is_empty());

        let child = broker.deregister(session).unwrap();
        assert_eq!(child.status(), Some(ExitStatus::Exited(3)));
    }

    #[test]
    fn test_await_eof_holds_until_eof() {
        let mut broker = EventBroker::new(
            ExitPolicy::AwaitEof,
            Duration::from_secs(30),
            Duration::from_millis(5),
        );
        let session = SessionId::next();
        broker.register(session, -1, exiting_child(0));

        // Reaped but held back: no EOF yet and the linger is long
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            let events = broker.poll(Some(Duration::from_millis(20))).unwrap();
            assert!(events.is_empty(), "unexpected {:?}", events);
        }

        broker.mark_eof(session);
        let events = broker.poll(Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(
            events.as_slice(),
            [Event::ChildExited {
                status: ExitStatus::Exited(0),
                ..
            }]
        ));
    }

    #[test]
    fn test_await_eof_linger_expires() {
        let mut broker = EventBroker::new(
            ExitPolicy::AwaitEof,
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        let session = SessionId::next();
        broker.register(session, -1, exiting_child(1));

        let events = collect_until_exit(&mut broker);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ChildExited {
                status: ExitStatus::Exited(1),
                ..
            }
        )));
    }

    #[test]
    fn test_poll_times_out_empty() {
        let mut broker = EventBroker::new(
            ExitPolicy::FirstConfirmation,
            Duration::ZERO,
            Duration::from_millis(5),
        );
        let start = Instant::now();
        let events = broker.poll(Some(Duration::from_millis(30))).unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_signal_unknown_session() {
        let mut broker = EventBroker::new(
            ExitPolicy::FirstConfirmation,
            Duration::ZERO,
            Duration::from_millis(5),
        );
        assert_eq!(
            broker.signal(SessionId::next(), Signal::SIGTERM),
            Err(Errno::ESRCH)
        );
    }
}
