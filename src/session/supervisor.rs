use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::{is_termination_signal, ResizePolicy, Session, SessionId, SessionInfo, SessionState};
use crate::broker::{Event, EventBroker, Interest};
use crate::config::{ConfigError, SupervisorConfig};
use crate::consumer::Consumer;
use crate::error::{SessionError, SessionResult, StartError};
use crate::pty::{Command, ExitStatus, OpenFlags, PtyAllocator, SlaveAttacher};
use crate::pump::{IoPump, ReadOutcome};
use crate::size::WindowSize;

/// Owns every session and drives their I/O from one loop.
///
/// Nothing happens in the background: output moves, children are reaped and
/// exits are delivered only while [`run_once`](Self::run_once) (or a method
/// built on it, like [`wait`](Self::wait)) is running. Dropping the
/// supervisor kills and reaps every child it still owns.
pub struct SessionSupervisor {
    config: SupervisorConfig,
    allocator: PtyAllocator,
    attacher: SlaveAttacher,
    broker: EventBroker,
    sessions: HashMap<SessionId, Session>,
}

fn live_session(
    sessions: &mut HashMap<SessionId, Session>,
    id: SessionId,
) -> SessionResult<&mut Session> {
    match sessions.get_mut(&id) {
        None => Err(SessionError::UnknownSession(id)),
        Some(session) if session.state == SessionState::Terminated => {
            Err(SessionError::Closed(id))
        }
        Some(session) => Ok(session),
    }
}

impl SessionSupervisor {
    /// Build a supervisor. Configs that could never move output, such as a
    /// zero-byte queue, are rejected.
    pub fn new(config: SupervisorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let broker = EventBroker::new(
            config.exit_policy,
            config.eof_linger(),
            config.reap_interval(),
        );
        Ok(SessionSupervisor {
            config,
            allocator: PtyAllocator::new(OpenFlags::default()),
            attacher: SlaveAttacher,
            broker,
            sessions: HashMap::new(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Allocate a terminal, start `command` on it and begin supervising.
    ///
    /// On error every descriptor and child created along the way has already
    /// been released.
    pub fn start(
        &mut self,
        command: &Command,
        size: WindowSize,
        consumer: Box<dyn Consumer>,
    ) -> SessionResult<SessionId> {
        let prepared = command.prepare(&self.config.term).map_err(StartError::from)?;
        let pair = self.allocator.allocate().map_err(StartError::from)?;
        size.apply_to(pair.master_fd())
            .map_err(StartError::InitialSize)?;
        let slave = pair
            .slave_path_cstring()
            .map_err(|e| StartError::Spawn(e.into()))?;

        let child = self
            .attacher
            .attach_and_spawn(&slave, &prepared, size)
            .map_err(StartError::from)?;
        let pid = child.pid();
        let (master, slave_path) = pair.into_parts();
        let master_fd = master.as_raw_fd();

        let id = SessionId::next();
        let pump = IoPump::new(self.config.buffer_capacity, self.config.read_chunk);
        let program = command.program().to_string_lossy().into_owned();
        let mut session = Session::new(id, master, pid, program, size, pump, consumer);

        self.broker.register(id, master_fd, child);
        session.transition(SessionState::Running);
        tracing::info!(
            session = %id,
            pid = pid.as_raw(),
            slave = %slave_path.display(),
            %size,
            program = %session.program,
            "session started"
        );
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Queue bytes for the child. Returns how many fit; the rest is refused,
    /// not dropped silently.
    pub fn send(&mut self, id: SessionId, bytes: &[u8]) -> SessionResult<usize> {
        let session = live_session(&mut self.sessions, id)?;
        let accepted = session.pump.send(bytes);
        let written = match session.master.as_ref() {
            Some(master) => session.pump.write_master(master.as_fd()),
            None => Ok(0),
        };
        tracing::trace!(session = %id, offered = bytes.len(), accepted, "input queued");
        if let Err(source) = written {
            self.fail_io(id, source);
            return Err(SessionError::Io {
                session: id,
                source,
            });
        }
        Ok(accepted)
    }

    /// Change the terminal size. Returns whether SIGWINCH was delivered.
    pub fn resize(&mut self, id: SessionId, size: WindowSize) -> SessionResult<bool> {
        let policy = self.config.resize_policy;
        let session = live_session(&mut self.sessions, id)?;
        let changed = session.window_size != size;

        if changed {
            let master = session.master.as_ref().ok_or(SessionError::Closed(id))?;
            size.apply_to(master.as_raw_fd())
                .map_err(|source| SessionError::Io {
                    session: id,
                    source,
                })?;
            tracing::debug!(session = %id, from = %session.window_size, to = %size, "resized");
            session.window_size = size;
        }

        if !changed && policy == ResizePolicy::SignalOnChange {
            return Ok(false);
        }
        self.deliver(id, Signal::SIGWINCH)?;
        Ok(true)
    }

    /// Send `signal` to the session's process group.
    ///
    /// HUP, TERM, KILL and QUIT move a running session to `Exiting`.
    pub fn write_signal(&mut self, id: SessionId, signal: Signal) -> SessionResult<()> {
        self.deliver(id, signal)?;
        tracing::info!(session = %id, %signal, "signal sent");
        Ok(())
    }

    /// Ask the child to exit, escalating to SIGKILL after `grace`.
    pub fn terminate(&mut self, id: SessionId, grace: Duration) -> SessionResult<ExitStatus> {
        let signal = self.config.terminate_signal();
        tracing::info!(session = %id, %signal, ?grace, "terminating session");
        self.deliver(id, signal)?;

        match self.wait_for(id, Some(grace), "terminate") {
            Err(SessionError::Timeout { .. }) => {}
            done => return done,
        }

        tracing::warn!(session = %id, ?grace, "grace period expired, sending SIGKILL");
        self.deliver(id, Signal::SIGKILL)?;
        let kill_timeout = self.config.kill_timeout();
        self.wait_for(id, Some(kill_timeout), "terminate")
            .map_err(|e| match e {
                SessionError::Timeout {
                    session, operation, ..
                } => SessionError::Timeout {
                    session,
                    operation,
                    waited: grace + kill_timeout,
                },
                e => e,
            })
    }

    /// Drive the supervisor until the session's child is reaped or `timeout`
    /// passes.
    ///
    /// Returns at once for a reaped session. Its output may still be on the
    /// way to the consumer; [`run_until_idle`](Self::run_until_idle) waits
    /// for that too.
    pub fn wait(&mut self, id: SessionId, timeout: Option<Duration>) -> SessionResult<ExitStatus> {
        self.wait_for(id, timeout, "wait")
    }

    /// One turn of the loop: flush consumers, poll, dispatch, finish drained
    /// sessions, flush again.
    ///
    /// Returns the number of broker events handled. With no children left to
    /// watch it returns immediately.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> SessionResult<usize> {
        let mut blocked = self.flush_consumers();
        // Reaped sessions are finished by this loop, not by a poll event
        blocked |= self.sessions.values().any(Session::is_draining);
        let timeout = if blocked {
            let retry = self.config.sink_retry();
            Some(timeout.map_or(retry, |t| t.min(retry)))
        } else {
            timeout
        };

        if self.broker.is_empty() {
            if let Some(pause) = timeout.filter(|_| blocked) {
                std::thread::sleep(pause);
            }
            self.flush_consumers();
            return Ok(0);
        }

        for (&id, session) in &self.sessions {
            let interest = if session.master.is_some() {
                session.pump.interest()
            } else {
                Interest::default()
            };
            self.broker.set_interest(id, interest);
        }

        let events = self.broker.poll(timeout).map_err(SessionError::Poll)?;
        let handled = events.len();
        for event in events {
            self.dispatch(event);
        }
        self.settle();
        self.flush_consumers();
        Ok(handled)
    }

    /// Run until every session has terminated and delivered its exit.
    ///
    /// Returns false if `timeout` passed first.
    pub fn run_until_idle(&mut self, timeout: Option<Duration>) -> SessionResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.sessions.values().all(|s| s.exit_notified) {
                return Ok(true);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.run_once(remaining)?;
        }
    }

    /// Forget a reaped session and return its final status.
    ///
    /// Output the consumer never accepted is discarded, along with anything
    /// still unread in the terminal; the exit notice is delivered if it was
    /// still outstanding.
    pub fn release(&mut self, id: SessionId) -> SessionResult<ExitStatus> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        let status = session.exit_status.ok_or(SessionError::StillRunning(id))?;

        session.flush();
        if session.state != SessionState::Terminated {
            tracing::warn!(session = %id, "releasing session before its terminal was drained");
            session.master = None;
            session.transition(SessionState::Terminated);
            self.broker.deregister(id);
        }
        if !session.exit_notified {
            tracing::warn!(
                session = %id,
                dropped = session.pump.pending_output(),
                "releasing session with undelivered output"
            );
            session.exit_notified = true;
            session.consumer.on_exit(status);
        }
        self.sessions.remove(&id);
        tracing::debug!(session = %id, "session released");
        Ok(status)
    }

    pub fn state(&self, id: SessionId) -> SessionResult<SessionState> {
        self.session(id).map(|s| s.state)
    }

    pub fn info(&self, id: SessionId) -> SessionResult<SessionInfo> {
        self.session(id).map(Session::info)
    }

    pub fn pid(&self, id: SessionId) -> SessionResult<Pid> {
        self.session(id).map(|s| s.pid)
    }

    /// Size last applied through this supervisor
    pub fn window_size(&self, id: SessionId) -> SessionResult<WindowSize> {
        self.session(id).map(|s| s.window_size)
    }

    /// Size as the kernel reports it for the session's terminal
    pub fn kernel_window_size(&self, id: SessionId) -> SessionResult<WindowSize> {
        let session = self.session(id)?;
        let master = session.master.as_ref().ok_or(SessionError::Closed(id))?;
        WindowSize::read_from(master.as_raw_fd()).map_err(|source| SessionError::Io {
            session: id,
            source,
        })
    }

    /// Every session not yet released, terminated ones included
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Sessions whose child has not terminated
    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state != SessionState::Terminated)
            .count()
    }

    fn session(&self, id: SessionId) -> SessionResult<&Session> {
        self.sessions
            .get(&id)
            .ok_or(SessionError::UnknownSession(id))
    }

    fn deliver(&mut self, id: SessionId, signal: Signal) -> SessionResult<()> {
        let session = live_session(&mut self.sessions, id)?;
        self.broker
            .signal(id, signal)
            .map_err(|source| SessionError::Signal {
                session: id,
                signal,
                source,
            })?;
        session.signals_delivered += 1;
        if is_termination_signal(signal) {
            session.transition(SessionState::Exiting);
        }
        Ok(())
    }

    fn wait_for(
        &mut self,
        id: SessionId,
        timeout: Option<Duration>,
        operation: &'static str,
    ) -> SessionResult<ExitStatus> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.session(id)?.exit_status {
                return Ok(status);
            }
            let remaining = match timeout {
                Some(timeout) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        return Err(SessionError::Timeout {
                            session: id,
                            operation,
                            waited,
                        });
                    }
                    Some(timeout - waited)
                }
                None => None,
            };
            self.run_once(remaining)?;
        }
    }

    /// Returns true if any consumer is holding output back.
    fn flush_consumers(&mut self) -> bool {
        let mut blocked = false;
        for session in self.sessions.values_mut() {
            blocked |= session.flush();
        }
        blocked
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Readable { session, .. } => self.on_readable(session),
            Event::Writable { session, .. } => self.on_writable(session),
            Event::ChildExited {
                session,
                pid,
                status,
            } => {
                tracing::debug!(%session, pid = pid.as_raw(), %status, "child exited");
                self.on_child_exit(session, status);
            }
            Event::SignalRaised { session, signal } => {
                tracing::trace!(%session, %signal, "signal confirmed");
            }
        }
    }

    fn on_readable(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let Some(master) = session.master.as_ref() else {
            return;
        };
        let outcome = session.pump.read_master(master.as_fd());
        match outcome {
            Ok(ReadOutcome::Eof) => self.broker.mark_eof(id),
            Ok(ReadOutcome::Data(n)) => tracing::trace!(session = %id, bytes = n, "output read"),
            Ok(ReadOutcome::Idle) => {}
            Err(e) => self.fail_io(id, e),
        }
    }

    fn on_writable(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let Some(master) = session.master.as_ref() else {
            return;
        };
        let written = session.pump.write_master(master.as_fd());
        match written {
            Ok(n) => tracing::trace!(session = %id, bytes = n, "input written"),
            Err(e) => self.fail_io(id, e),
        }
    }

    /// Unrecoverable terminal error: stop polling and kill the group. The
    /// exit is reported as [`ExitStatus::IoFailed`] once the child is reaped.
    fn fail_io(&mut self, id: SessionId, errno: Errno) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        tracing::error!(session = %id, error = %errno, "terminal I/O failed, killing session");
        session.io_failure.get_or_insert(errno);
        session.transition(SessionState::Exiting);
        self.broker.mark_eof(id);
        match self.broker.signal(id, Signal::SIGKILL) {
            Ok(()) => session.signals_delivered += 1,
            Err(e) => tracing::warn!(session = %id, error = %e, "failed to kill process group"),
        }
    }

    fn on_child_exit(&mut self, id: SessionId, status: ExitStatus) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let status = session.io_failure.map_or(status, ExitStatus::IoFailed);
        session.exit_status = Some(status);
        session.reaped_at = Some(Instant::now());
        session.transition(SessionState::Exiting);
    }

    /// Read what reaped children left in their terminals and finalize the
    /// sessions whose output is all with the consumer.
    ///
    /// A session is finished at master EOF, or once `eof-linger` has passed
    /// since the reap without EOF (a descendant still holds the slave). Both
    /// wait for the consumer to accept every queued byte first.
    fn settle(&mut self) {
        let linger = self.config.eof_linger();
        let mut finished = Vec::new();
        for (&id, session) in self.sessions.iter_mut() {
            if !session.is_draining() {
                continue;
            }
            if let (None, Some(master)) = (session.io_failure, session.master.as_ref()) {
                let drained = session.pump.drain(master.as_fd(), session.consumer.as_mut());
                if let Err(e) = drained {
                    tracing::warn!(session = %id, error = %e, "reading after exit failed");
                    session.io_failure = Some(e);
                }
            }

            let handed_over = session.pump.pending_output() == 0;
            let lingered = session.reaped_at.is_some_and(|at| at.elapsed() >= linger);
            if session.io_failure.is_some() || (handed_over && (session.pump.is_eof() || lingered)) {
                finished.push(id);
            }
        }
        for id in finished {
            self.finalize(id);
        }
    }

    fn finalize(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.pump.is_eof() && session.io_failure.is_none() {
            tracing::debug!(session = %id, "closing master without EOF");
        }
        session.master = None;
        session.transition(SessionState::Terminated);
        self.broker.deregister(id);
        if let Some(status) = session.exit_status {
            tracing::info!(session = %id, pid = session.pid.as_raw(), %status, "session terminated");
        }
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        for (&id, session) in &self.sessions {
            if session.state == SessionState::Terminated {
                continue;
            }
            tracing::warn!(session = %id, "supervisor dropped with live session, killing");
            if let Err(e) = self.broker.signal(id, Signal::SIGKILL) {
                tracing::debug!(session = %id, error = %e, "kill on drop failed");
            }
            if let Some(mut child) = self.broker.deregister(id) {
                if let Err(e) = child.reap_blocking() {
                    tracing::warn!(session = %id, error = %e, "failed to reap child on drop");
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("sessions", &self.sessions.len())
            .field("active", &self.active_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ChannelConsumer, ConsumerEvent};

    fn supervisor() -> SessionSupervisor {
        SessionSupervisor::new(SupervisorConfig {
            reap_interval_ms: 5,
            ..SupervisorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_unknown_session() {
        let mut sup = supervisor();
        let id = SessionId::next();
        assert!(matches!(
            sup.send(id, b"x"),
            Err(SessionError::UnknownSession(_))
        ));
        assert!(matches!(
            sup.release(id),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_run_once_without_sessions_returns() {
        let mut sup = supervisor();
        assert_eq!(sup.run_once(None).unwrap(), 0);
        assert!(sup.run_until_idle(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_short_lived_child_lifecycle() {
        let mut sup = supervisor();
        let (consumer, rx) = ChannelConsumer::new(64);
        let id = sup
            .start(
                &Command::new("/bin/sh").args(["-c", "exit 7"]),
                WindowSize::default(),
                Box::new(consumer),
            )
            .unwrap();
        assert_eq!(sup.state(id).unwrap(), SessionState::Running);
        assert!(matches!(sup.release(id), Err(SessionError::StillRunning(_))));

        let status = sup.wait(id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status, ExitStatus::Exited(7));
        assert_eq!(sup.state(id).unwrap(), SessionState::Terminated);
        assert_eq!(sup.active_count(), 0);
        assert!(sup.run_until_idle(Some(Duration::from_secs(5))).unwrap());

        let mut exits = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConsumerEvent::Exit(status) = event {
                exits.push(status);
            }
        }
        assert_eq!(exits, vec![ExitStatus::Exited(7)]);

        assert!(matches!(sup.send(id, b"x"), Err(SessionError::Closed(_))));
        assert_eq!(sup.release(id).unwrap(), ExitStatus::Exited(7));
        assert!(sup.sessions().is_empty());
    }

    #[test]
    fn test_info_snapshot() {
        let mut sup = supervisor();
        let (consumer, _rx) = ChannelConsumer::new(64);
        let id = sup
            .start(
                &Command::new("sleep").arg("30"),
                WindowSize::new(30, 100),
                Box::new(consumer),
            )
            .unwrap();

        let info = sup.info(id).unwrap();
        assert_eq!(info.state, SessionState::Running);
        assert_eq!(info.window_size, WindowSize::new(30, 100));
        assert_eq!(info.program, "sleep");
        assert!(info.exit.is_none());
        assert_eq!(sup.kernel_window_size(id).unwrap(), WindowSize::new(30, 100));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "running");

        sup.terminate(id, Duration::from_secs(2)).unwrap();
        let info = sup.info(id).unwrap();
        assert_eq!(info.state, SessionState::Terminated);
        assert_eq!(info.exit.unwrap().signal.as_deref(), Some("SIGHUP"));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = SessionSupervisor::new(SupervisorConfig {
            buffer_capacity: 0,
            ..SupervisorConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("buffer-capacity"));
    }

    #[test]
    fn test_io_failure_ends_session() {
        let mut sup = supervisor();
        let (consumer, rx) = ChannelConsumer::new(64);
        let id = sup
            .start(&Command::new("sleep").arg("30"), WindowSize::default(), Box::new(consumer))
            .unwrap();

        sup.fail_io(id, Errno::EBADF);
        assert_eq!(sup.state(id).unwrap(), SessionState::Exiting);

        let status = sup.wait(id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(status, ExitStatus::IoFailed(Errno::EBADF));
        assert!(sup.run_until_idle(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(sup.state(id).unwrap(), SessionState::Terminated);
        sup.run_once(Some(Duration::from_millis(20))).unwrap();

        let exits: Vec<ExitStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                ConsumerEvent::Exit(status) => Some(status),
                ConsumerEvent::Data(_) => None,
            })
            .collect();
        assert_eq!(exits, vec![ExitStatus::IoFailed(Errno::EBADF)]);
        assert_eq!(sup.release(id).unwrap(), ExitStatus::IoFailed(Errno::EBADF));
    }
}
