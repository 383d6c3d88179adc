//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ptykit::{
    ConsumerEvent, ConsumerReceiver, ExitStatus, SessionSupervisor, SupervisorConfig,
};

/// A supervisor with a short reap interval so tests finish quickly
pub fn supervisor() -> SessionSupervisor {
    SessionSupervisor::new(SupervisorConfig {
        reap_interval_ms: 5,
        ..SupervisorConfig::default()
    })
    .expect("Default config is valid")
}

pub fn supervisor_with(config: SupervisorConfig) -> SessionSupervisor {
    SessionSupervisor::new(SupervisorConfig {
        reap_interval_ms: 5,
        ..config
    })
    .expect("Invalid test config")
}

/// Everything a [`ConsumerReceiver`] has seen so far
#[derive(Debug, Default)]
pub struct Captured {
    pub output: Vec<u8>,
    pub exits: Vec<ExitStatus>,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    fn absorb(&mut self, rx: &ConsumerReceiver) {
        while let Ok(event) = rx.try_recv() {
            match event {
                ConsumerEvent::Data(bytes) => self.output.extend_from_slice(&bytes),
                ConsumerEvent::Exit(status) => self.exits.push(status),
            }
        }
    }
}

/// Drive `supervisor` until `done` holds for the captured output or the
/// timeout passes. Returns whether `done` was reached.
pub fn pump_until<F>(
    supervisor: &mut SessionSupervisor,
    rx: &ConsumerReceiver,
    captured: &mut Captured,
    timeout: Duration,
    mut done: F,
) -> bool
where
    F: FnMut(&Captured) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        captured.absorb(rx);
        if done(captured) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        supervisor
            .run_once(Some(Duration::from_millis(20)))
            .expect("Failed to run supervisor");
    }
}

/// Consumer that records into shared state and can be told to refuse data
#[derive(Clone, Default)]
pub struct GatedConsumer {
    pub state: Arc<Mutex<GateState>>,
}

#[derive(Debug, Default)]
pub struct GateState {
    pub open: bool,
    /// Most bytes accepted per call; 0 means no limit
    pub chunk_limit: usize,
    pub output: Vec<u8>,
    pub exits: Vec<ExitStatus>,
    /// Output length when the exit notice arrived
    pub output_at_exit: Option<usize>,
}

impl GatedConsumer {
    pub fn new(open: bool, chunk_limit: usize) -> Self {
        GatedConsumer {
            state: Arc::new(Mutex::new(GateState {
                open,
                chunk_limit,
                ..GateState::default()
            })),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.state.lock().unwrap().open = open;
    }
}

impl ptykit::Consumer for GatedConsumer {
    fn on_data(&mut self, data: &[u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return 0;
        }
        let n = match state.chunk_limit {
            0 => data.len(),
            limit => data.len().min(limit),
        };
        state.output.extend_from_slice(&data[..n]);
        n
    }

    fn on_exit(&mut self, status: ExitStatus) {
        let mut state = self.state.lock().unwrap();
        state.output_at_exit = Some(state.output.len());
        state.exits.push(status);
    }
}
