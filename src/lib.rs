//! PTYKit
//!
//! Pseudoterminal sessions for Unix hosts: allocate a master/slave pair, run
//! a program with the slave as its controlling terminal, and relay bytes,
//! window sizes, signals and exit status between that program and a
//! consumer.
//!
//! - `pty`: terminal allocation, child attachment and the child handle
//! - `pump`: non-blocking byte relay with bounded queues
//! - `broker`: readiness and child-exit multiplexing
//! - `session`: the session state machine and its supervisor
//!
//! ```no_run
//! use std::time::Duration;
//! use ptykit::{ChannelConsumer, Command, SessionSupervisor, SupervisorConfig, WindowSize};
//!
//! let mut supervisor = SessionSupervisor::new(SupervisorConfig::default()).unwrap();
//! let (consumer, output) = ChannelConsumer::new(64);
//! let id = supervisor
//!     .start(&Command::new("cat"), WindowSize::new(24, 80), Box::new(consumer))
//!     .unwrap();
//! supervisor.send(id, b"hello\n").unwrap();
//! supervisor.run_once(Some(Duration::from_millis(100))).unwrap();
//! while let Ok(event) = output.try_recv() {
//!     println!("{:?}", event);
//! }
//! supervisor.terminate(id, Duration::from_secs(2)).unwrap();
//! ```

pub mod broker;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod pty;
pub mod pump;
pub mod session;
pub mod size;

pub use broker::{Event, EventBroker, ExitPolicy, Interest};
pub use config::{ConfigError, SupervisorConfig};
pub use consumer::{ChannelConsumer, Consumer, ConsumerEvent, ConsumerReceiver};
pub use error::{AllocationError, SessionError, SessionResult, SpawnError, StartError};
pub use pty::{ChildStep, Command, ExitReport, ExitStatus, PtyAllocator, PtyPair, SlaveAttacher};
pub use session::{ResizePolicy, SessionId, SessionInfo, SessionState, SessionSupervisor};
pub use size::WindowSize;
