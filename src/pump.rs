//! Non-blocking byte relay between a master descriptor and a consumer.
//!
//! The pump never blocks: every descriptor operation stops at `EAGAIN` and
//! the pump reports, through [`IoPump::interest`], which readiness it needs
//! next. Reading from the master pauses while the from-child queue is full
//! (the consumer is refusing data); writing pauses while the to-child queue
//! is empty or the terminal's input buffer is full.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::unistd;

use crate::broker::Interest;
use crate::buffer::IoBuffer;
use crate::consumer::Consumer;

/// Result of pulling bytes from the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were queued; more may follow
    Data(usize),
    /// Nothing available right now, or no room to put it
    Idle,
    /// The slave side is closed
    Eof,
}

#[derive(Debug)]
pub struct IoPump {
    to_child: IoBuffer,
    from_child: IoBuffer,
    scratch: Vec<u8>,
    eof: bool,
    input_closed: bool,
}

impl IoPump {
    pub fn new(capacity: usize, read_chunk: usize) -> Self {
        IoPump {
            to_child: IoBuffer::new(capacity),
            from_child: IoBuffer::new(capacity),
            scratch: vec![0u8; read_chunk.max(1)],
            eof: false,
            input_closed: false,
        }
    }

    /// Readiness the pump can make use of right now
    pub fn interest(&self) -> Interest {
        Interest {
            readable: !self.eof && !self.from_child.is_full(),
            writable: !self.input_closed && !self.to_child.is_empty(),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Bytes read from the child but not yet accepted by the consumer
    pub fn pending_output(&self) -> usize {
        self.from_child.len()
    }

    /// Bytes sent by the consumer but not yet written to the child
    pub fn pending_input(&self) -> usize {
        self.to_child.len()
    }

    /// Queue consumer bytes for the child; returns how many were accepted.
    pub fn send(&mut self, bytes: &[u8]) -> usize {
        if self.input_closed {
            return 0;
        }
        self.to_child.push(bytes)
    }

    /// Read whatever the master has, up to the free space in the queue.
    ///
    /// `EIO` counts as end of stream: Linux reports it on the master once
    /// every slave descriptor is closed.
    pub fn read_master(&mut self, master: BorrowedFd<'_>) -> Result<ReadOutcome, Errno> {
        if self.eof {
            return Ok(ReadOutcome::Eof);
        }
        let mut total = 0;
        loop {
            let room = self.from_child.remaining().min(self.scratch.len());
            if room == 0 {
                break;
            }
            match unistd::read(master.as_raw_fd(), &mut self.scratch[..room]) {
                Ok(0) | Err(Errno::EIO) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.from_child.push(&self.scratch[..n]);
                    total += n;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(match total {
            0 if self.eof => ReadOutcome::Eof,
            0 => ReadOutcome::Idle,
            n => ReadOutcome::Data(n),
        })
    }

    /// Write queued consumer bytes until the queue empties or the terminal
    /// stops accepting. Returns the number of bytes written.
    pub fn write_master(&mut self, master: BorrowedFd<'_>) -> Result<usize, Errno> {
        let mut total = 0;
        while !self.input_closed && !self.to_child.is_empty() {
            match unistd::write(master.as_raw_fd(), self.to_child.front()) {
                Ok(n) => {
                    self.to_child.consume(n);
                    total += n;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EIO) => {
                    // Nobody is left to read it
                    self.input_closed = true;
                    self.to_child.clear();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Offer queued child output to the consumer. Returns bytes accepted.
    pub fn flush_to(&mut self, consumer: &mut dyn Consumer) -> usize {
        self.from_child.drain_into(|bytes| consumer.on_data(bytes))
    }

    /// Read and flush until the master is exhausted or the consumer stalls.
    pub fn drain(
        &mut self,
        master: BorrowedFd<'_>,
        consumer: &mut dyn Consumer,
    ) -> Result<(), Errno> {
        loop {
            let outcome = self.read_master(master)?;
            let flushed = self.flush_to(consumer);
            match outcome {
                ReadOutcome::Data(_) => continue,
                ReadOutcome::Idle if flushed > 0 && !self.from_child.is_full() => continue,
                ReadOutcome::Idle | ReadOutcome::Eof => return Ok(()),
            }
        }
    }
}
