use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{DeviceFault, Error, Result};

pub(crate) type Job = Box<dyn FnOnce() -> Result<(), DeviceFault> + Send + 'static>;

/// Position of a job in the stream; jobs complete in ticket order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

enum Command {
    Run { ticket: Ticket, job: Job },
    Shutdown,
}

struct Completion {
    ticket: Ticket,
    result: Result<(), DeviceFault>,
}

#[derive(Default)]
struct CompletionState {
    last_done: u64,
    faults: Vec<(Ticket, DeviceFault)>,
}

/// In-order execution stream backed by a worker thread.
///
/// Enqueueing never blocks the host. The only way to observe completion is
/// [`Stream::wait_for`] / [`Stream::synchronize`].
pub(crate) struct Stream {
    sender: Sender<Command>,
    completions: Receiver<Completion>,
    state: Mutex<CompletionState>,
    next_ticket: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub fn spawn(label: String) -> Result<Self> {
        let (sender, commands) = unbounded::<Command>();
        let (done, completions) = unbounded::<Completion>();
        let worker = thread::Builder::new()
            .name(label)
            .spawn(move || {
                for command in commands {
                    match command {
                        Command::Run { ticket, job } => {
                            let result = panic::catch_unwind(AssertUnwindSafe(job))
                                .unwrap_or_else(|payload| {
                                    Err(DeviceFault::ProgramAbort {
                                        entry: "<stream>".to_string(),
                                        message: panic_message(payload.as_ref()),
                                    })
                                });
                            if done.send(Completion { ticket, result }).is_err() {
                                break;
                            }
                        }
                        Command::Shutdown => break,
                    }
                }
            })
            .map_err(|err| Error::DeviceInit(format!("failed to start execution stream: {err}")))?;

        Ok(Self {
            sender,
            completions,
            state: Mutex::new(CompletionState::default()),
            next_ticket: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    /// Queues work and returns immediately.
    pub fn enqueue(&self, job: Job) -> Result<Ticket> {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        self.sender
            .send(Command::Run { ticket, job })
            .map_err(|_| Error::Launch("execution stream has shut down".to_string()))?;
        Ok(ticket)
    }

    /// Blocks until `ticket` and everything before it completed.
    ///
    /// Returns the first fault recorded at or before `ticket`. A timeout
    /// leaves the work running.
    pub fn wait_for(&self, ticket: Ticket, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.last_done >= ticket.0 {
                    let (reached, pending): (Vec<_>, Vec<_>) = state
                        .faults
                        .drain(..)
                        .partition(|(fault_ticket, _)| *fault_ticket <= ticket);
                    state.faults = pending;
                    return match reached.into_iter().next() {
                        Some((_, fault)) => Err(Error::Sync(fault)),
                        None => Ok(()),
                    };
                }
            }

            let completion = match deadline {
                Some(deadline) => match self.completions.recv_deadline(deadline) {
                    Ok(completion) => completion,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(Error::SyncTimeout(timeout.unwrap_or_default()));
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(Error::Sync(DeviceFault::StreamLost));
                    }
                },
                None => self
                    .completions
                    .recv()
                    .map_err(|_| Error::Sync(DeviceFault::StreamLost))?,
            };

            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.last_done = state.last_done.max(completion.ticket.0);
            if let Err(fault) = completion.result {
                debug!(ticket = completion.ticket.0, %fault, "stream job faulted");
                state.faults.push((completion.ticket, fault));
            }
        }
    }

    /// Host barrier over all work enqueued so far.
    pub fn synchronize(&self) -> Result<()> {
        let last = self.next_ticket.load(Ordering::SeqCst) - 1;
        if last == 0 {
            return Ok(());
        }
        self.wait_for(Ticket(last), None)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("execution stream worker panicked during shutdown");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "device program panicked".to_string()
    }
}
