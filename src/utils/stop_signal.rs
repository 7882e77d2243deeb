use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::cell::Cell;
use std::time::Duration;

/// Requests a stop. Dropping every handle counts as a stop request too.
#[derive(Clone)]
pub struct StopHandle {
    send: Sender<()>,
}

/// Waited on by a polling loop between passes. Once stopped it stays stopped.
pub struct StopSignal {
    recv: Receiver<()>,
    stopped: Cell<bool>,
}

pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (send, recv) = crossbeam_channel::bounded::<()>(1);
    (
        StopHandle { send },
        StopSignal {
            recv,
            stopped: Cell::new(false),
        },
    )
}

impl StopHandle {
    /// Returns false once the signal side is gone.
    pub fn stop(&self) -> bool {
        match self.send.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

impl StopSignal {
    /// Sleeps up to `duration`, returning true as soon as a stop is requested.
    pub fn wait(&self, duration: Duration) -> bool {
        if self.stopped.get() {
            return true;
        }
        match self.recv.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.stopped.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.wait(Duration::ZERO)
    }
}
