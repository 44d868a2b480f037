//! Background task plumbing: one worker thread per long operation, a cancel
//! channel the worker polls at its I/O boundaries, a done signal, a progress
//! callback, and a final error cell the front end reads on completion.

use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, sync_channel};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// The worker's side of a background task.
pub struct Task {
    cancel: Mutex<Receiver<()>>,
    done: SyncSender<()>,
    progress: Box<dyn Fn(&str) + Send + Sync>,
    err: Mutex<Option<Error>>,
}

/// The front end's side: cancel, wait, and read the final status.
pub struct TaskHandle {
    cancel: SyncSender<()>,
    done: Receiver<()>,
    task: Arc<Task>,
}

pub fn new_task<F>(progress: F) -> (Arc<Task>, TaskHandle)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let (cancel_tx, cancel_rx) = sync_channel(2);
    let (done_tx, done_rx) = sync_channel(2);

    let task = Arc::new(Task {
        cancel: Mutex::new(cancel_rx),
        done: done_tx,
        progress: Box::new(progress),
        err: Mutex::new(None),
    });
    let handle = TaskHandle {
        cancel: cancel_tx,
        done: done_rx,
        task: task.clone(),
    };
    (task, handle)
}

impl Task {
    /// True once the front end has asked for cancellation (or gone away).
    /// Workers poll this at every suspension point.
    pub fn canceled(&self) -> bool {
        match self.cancel.lock().unwrap().try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Bails out with `Canceled` if the task was canceled.
    pub fn check_canceled(&self) -> Result<()> {
        if self.canceled() {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    pub fn update_progress(&self, msg: &str) {
        (self.progress)(msg);
    }

    /// Records the final status and signals completion.  Call exactly once,
    /// from the worker, as its last act.
    pub fn finish(&self, result: Result<()>) {
        if let Err(e) = result {
            *self.err.lock().unwrap() = Some(e);
        }
        let _ = self.done.try_send(());
    }
}

impl TaskHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.try_send(());
    }

    /// Blocks until the worker finishes, then yields its final status.
    pub fn wait(self) -> Result<()> {
        let _ = self.done.recv();
        self.take_result()
    }

    fn take_result(self) -> Result<()> {
        match self.task.err.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
