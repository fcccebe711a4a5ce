//
// workqueue.rs
//
// Tracks in-flight asynchronous work and announces quiescence
//

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::events::{Event, EventBus};

struct Inner {
    count: watch::Sender<usize>,
    events: EventBus,
}

/// Counts outstanding units of work.
///
/// Work is registered the moment [`Workqueue::add`] is called, not when the
/// returned future is first polled. `WorkqueueEmpty` is emitted each time
/// the count drops back to zero.
#[derive(Clone)]
pub struct Workqueue {
    inner: Arc<Inner>,
}

impl Workqueue {
    pub fn new(events: EventBus) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner { count, events }),
        }
    }

    /// Register `work` and hand it back wrapped. Completion, failure and
    /// dropping the returned future all deregister it.
    pub fn add<F>(&self, work: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let guard = self.register();
        async move {
            let output = work.await;
            drop(guard);
            output
        }
    }

    fn register(&self) -> WorkGuard {
        self.inner.count.send_modify(|count| *count += 1);
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn len(&self) -> usize {
        *self.inner.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once no work is outstanding.
    pub async fn wait_empty(&self) {
        let mut rx = self.inner.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut drained = false;
        self.inner.count.send_modify(|count| {
            *count = count.saturating_sub(1);
            drained = *count == 0;
        });

        if drained {
            log::trace!("workqueue :: empty");
            self.inner.events.emit(Event::WorkqueueEmpty);
        }
    }
}
