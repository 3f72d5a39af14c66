use crate::{error::RetryPolicy, event::EgressEvent};
use garner_integration::channel::Tx;
use std::{collections::VecDeque, fmt::Display, sync::Arc};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Durable-until-acknowledged egress queue.
///
/// Engines enqueue derived events non-blockingly inside their critical sections; the
/// [`Publisher`] drains the queue and only removes an event once the downstream transmitter
/// accepted it. A state change is therefore never externally "saved but not published" - the
/// event stays queued across publish failures.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: parking_lot::Mutex<VecDeque<EgressEvent>>,
    notify: Notify,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: EgressEvent) {
        self.queue.lock().push_back(event);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn front(&self) -> Option<EgressEvent> {
        self.queue.lock().front().cloned()
    }

    fn acknowledge_front(&self) {
        self.queue.lock().pop_front();
    }

    async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if self.depth() > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drain and return everything currently queued, without publishing.
    ///
    /// Test utility - production draining goes through the [`Publisher`].
    pub fn drain(&self) -> Vec<EgressEvent> {
        self.queue.lock().drain(..).collect()
    }
}

/// Background worker draining the [`Outbox`] into an egress transmitter.
#[derive(Debug)]
pub struct Publisher<T> {
    outbox: Arc<Outbox>,
    tx: T,
    retry: RetryPolicy,
}

impl<T> Publisher<T>
where
    T: Tx<Item = EgressEvent>,
    T::Error: Display,
{
    pub fn new(outbox: Arc<Outbox>, tx: T, retry: RetryPolicy) -> Self {
        Self { outbox, tx, retry }
    }

    /// Publish queued events forever, retrying failures with capped backoff.
    ///
    /// Events are acknowledged (removed) only after a successful send; a persistently failing
    /// sink keeps the queue intact and is retried at the backoff cap.
    pub async fn run(self) {
        loop {
            self.outbox.wait_nonempty().await;
            let Some(event) = self.outbox.front() else {
                continue;
            };

            let mut attempt = 0u32;
            loop {
                match self.tx.send(event.clone()) {
                    Ok(()) => {
                        debug!(topic = event.topic(), "egress event published");
                        self.outbox.acknowledge_front();
                        break;
                    }
                    Err(error) => {
                        attempt = attempt.saturating_add(1);
                        if attempt == self.retry.max_attempts {
                            warn!(
                                %error,
                                topic = event.topic(),
                                depth = self.outbox.depth(),
                                "egress publish still failing, holding event in outbox"
                            );
                        }
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }
    }
}
