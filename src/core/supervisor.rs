//! Consumer supervision.
//!
//! A supervision cycle subscribes to every configured queue and runs one worker per queue.
//! The first worker failure ends the whole cycle: every worker stops pulling, in-flight
//! deliveries are settled, all subscriptions are closed and, after a fixed backoff, every
//! queue is subscribed again. Shutdown ends the cycle the same way and stops supervision.

use crate::core::error::SupervisorError;
use crate::core::traits::DeliveryHandler;
use crate::infrastructure::broker::Delivery;
use crate::infrastructure::settings::{QueueBinding, QueueRole, Settings};
use crate::infrastructure::traits::{Broker, Subscription};
use di::{Ref, inject, injectable};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Connecting,
    Consuming,
    /// Shutting down; terminal.
    Draining,
    /// Waiting out the backoff before reconnecting.
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Connecting => "connecting",
            CycleState::Consuming => "consuming",
            CycleState::Draining => "draining",
            CycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct Supervisor {
    queues: Vec<QueueBinding>,
    max_in_flight: usize,
    backoff: Duration,
    broker: Ref<dyn Broker>,
    handler: Ref<dyn DeliveryHandler>,
    state: watch::Sender<CycleState>,
}

#[injectable]
impl Supervisor {
    #[inject]
    pub fn create(
        settings: Ref<Settings>,
        broker: Ref<dyn Broker>,
        handler: Ref<dyn DeliveryHandler>,
    ) -> Supervisor {
        Supervisor::new(
            settings.queues.clone(),
            settings.max_in_flight,
            settings.reconnect_backoff,
            broker,
            handler,
        )
    }
}

impl Supervisor {
    pub fn new(
        queues: Vec<QueueBinding>,
        max_in_flight: usize,
        backoff: Duration,
        broker: Ref<dyn Broker>,
        handler: Ref<dyn DeliveryHandler>,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Connecting);
        Self {
            queues,
            max_in_flight,
            backoff,
            broker,
            handler,
            state,
        }
    }

    /// Observes the state of the current supervision cycle.
    pub fn state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    fn enter(&self, state: CycleState) {
        info!("supervisor {state}");
        self.state.send_replace(state);
    }

    /// Consumes every queue until `shutdown` is cancelled. Failures never end supervision;
    /// they are logged and followed by a reconnect after the backoff.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.cycle(&shutdown).await {
                Ok(()) => break,
                Err(e) if shutdown.is_cancelled() => {
                    warn!("cycle ended with {e} during shutdown");
                    break;
                }
                Err(e) => {
                    self.enter(CycleState::Failed);
                    error!("{e}; reconnecting in {:?}", self.backoff);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
        self.enter(CycleState::Draining);
        info!("supervisor stopped");
    }

    async fn cycle(&self, shutdown: &CancellationToken) -> Result<(), SupervisorError> {
        self.enter(CycleState::Connecting);
        self.handler
            .ready()
            .await
            .map_err(SupervisorError::NotReady)?;

        let mut subscriptions = Vec::with_capacity(self.queues.len());
        for binding in &self.queues {
            match self.broker.subscribe(&binding.name).await {
                Ok(subscription) => subscriptions.push((binding.clone(), subscription)),
                Err(e) => {
                    for (_, subscription) in subscriptions {
                        subscription.close().await;
                    }
                    return Err(e.into());
                }
            }
        }

        self.enter(CycleState::Consuming);
        let cycle = shutdown.child_token();
        let tracker = TaskTracker::new();
        let mut workers = JoinSet::new();
        for (binding, subscription) in subscriptions {
            let worker = Worker {
                binding,
                subscription,
                handler: self.handler.clone(),
                limit: (self.max_in_flight > 0).then(|| Arc::new(Semaphore::new(self.max_in_flight))),
                tracker: tracker.clone(),
                cycle: cycle.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut outcome = Ok(());
        let mut open = Vec::with_capacity(self.queues.len());
        while let Some(joined) = workers.join_next().await {
            let result = match joined {
                Ok((subscription, result)) => {
                    open.push(subscription);
                    result
                }
                Err(e) => Err(SupervisorError::WorkerPanicked(e.to_string())),
            };
            if let Err(e) = result {
                cycle.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        tracker.close();
        debug!("waiting for {} in-flight deliveries", tracker.len());
        tracker.wait().await;
        for subscription in open {
            subscription.close().await;
        }
        outcome
    }
}

struct Worker {
    binding: QueueBinding,
    subscription: Box<dyn Subscription>,
    handler: Ref<dyn DeliveryHandler>,
    limit: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    cycle: CancellationToken,
}

impl Worker {
    /// Hands the subscription back, even after a panic, so it stays open until in-flight
    /// deliveries are settled and is then closed.
    async fn run(mut self) -> (Box<dyn Subscription>, Result<(), SupervisorError>) {
        let outcome = AssertUnwindSafe(self.consume()).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("{}: worker panicked", self.binding.name);
                Err(SupervisorError::WorkerPanicked(self.binding.name.clone()))
            }
        };
        (self.subscription, result)
    }

    async fn consume(&mut self) -> Result<(), SupervisorError> {
        let queue = &self.binding.name;
        info!("consuming {queue}");
        loop {
            let permit = match &self.limit {
                None => None,
                Some(limit) => tokio::select! {
                    biased;
                    _ = self.cycle.cancelled() => return Ok(()),
                    permit = limit.clone().acquire_owned() => permit.ok(),
                },
            };

            let next = tokio::select! {
                biased;
                _ = self.cycle.cancelled() => return Ok(()),
                next = self.subscription.next_delivery() => next,
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SupervisorError::StreamClosed(queue.clone())),
            };

            let handler = self.handler.clone();
            let queue = queue.clone();
            let role = self.binding.role;
            self.tracker.spawn(async move {
                settle(handler, &queue, role, delivery).await;
                drop(permit);
            });
        }
    }
}

/// Runs the handler on one delivery and acks or nacks it by the outcome.
async fn settle(
    handler: Ref<dyn DeliveryHandler>,
    queue: &str,
    role: QueueRole,
    delivery: Delivery,
) {
    let outcome = AssertUnwindSafe(handler.handle(queue, role, &delivery.body))
        .catch_unwind()
        .await;

    let settled = match outcome {
        Ok(Ok(())) => {
            debug!("{queue}: delivery processed");
            delivery.ack().await
        }
        Ok(Err(e)) => {
            if e.is_retryable() {
                error!("{queue}: dropping delivery: {e}");
            } else {
                warn!("{queue}: dropping delivery: {e}");
            }
            delivery.nack().await
        }
        Err(_) => {
            error!("{queue}: handler panicked, dropping delivery");
            delivery.nack().await
        }
    };
    if let Err(e) = settled {
        warn!("{queue}: {e}");
    }
}

/// Returns a token cancelled on SIGINT or, on unix, SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("couldn't install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        }

        cancel.cancel();
    });

    token
}
