//! Background sync service.
//!
//! One worker task owns the [`SyncEngine`]. Everything else talks to it
//! through a [`SyncHandle`], so the event store and the action queue only
//! ever have one writer. Rounds are triggered by a timer (first tick after
//! the startup delay), by network recovery, or on demand. Triggers that
//! arrive while a round is running collapse into a single follow-up round.
//! Once started, the worker also wakes when a debounced or backed-off
//! action comes due, instead of waiting for the next tick.

use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{CoreError, Result};
use crate::sync::event_store::StoreChange;
use crate::sync::router::TagRouter;
use crate::sync::sync_engine::{LocalMutation, SyncEngine};
use crate::sync::types::{Action, ActionId, Event, SyncOverview, SyncReport, SyncTrigger};

const COMMAND_BUFFER: usize = 64;

/// Added to retry wake-ups so the round does not start just before the deadline.
const WAKE_SLACK: Duration = Duration::from_millis(50);

enum Command {
    Mutate(LocalMutation, oneshot::Sender<Result<()>>),
    Events(oneshot::Sender<Vec<Event>>),
    DeadLetters(oneshot::Sender<Vec<Action>>),
    /// `None` retries every dead letter.
    Retry(Option<ActionId>, oneshot::Sender<Result<usize>>),
    Discard(ActionId, oneshot::Sender<Result<Action>>),
    Sync(SyncTrigger, Option<oneshot::Sender<SyncReport>>),
    SetSelection(Option<String>),
    SetRouter(TagRouter),
    Stop,
}

/// Round requested while another one was running.
struct FollowUp {
    trigger: SyncTrigger,
    waiters: Vec<oneshot::Sender<SyncReport>>,
}

impl FollowUp {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            waiters: Vec::new(),
        }
    }

    /// Keep the strongest trigger: a full sync beats a manual one, which
    /// beats the automatic ones.
    fn merge(&mut self, trigger: SyncTrigger) {
        if trigger_rank(trigger) > trigger_rank(self.trigger) {
            self.trigger = trigger;
        }
    }
}

fn trigger_rank(trigger: SyncTrigger) -> u8 {
    match trigger {
        SyncTrigger::FullSync => 3,
        SyncTrigger::Manual => 2,
        SyncTrigger::NetworkOnline => 1,
        SyncTrigger::Startup | SyncTrigger::Interval => 0,
    }
}

/// Cloneable client of a running [`SyncService`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    overview: watch::Receiver<SyncOverview>,
    changes: broadcast::Sender<StoreChange>,
}

impl SyncHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CoreError::ServiceStopped)?;
        rx.await.map_err(|_| CoreError::ServiceStopped)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CoreError::ServiceStopped)
    }

    /// Apply a local change. Served between remote calls if a round is running.
    pub async fn mutate(&self, mutation: LocalMutation) -> Result<()> {
        self.request(|tx| Command::Mutate(mutation, tx)).await?
    }

    pub async fn events(&self) -> Result<Vec<Event>> {
        self.request(Command::Events).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<Action>> {
        self.request(Command::DeadLetters).await
    }

    pub async fn retry_dead_letter(&self, id: ActionId) -> Result<()> {
        self.request(|tx| Command::Retry(Some(id), tx)).await?.map(|_| ())
    }

    /// Returns how many actions were revived.
    pub async fn retry_all_dead_letters(&self) -> Result<usize> {
        self.request(|tx| Command::Retry(None, tx)).await?
    }

    pub async fn discard_dead_letter(&self, id: ActionId) -> Result<Action> {
        self.request(|tx| Command::Discard(id, tx)).await?
    }

    /// Run a manual round and wait for its report.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.request(|tx| Command::Sync(SyncTrigger::Manual, Some(tx)))
            .await
    }

    /// Run a round that lists every calendar in full.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        self.request(|tx| Command::Sync(SyncTrigger::FullSync, Some(tx)))
            .await
    }

    pub async fn notify_network_online(&self) -> Result<()> {
        self.send(Command::Sync(SyncTrigger::NetworkOnline, None))
            .await
    }

    pub async fn set_selection(&self, selection: Option<String>) -> Result<()> {
        self.send(Command::SetSelection(selection)).await
    }

    pub async fn update_router(&self, router: TagRouter) -> Result<()> {
        self.send(Command::SetRouter(router)).await
    }

    pub fn overview(&self) -> SyncOverview {
        self.overview.borrow().clone()
    }

    pub fn subscribe_overview(&self) -> watch::Receiver<SyncOverview> {
        self.overview.clone()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// A running sync worker.
pub struct SyncService {
    handle: SyncHandle,
    worker: JoinHandle<SyncEngine>,
}

impl SyncService {
    /// Run startup recovery and spawn the worker. Must be called within a Tokio runtime.
    pub fn start(mut engine: SyncEngine) -> Result<Self> {
        engine.startup()?;

        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (overview_tx, overview_rx) = watch::channel(engine.overview());
        let changes = engine.store().change_sender();
        let startup_delay = engine.config().startup_delay();
        let interval = engine.config().interval();

        tracing::info!(
            startup_delay_secs = startup_delay.as_secs(),
            interval_secs = interval.as_secs(),
            "sync service started"
        );
        let worker = tokio::spawn(run_worker(
            engine,
            receiver,
            overview_tx,
            startup_delay,
            interval,
        ));

        Ok(Self {
            handle: SyncHandle {
                commands,
                overview: overview_rx,
                changes,
            },
            worker,
        })
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Stop and hand back the engine. A running round lets its in-flight
    /// calls finish, starts nothing new, and persists before the worker exits.
    pub async fn stop(self) -> Result<SyncEngine> {
        // A closed channel means the worker already exited.
        let _ = self.handle.commands.send(Command::Stop).await;
        self.worker
            .await
            .map_err(|e| CoreError::Custom(format!("sync worker failed: {e}")))
    }
}

/// Serve a command that does not start a round.
fn serve(engine: &mut SyncEngine, command: Command, overview: &watch::Sender<SyncOverview>) {
    match command {
        Command::Mutate(mutation, reply) => {
            let _ = reply.send(engine.apply(mutation));
        }
        Command::Events(reply) => {
            let _ = reply.send(engine.events());
        }
        Command::DeadLetters(reply) => {
            let _ = reply.send(engine.dead_letters());
        }
        Command::Retry(Some(id), reply) => {
            let _ = reply.send(engine.retry_dead_letter(id).map(|_| 1));
        }
        Command::Retry(None, reply) => {
            let _ = reply.send(engine.retry_all_dead_letters());
        }
        Command::Discard(id, reply) => {
            let _ = reply.send(engine.discard_dead_letter(id));
        }
        Command::SetSelection(selection) => engine.set_selection(selection),
        Command::SetRouter(router) => engine.set_router(router),
        Command::Sync(..) | Command::Stop => {}
    }
    overview.send_replace(engine.overview());
}

async fn run_worker(
    mut engine: SyncEngine,
    mut commands: mpsc::Receiver<Command>,
    overview: watch::Sender<SyncOverview>,
    startup_delay: Duration,
    interval: Duration,
) -> SyncEngine {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + startup_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut started = false;
    let mut follow_up: Option<FollowUp> = None;

    loop {
        // Deadlines before the startup round wait for it.
        let wake = engine.next_ready_in().filter(|_| started);
        let wake_at = Instant::now() + wake.unwrap_or_default() + WAKE_SLACK;

        let next = match follow_up.take() {
            Some(next) => next,
            None => tokio::select! {
                _ = ticker.tick() => {
                    let trigger = if started { SyncTrigger::Interval } else { SyncTrigger::Startup };
                    started = true;
                    FollowUp::new(trigger)
                }
                _ = tokio::time::sleep_until(wake_at), if wake.is_some() => {
                    tracing::debug!("pending action came due");
                    FollowUp::new(SyncTrigger::Interval)
                }
                command = commands.recv() => match command {
                    None | Some(Command::Stop) => break,
                    Some(Command::Sync(trigger, reply)) => FollowUp {
                        trigger,
                        waiters: reply.into_iter().collect(),
                    },
                    Some(other) => {
                        serve(&mut engine, other, &overview);
                        continue;
                    }
                },
            },
        };

        let mut requested: Option<FollowUp> = None;
        let mut stop = false;
        let report = {
            let mut hook = |engine: &mut SyncEngine| {
                while !stop {
                    let Ok(command) = commands.try_recv() else {
                        break;
                    };
                    match command {
                        Command::Sync(trigger, reply) => {
                            let pending = requested.get_or_insert_with(|| FollowUp::new(trigger));
                            pending.merge(trigger);
                            pending.waiters.extend(reply);
                        }
                        Command::Stop => stop = true,
                        other => serve(engine, other, &overview),
                    }
                }
                overview.send_replace(engine.overview());
                if stop {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };
            engine.run_round_with(next.trigger, &mut hook).await
        };

        for waiter in next.waiters {
            let _ = waiter.send(report.clone());
        }
        overview.send_replace(engine.overview());
        // The startup round keeps its slot even if a manual round ran first.
        if started {
            ticker.reset();
        }

        if stop {
            break;
        }
        follow_up = requested;
    }

    if let Err(e) = engine.persist() {
        tracing::error!(error = %e, "failed to persist sync state on shutdown");
    }
    tracing::info!("sync service stopped");
    engine
}
