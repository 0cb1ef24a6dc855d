use crate::collectors::aggregator::ProbeAggregator;
use crate::config::{BroadcastConfig, ControlConfig};
use crate::control::{ControlError, ServerAction, ServerController};
use crate::metrics::Metrics;
use crate::protocol::{InboundMessage, OutboundMessage, PlayerList};
use crate::registry::{
    DeliveryError, Population, PrivilegeClass, Subscriber, SubscriberId, SubscriberRegistry,
};
use crate::state::{SnapshotCache, StatusSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Status,
    Privileged,
}

impl Cadence {
    fn wanted(self, population: &Population) -> bool {
        match self {
            Self::Status => population.total() > 0,
            Self::Privileged => population.privileged > 0,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Privileged => "privileged",
        }
    }
}

pub struct Broadcaster {
    aggregator: ProbeAggregator,
    controller: ServerController,
    cache: SnapshotCache,
    registry: SubscriberRegistry,
    metrics: Arc<Metrics>,
    cfg: BroadcastConfig,
    last_reachable: Mutex<Option<bool>>,
}

impl Broadcaster {
    pub fn new(
        aggregator: ProbeAggregator,
        cfg: BroadcastConfig,
        control: ControlConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let cache = SnapshotCache::new(aggregator.capacity());
        let controller =
            ServerController::new(aggregator.host().clone(), control, aggregator.timeout());
        Arc::new(Self {
            aggregator,
            controller,
            cache,
            registry: SubscriberRegistry::new(),
            metrics,
            cfg,
            last_reachable: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.cfg
    }

    pub fn controller(&self) -> &ServerController {
        &self.controller
    }

    pub async fn connect(&self, class: PrivilegeClass) -> (Subscriber, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue);
        let subscriber = self.registry.register(class, tx).await;
        self.metrics.update_population(self.registry.population());
        info!(
            subscriber_id = %subscriber.id(),
            class = class.as_str(),
            "subscriber connected"
        );
        (subscriber, rx)
    }

    pub async fn disconnect(&self, id: SubscriberId) {
        if self.registry.unregister(id).await.is_some() {
            self.metrics.update_population(self.registry.population());
            info!(subscriber_id = %id, "subscriber disconnected");
        }
    }

    pub async fn refresh(&self) -> Arc<StatusSnapshot> {
        let snapshot = Arc::new(self.aggregator.probe().await);
        self.cache.write(snapshot.clone()).await;
        self.note_reachability(&snapshot).await;
        snapshot
    }

    pub async fn broadcast_status(&self) -> Arc<StatusSnapshot> {
        let snapshot = self.refresh().await;
        let subscribers = self.registry.list_all().await;
        self.deliver(&subscribers, &OutboundMessage::status(&snapshot));
        snapshot
    }

    pub async fn broadcast_privileged(&self, payload: String) -> usize {
        let subscribers = self.registry.list_privileged().await;
        self.deliver(&subscribers, &OutboundMessage::Logs { data: payload })
    }

    pub async fn greet(&self, subscriber: &Subscriber) {
        self.reply(
            subscriber,
            OutboundMessage::Connected {
                message: format!(
                    "connected to serverpulse as {}",
                    subscriber.class().as_str()
                ),
            },
        );
        let snapshot = self.refresh().await;
        self.reply(subscriber, OutboundMessage::status(&snapshot));
    }

    pub async fn on_subscriber_message(self: &Arc<Self>, id: SubscriberId, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(subscriber_id = %id, error = %err, "ignoring inbound message");
                self.metrics.inc_inbound_ignored();
                return;
            }
        };
        let Some(subscriber) = self.registry.get(id).await else {
            return;
        };

        match message {
            InboundMessage::RequestStatus => {
                self.broadcast_status().await;
            }
            InboundMessage::RequestPlayers => {
                let snapshot = self.cache.read().await;
                self.reply(
                    &subscriber,
                    OutboundMessage::PlayerList {
                        data: PlayerList::from(&*snapshot),
                    },
                );
            }
            InboundMessage::Command { command } => {
                self.run_command(&subscriber, &command).await;
            }
            control => {
                if let Some(action) = control.server_action() {
                    self.run_control(&subscriber, action).await;
                }
            }
        }
    }

    async fn run_control(self: &Arc<Self>, subscriber: &Subscriber, action: ServerAction) {
        if !subscriber.is_privileged() {
            warn!(
                subscriber_id = %subscriber.id(),
                action = action.as_str(),
                "server control from standard subscriber rejected"
            );
            self.reply(
                subscriber,
                OutboundMessage::Error {
                    message: "Server control requires an admin connection".to_string(),
                },
            );
            return;
        }

        let result = match action {
            ServerAction::Start => {
                if self.refresh().await.reachable() {
                    Err(ControlError::AlreadyRunning)
                } else {
                    self.controller.start().await
                }
            }
            ServerAction::Stop => self.controller.stop().await,
            ServerAction::Restart => self.controller.restart().await,
        };

        match result {
            Ok(()) => {
                info!(subscriber_id = %subscriber.id(), action = action.as_str(), "server control applied");
                let done = action.done_message().to_string();
                self.reply(subscriber, OutboundMessage::Success { message: done.clone() });
                let admins = self.registry.list_privileged().await;
                self.deliver(&admins, &OutboundMessage::Notification { message: done });

                let delay = self.controller.refresh_delay(action);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    this.broadcast_status().await;
                });
            }
            Err(ControlError::AlreadyRunning) => {
                self.reply(
                    subscriber,
                    OutboundMessage::Error {
                        message: "Server is already running".to_string(),
                    },
                );
            }
            Err(err) => {
                warn!(subscriber_id = %subscriber.id(), action = action.as_str(), error = %err, "server control failed");
                self.reply(
                    subscriber,
                    OutboundMessage::Error {
                        message: format!("Failed to {} server", action.as_str()),
                    },
                );
            }
        }
    }

    async fn run_command(self: &Arc<Self>, subscriber: &Subscriber, command: &str) {
        if !subscriber.is_privileged() {
            warn!(subscriber_id = %subscriber.id(), "console command from standard subscriber rejected");
            self.reply(
                subscriber,
                OutboundMessage::Error {
                    message: "Commands require an admin connection".to_string(),
                },
            );
            return;
        }

        let host = self.aggregator.host();
        match time::timeout(self.aggregator.timeout(), host.send_command(command)).await {
            Ok(Ok(())) => {
                info!(subscriber_id = %subscriber.id(), command, "console command sent");
                self.reply(
                    subscriber,
                    OutboundMessage::Success {
                        message: "Command sent".to_string(),
                    },
                );
                let this = Arc::clone(self);
                let subscriber = subscriber.clone();
                tokio::spawn(async move {
                    time::sleep(Duration::from_millis(this.cfg.command_tail_delay_ms)).await;
                    let tail = this
                        .aggregator
                        .guarded("logs", this.aggregator.host().log_tail(this.cfg.command_tail_lines))
                        .await;
                    if let Some(tail) = tail {
                        this.reply(&subscriber, OutboundMessage::Logs { data: tail });
                    }
                });
            }
            Ok(Err(err)) => {
                warn!(subscriber_id = %subscriber.id(), error = %err, "console command failed");
                self.reply(
                    subscriber,
                    OutboundMessage::Error {
                        message: "Failed to send command".to_string(),
                    },
                );
            }
            Err(_elapsed) => {
                warn!(subscriber_id = %subscriber.id(), "console command timed out");
                self.reply(
                    subscriber,
                    OutboundMessage::Error {
                        message: "Failed to send command".to_string(),
                    },
                );
            }
        }
    }

    pub async fn run_status_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.run_gated(Cadence::Status, shutdown).await;
    }

    pub async fn run_privileged_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.run_gated(Cadence::Privileged, shutdown).await;
    }

    async fn run_gated(&self, cadence: Cadence, mut shutdown: watch::Receiver<bool>) {
        let period = match cadence {
            Cadence::Status => Duration::from_secs(self.cfg.status_interval_secs),
            Cadence::Privileged => Duration::from_secs(self.cfg.privileged_interval_secs),
        };
        let mut population = self.registry.watch_population();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                ready = async { population.wait_for(|p| cadence.wanted(p)).await.is_ok() } => {
                    if !ready {
                        return;
                    }
                }
            }
            debug!(timer = cadence.name(), "timer started");

            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        if !cadence.wanted(&self.registry.population()) {
                            break;
                        }
                        self.tick(cadence).await;
                    }
                    changed = population.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !cadence.wanted(&population.borrow_and_update()) {
                            break;
                        }
                    }
                }
            }
            debug!(timer = cadence.name(), "timer stopped");
        }
    }

    async fn tick(&self, cadence: Cadence) {
        match cadence {
            Cadence::Status => {
                self.broadcast_status().await;
            }
            Cadence::Privileged => {
                let tail = self
                    .aggregator
                    .guarded(
                        "logs",
                        self.aggregator.host().log_tail(self.cfg.privileged_tail_lines),
                    )
                    .await;
                if let Some(tail) = tail {
                    self.broadcast_privileged(tail).await;
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        let closed = self.registry.close_all().await;
        self.metrics.update_population(Population::default());
        info!(closed, "all subscribers closed");
    }

    async fn note_reachability(&self, snapshot: &StatusSnapshot) {
        let reachable = snapshot.reachable();
        let previous = self.last_reachable.lock().await.replace(reachable);
        if previous.is_some_and(|prev| prev != reachable) {
            info!(reachable, "server reachability changed");
            let message = if reachable {
                "Server is up"
            } else {
                "Server went down"
            };
            let subscribers = self.registry.list_privileged().await;
            self.deliver(
                &subscribers,
                &OutboundMessage::Notification {
                    message: message.to_string(),
                },
            );
        }
    }

    fn reply(&self, subscriber: &Subscriber, message: OutboundMessage) -> bool {
        self.deliver(std::slice::from_ref(subscriber), &message) == 1
    }

    fn deliver(&self, subscribers: &[Subscriber], message: &OutboundMessage) -> usize {
        let text = message.to_json();
        let mut sent = 0_usize;
        for subscriber in subscribers {
            match subscriber.send(text.clone()) {
                Ok(()) => sent += 1,
                Err(DeliveryError::NotOpen(_)) => {}
                Err(err) => {
                    debug!(subscriber_id = %subscriber.id(), error = %err, "delivery failed");
                    self.metrics.inc_delivery_failure();
                }
            }
        }
        self.metrics.add_messages_sent(message.kind(), sent as u64);
        sent
    }
}
