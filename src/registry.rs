use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeClass {
    Standard,
    Privileged,
}

impl PrivilegeClass {
    pub fn from_path(path: &str, marker: &str) -> Self {
        if path.contains(marker) {
            Self::Privileged
        } else {
            Self::Standard
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Privileged => "privileged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Population {
    pub standard: usize,
    pub privileged: usize,
}

impl Population {
    pub fn total(&self) -> usize {
        self.standard + self.privileged
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("подписчик {0} не в состоянии OPEN")]
    NotOpen(SubscriberId),
    #[error("очередь подписчика {0} переполнена")]
    QueueFull(SubscriberId),
    #[error("подписчик {0} отключился")]
    Disconnected(SubscriberId),
}

#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    class: PrivilegeClass,
    state: Arc<AtomicU8>,
    queue: mpsc::Sender<String>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn class(&self) -> PrivilegeClass {
        self.class
    }

    pub fn is_privileged(&self) -> bool {
        self.class == PrivilegeClass::Privileged
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            CONNECTING => ConnectionState::Connecting,
            OPEN => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    pub fn send(&self, text: String) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::NotOpen(self.id));
        }
        self.queue.try_send(text).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            TrySendError::Closed(_) => DeliveryError::Disconnected(self.id),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Subscriber>>>,
    next_id: Arc<AtomicU64>,
    population: Arc<watch::Sender<Population>>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        let (population, _) = watch::channel(Population::default());
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            population: Arc::new(population),
        }
    }

    pub async fn register(&self, class: PrivilegeClass, queue: mpsc::Sender<String>) -> Subscriber {
        let subscriber = Subscriber {
            id: SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            class,
            state: Arc::new(AtomicU8::new(CONNECTING)),
            queue,
        };

        let mut guard = self.subscribers.write().await;
        guard.insert(subscriber.id, subscriber.clone());
        self.population.send_replace(count(&guard));
        subscriber
    }

    pub async fn unregister(&self, id: SubscriberId) -> Option<Subscriber> {
        let mut guard = self.subscribers.write().await;
        let removed = guard.remove(&id);
        if let Some(subscriber) = &removed {
            subscriber.mark_closed();
            self.population.send_replace(count(&guard));
        }
        removed
    }

    pub async fn get(&self, id: SubscriberId) -> Option<Subscriber> {
        self.subscribers.read().await.get(&id).cloned()
    }

    pub async fn list_standard(&self) -> Vec<Subscriber> {
        self.list(|s| s.class == PrivilegeClass::Standard).await
    }

    pub async fn list_privileged(&self) -> Vec<Subscriber> {
        self.list(|s| s.class == PrivilegeClass::Privileged).await
    }

    pub async fn list_all(&self) -> Vec<Subscriber> {
        self.list(|_| true).await
    }

    async fn list(&self, keep: impl Fn(&Subscriber) -> bool) -> Vec<Subscriber> {
        let mut out: Vec<Subscriber> = self
            .subscribers
            .read()
            .await
            .values()
            .filter(|s| keep(s))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn population(&self) -> Population {
        *self.population.borrow()
    }

    pub fn watch_population(&self) -> watch::Receiver<Population> {
        self.population.subscribe()
    }

    pub async fn close_all(&self) -> usize {
        let mut guard = self.subscribers.write().await;
        let closed = guard.len();
        for subscriber in guard.values() {
            subscriber.mark_closed();
        }
        guard.clear();
        self.population.send_replace(Population::default());
        closed
    }
}

fn count(subscribers: &HashMap<SubscriberId, Subscriber>) -> Population {
    subscribers
        .values()
        .fold(Population::default(), |mut acc, s| {
            match s.class {
                PrivilegeClass::Standard => acc.standard += 1,
                PrivilegeClass::Privileged => acc.privileged += 1,
            }
            acc
        })
}
