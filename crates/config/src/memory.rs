use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    ChangeEvent, ChangeKind, ConfigError, Listener, ListenerId, Result, Source, normalize_group,
};

type Listeners = DashMap<ListenerId, (String, String, Listener)>;

struct Notifier {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-process config source.
///
/// Changes are queued and delivered to listeners by one owned notifier task,
/// so a slow listener never blocks a publisher. `close` delivers what is
/// already queued, then joins the task.
pub struct MemorySource {
    values: DashMap<(String, String), String>,
    listeners: Arc<Listeners>,
    events: flume::Sender<ChangeEvent>,
    notifier: Mutex<Option<Notifier>>,
    closed: AtomicBool,
}

impl Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("values", &self.values.len())
            .field("listeners", &self.listeners.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemorySource {
    /// Creates an empty source and spawns its notifier.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (events, receiver) = flume::unbounded();
        let listeners = Arc::new(Listeners::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Self::notify_loop(
            receiver,
            listeners.clone(),
            cancel.clone(),
        ));

        Self {
            values: DashMap::new(),
            listeners,
            events,
            notifier: Mutex::new(Some(Notifier { cancel, handle })),
            closed: AtomicBool::new(false),
        }
    }

    async fn notify_loop(
        receiver: flume::Receiver<ChangeEvent>,
        listeners: Arc<Listeners>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = receiver.recv_async() => match event {
                    Ok(event) => Self::dispatch(&listeners, &event),
                    Err(_) => return,
                },
            }
        }

        for event in receiver.try_iter() {
            Self::dispatch(&listeners, &event);
        }
        debug!("Config notifier stopped");
    }

    fn dispatch(listeners: &Listeners, event: &ChangeEvent) {
        let matching: Vec<Listener> = listeners
            .iter()
            .filter(|entry| {
                let (key, group, _) = entry.value();
                *key == event.key && *group == event.group
            })
            .map(|entry| entry.value().2.clone())
            .collect();

        for listener in matching {
            listener(event);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConfigError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify(&self, event: ChangeEvent) {
        if self.events.send(event).is_err() {
            warn!("Config notifier is gone; change not delivered");
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn get(&self, key: &str, group: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self
            .values
            .get(&(key.to_string(), normalize_group(group)))
            .map(|value| value.clone()))
    }

    async fn publish(&self, key: &str, group: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        let group = normalize_group(group);

        let kind = match self
            .values
            .insert((key.to_string(), group.clone()), value.to_string())
        {
            None => ChangeKind::Added,
            Some(previous) if previous == value => return Ok(()),
            Some(_) => ChangeKind::Modified,
        };

        self.notify(ChangeEvent {
            key: key.to_string(),
            group,
            value: Some(value.to_string()),
            kind,
        });
        Ok(())
    }

    async fn remove(&self, key: &str, group: &str) -> Result<()> {
        self.ensure_open()?;
        let group = normalize_group(group);

        if self.values.remove(&(key.to_string(), group.clone())).is_some() {
            self.notify(ChangeEvent {
                key: key.to_string(),
                group,
                value: None,
                kind: ChangeKind::Deleted,
            });
        }
        Ok(())
    }

    async fn keys_by_group(&self, group: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let group = normalize_group(group);

        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| entry.key().1 == group)
            .map(|entry| entry.key().0.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn add_listener(
        &self,
        key: &str,
        group: &str,
        listener: Listener,
    ) -> Result<ListenerId> {
        self.ensure_open()?;

        let id = ListenerId(Uuid::new_v4());
        self.listeners
            .insert(id, (key.to_string(), normalize_group(group), listener));
        Ok(id)
    }

    async fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.ensure_open()?;
        self.listeners.remove(&id);
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let notifier = self.notifier.lock().take();
        if let Some(Notifier { cancel, handle }) = notifier {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Config notifier panicked: {}", e);
            }
            self.listeners.clear();
        }
        Ok(())
    }
}
