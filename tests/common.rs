#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use client_queue::config::Config;
use client_queue::core::{
    ClientQueuePersistence, DiscardPolicy, InMemoryPayloadStore, MessageDroppedService, Publish,
    Qos, QueueResult,
};
use client_queue::storage::{Journal, MemoryJournal};

pub const BIG_BYTE_LIMIT: u64 = 256_000;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = client_queue::logging::init_logging_with("warn");
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dropped {
    QueueFull { queue_id: String, topic: String, qos: Qos },
    Qos0 { client_id: String, topic: String },
    Qos0Shared { group_id: String, topic: String },
}

#[derive(Debug, Default)]
pub struct RecordingDropService {
    events: Mutex<Vec<Dropped>>,
}

impl RecordingDropService {
    pub fn events(&self) -> Vec<Dropped> {
        self.events.lock().clone()
    }

    pub fn queue_full_topics(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Dropped::QueueFull { topic, .. } => Some(topic.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MessageDroppedService for RecordingDropService {
    fn queue_full(&self, queue_id: &str, topic: &str, qos: Qos) {
        self.events.lock().push(Dropped::QueueFull {
            queue_id: queue_id.to_string(),
            topic: topic.to_string(),
            qos,
        });
    }

    fn qos0_memory_exceeded(&self, client_id: &str, topic: &str, _qos: Qos, _current: u64, _limit: u64) {
        self.events.lock().push(Dropped::Qos0 {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
        });
    }

    fn qos0_memory_exceeded_shared(
        &self,
        group_id: &str,
        topic: &str,
        _qos: Qos,
        _current: u64,
        _limit: u64,
    ) {
        self.events.lock().push(Dropped::Qos0Shared {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
        });
    }
}

pub fn small_config() -> Config {
    Config {
        bucket_count: 4,
        ..Config::default()
    }
}

/// Engine plus the collaborators tests want to look at.
pub struct Harness {
    pub engine: ClientQueuePersistence,
    pub payloads: Arc<InMemoryPayloadStore>,
    pub dropped: Arc<RecordingDropService>,
    pub journals: Vec<MemoryJournal>,
    next_publish: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    pub fn with_config(config: Config) -> Self {
        let journals = (0..config.bucket_count).map(|_| MemoryJournal::new()).collect();
        Self::with_journals(config, journals, Arc::new(InMemoryPayloadStore::new()))
    }

    /// Rebuild on top of existing journals, as after a restart.
    pub fn with_journals(
        config: Config,
        journals: Vec<MemoryJournal>,
        payloads: Arc<InMemoryPayloadStore>,
    ) -> Self {
        init_logging();
        let dropped = Arc::new(RecordingDropService::default());
        let boxed = journals
            .iter()
            .map(|journal| Box::new(journal.clone()) as Box<dyn Journal>)
            .collect();
        let engine = ClientQueuePersistence::with_journals(
            config,
            boxed,
            Arc::clone(&payloads) as _,
            Arc::clone(&dropped) as _,
        )
        .expect("engine opens");
        Self {
            engine,
            payloads,
            dropped,
            journals,
            next_publish: AtomicU64::new(1),
        }
    }

    /// A publish with its own payload (one reference counted) and unique id.
    pub fn publish(&self, qos: Qos, topic: &str) -> Publish {
        let n = self.next_publish.fetch_add(1, Ordering::Relaxed);
        let payload_id = self.payloads.add(topic.as_bytes().to_vec());
        Publish::new(topic, qos, payload_id, format!("node_pub_{n}"))
    }

    pub fn bucket(&self, queue_id: &str) -> usize {
        self.engine.bucket_for(queue_id)
    }

    pub fn add(
        &self,
        queue_id: &str,
        shared: bool,
        publish: Publish,
        limit: usize,
        policy: DiscardPolicy,
    ) -> QueueResult<()> {
        self.engine
            .add(queue_id, shared, publish.into(), limit, policy, self.bucket(queue_id))
    }

    pub fn add_simple(&self, queue_id: &str, qos: Qos, topic: &str) -> Publish {
        let publish = self.publish(qos, topic);
        self.add(queue_id, false, publish.clone(), 100, DiscardPolicy::Discard)
            .expect("add succeeds");
        publish
    }

    pub fn read_new(&self, queue_id: &str, shared: bool, packet_ids: &[u16]) -> Vec<Publish> {
        self.engine
            .read_new(queue_id, shared, packet_ids, BIG_BYTE_LIMIT, self.bucket(queue_id))
            .expect("read_new succeeds")
    }

    pub fn size(&self, queue_id: &str, shared: bool) -> usize {
        self.engine
            .size(queue_id, shared, self.bucket(queue_id))
            .expect("size succeeds")
    }
}

pub fn topics(messages: &[Publish]) -> Vec<&str> {
    messages.iter().map(|m| m.topic.as_str()).collect()
}
