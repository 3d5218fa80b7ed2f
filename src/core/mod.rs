pub mod bucket;
pub mod codec;
pub mod dropped;
pub mod engine;
pub mod entry;
pub mod error;
pub mod governor;
pub mod message;
pub mod packet_id;
pub mod payload;
pub mod policy;
pub mod sequence;
pub mod writer;

pub use dropped::{LoggingDropService, MessageDroppedService};
pub use engine::{BucketSummary, ClientQueuePersistence, StatsSnapshot};
pub use error::{QueueError, QueueResult};
pub use message::{InflightMessage, Publish, Pubrel, Qos, QueuedMessage};
pub use payload::{InMemoryPayloadStore, PayloadPersistence};
pub use policy::DiscardPolicy;
pub use writer::{ClientQueueService, SingleWriter};
