// Module naming follows project convention (Hub = buffer ownership broker)
#[allow(non_snake_case)]
pub mod Hub {
    pub mod Buffer {
        pub mod Block;
        pub mod Block_impl;
        pub mod layout;
        pub use Block::SharedBlock; // re-export for stable path
        pub use layout::{BufferState, MetadataHeader};
    }
    pub mod Structs {
        pub mod Buffer_Structs;
        pub use Buffer_Structs::{BufferDescription, QueueConfig, QueueInfo, UsagePolicy}; // re-export for stable path
    }

    pub mod consumer;
    pub mod consumer_queue;
    pub mod events;
    pub mod producer;
    pub mod producer_queue;
    pub mod service;

    pub use consumer::ConsumerChannel;
    pub use consumer_queue::ConsumerQueueChannel;
    pub use events::{ChannelEvents, EVENT_AVAILABLE, EVENT_HANGUP};
    pub use producer::{ProducerChannel, NO_CHECK, USE_CALLER};
    pub use producer_queue::ProducerQueueChannel;
    pub use service::BufferHubService;
}
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{
        attach_shared_memory, create_shared_memory, RawHandle, SharedMemoryBackend,
    };
    pub mod fence;
    pub mod futex;
    pub use fence::Fence;
}

pub mod ffi;
