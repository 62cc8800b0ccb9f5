//! Concurrent containers sharing the allocators' slot-ownership discipline:
//! fixed capacity decided at construction, explicit reclaim step.

pub mod hash_map;

pub use hash_map::ConcurrentHashMap;
