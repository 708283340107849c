pub mod engine;
pub mod mvcc;


pub use engine::{Cf, Engine, EngineOptions, RangeProperties, SamplePoint, Snapshot, WriteBatch};
pub use mvcc::{Key, Mutation, MvccScanner, MvccStore, Op, Pair};
