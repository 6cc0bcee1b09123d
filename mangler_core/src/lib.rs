pub mod binstruct;
pub mod bits;
pub mod broker;
pub mod checksum;
pub mod config;
pub mod connector;
pub mod crashparse;
pub mod field;
pub mod generator;
pub mod mutation;
pub mod producer;
pub mod protocol;
pub mod store;
pub mod worker;

pub use binstruct::{Binstruct, BinstructError, Node};
pub use bits::Bits;
pub use broker::{BrokerCore, BrokerError, BrokerEvent, ConnId};
pub use checksum::crc32;
pub use config::{BrokerConfig, ProducerConfig, WorkerConfig};
pub use connector::{Connector, RecvRing};
pub use crashparse::{CrashDetail, LoadedModule};
pub use field::{Endianness, Field, FieldError, FieldKind, LengthType};
pub use generator::{
    BinaryCornerCases, Cartesian, Chain, Chop, DuplicateFilter, EnumerateBits, Generator,
    GeneratorError, RandCases, Repeater, RollingCorrupt, Static,
};
pub use mutation::{
    DefaultMutations, FieldMutations, FuzzOptions, MutationError, MutationRegistry, StructFuzzer,
};
pub use producer::{ProducerCore, ProducerCounters};
pub use protocol::{Message, ProtocolError};
pub use store::{ResultStore, StoreError, StoreWorkerCore, StoredResult, TestOutcome};
pub use worker::{Delivery, DeliveryOutcome, WorkerCore};
