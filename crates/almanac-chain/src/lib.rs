pub mod batch;
pub mod client;
pub mod decoder;
pub mod fetcher;
pub mod proto;
pub mod registry;
pub mod rpc;
pub mod store;

pub use batch::{batch_key, build_batch, BatchArtifact};
pub use client::{EvmClient, FilterQuery};
pub use decoder::{decode_batch_to_labels, DecodeOptions};
pub use registry::{derive_selector, AbiEntry, AbiMap, CustomerUpdates};
pub use rpc::{HttpTransport, RpcTransport};
pub use store::{ArtifactStore, FsStore};
