//! Data model and wire protocol shared by every crate in this workspace: job identity and
//! status, the closed argument/result value grammar, the function registry, and the messages
//! that cross a handler/compute-resource boundary. Nothing in this crate runs a job; it only
//! describes one.

mod container;
mod error;
mod ids;
mod proto;
mod registry;
mod runtime_info;
mod spec;
mod status;
mod value;

pub use container::ContainerImage;
pub use error::{HitherError, Result};
pub use ids::{Fingerprint, HandlerUri, JobId, Sha256Hex};
pub use proto::{HandlerToResource, JobResult, RegistryMessage, ResourceToHandler};
pub use registry::{default_registry, FunctionEntry, FunctionRegistry, RegisteredFn};
pub use runtime_info::{ConsoleLine, RuntimeInfo};
pub use spec::{FunctionCode, JobFlags, JobSpec};
pub use status::JobStatus;
pub use value::{FileKind, FileRef, NdArray, Value, ValueMap};
