pub mod family;
pub mod job;
pub mod manager;
pub mod target;
pub mod validator;

pub use family::{Blake2Chain, ChainShareValidator, ContextCache, HeaderShareValidator, PowContext, PowError};
pub use job::{BlockTemplate, Job, JobStore, MAX_BLOCK_BACKLOG};
pub use manager::{JobEvent, JobManager, JobManagerError, JobManagerOptions, SyncState, WorkProvider, WorkProviderError};
pub use validator::{ShareValidator, SubmitContext};
