pub mod banning;
pub mod codec;
pub mod error;
pub mod server;
pub mod session;
pub mod tls;
pub mod vardiff;

pub use banning::{BanManager, BanningPolicy};
pub use codec::{ErrorObject, StratumRequest, StratumResponse, unmarshal_request};
pub use error::StratumError;
pub use server::{ListenerDescriptor, RequestHandler, ServerError, StratumServer, TlsListenerMaterial};
pub use session::{ExtraNonceCounter, Session, SessionOptions, WorkerContext};
pub use tls::{TlsConfigCache, TlsError};
pub use vardiff::{VardiffOptions, VardiffState};
