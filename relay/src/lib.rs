pub mod receiver;
pub mod relay;
pub mod wire;

pub use receiver::{RelaySubscription, ShareReceiver};
pub use relay::{ShareRelay, ShareRelayOptions};
pub use wire::{WIRE_FORMAT_MASK, WireError, WireFormat};
