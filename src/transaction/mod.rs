//! RFC 3261 §17 transaction layer: matching keys, the four transaction
//! state machines, the timer wheel that drives their retransmit/timeout
//! behavior, and the registry that routes inbound messages to them.

pub mod endpoint;
pub mod key;
pub mod registry;
pub mod timer;
pub mod transaction;

pub use endpoint::{Endpoint, EndpointBuilder, EndpointInner, EndpointInnerRef, EndpointOption};
pub use key::{TransactionKey, TransactionRole};
pub use transaction::{Transaction, TransactionKind, TransactionState, TuEvent, TuEventSender};
