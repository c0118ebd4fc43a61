//! Data-plane servers: public front listeners, the agent back channel,
//! and the byte relay between matched pairs.

pub mod back;
pub mod conduit;
pub mod front;

pub use back::{BackError, BackServer};
pub use conduit::{splice, ConduitError};
pub use front::{FrontError, FrontServer};
