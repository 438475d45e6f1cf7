pub mod clock;
pub mod decoder;
pub mod filter;
pub mod gate;
pub mod pipeline;
pub mod session;
pub mod transport;
