pub mod close;
pub mod codec;
pub mod messages;
