pub mod consts;
pub mod framing;
pub mod hashcash;

pub use framing::{read_message, write_message, Message};
pub use hashcash::HashcashHeader;
