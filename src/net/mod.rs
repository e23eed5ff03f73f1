pub mod buffer;
pub mod poller;
pub mod socket;

pub use buffer::Buffer;
pub use poller::{Poller, ERROR, READABLE, WRITABLE};
pub use socket::Socket;
