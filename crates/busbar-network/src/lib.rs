mod buffer;
mod event_loop;
mod socket;

pub use buffer::ElasticBuffer;
pub use event_loop::{EventLoop, LoopPool, NetError};
pub use socket::{MAX_BUF_SIZE, Socket, SocketHandler};
