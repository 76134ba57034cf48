pub(crate) mod receiver;
pub(crate) mod sender;

pub use receiver::{ReceiverBuilder, Receiver, RecvError, receiver};
pub use sender::{Broadcaster, BroadcasterBuilder, BroadcasterTask, ConfigError, SendError, broadcaster};
