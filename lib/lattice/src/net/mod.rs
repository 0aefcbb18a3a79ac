pub mod buffer;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod control;
pub mod frame;
pub mod gate;
pub mod message;
pub mod protocol;
pub mod request;
pub mod serializer;
pub mod transport;
pub mod wire;
