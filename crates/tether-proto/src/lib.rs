pub mod v1 {
    tonic::include_proto!("tether.v1");
}

pub use v1::ConnectionMessage;
pub use v1::connection_message::MessageType;
