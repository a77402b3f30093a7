mod blob;
mod grpc;
mod pod;
mod protobuf;

pub use self::blob::*;
pub use self::grpc::*;
pub use self::pod::*;
pub use self::protobuf::*;
