pub mod connection;
pub mod request;
pub mod response;

pub use connection::{ConnEvent, Connection, WriteResult};
pub use request::{Method, RequestParser, RequestState};
pub use response::ResponseBuf;
