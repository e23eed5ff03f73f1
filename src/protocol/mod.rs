mod method;
mod request;
mod response;
mod version;

pub use method::Method;
pub use request::Request;
pub use response::Response;
pub use version::Version;
