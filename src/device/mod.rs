pub mod registry;
pub mod session;

pub use registry::DeviceRegistry;
pub use session::DeviceSession;
