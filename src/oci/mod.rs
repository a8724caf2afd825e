pub mod reference;
pub mod registry;
pub mod source;

pub use reference::ImageRef;
pub use registry::HttpRegistry;
pub use source::ImageSource;
