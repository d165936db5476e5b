pub mod cursor;
pub mod entity;
pub mod error;
pub mod refs;

// Re-export commonly used types
pub use cursor::Cursor;
pub use entity::{ChangeOp, EntityType};
pub use error::SyncError;
