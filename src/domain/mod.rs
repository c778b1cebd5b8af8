pub mod cancel;
pub mod operation;

// Re-exports for convenience
pub use cancel::*;
pub use operation::*;
