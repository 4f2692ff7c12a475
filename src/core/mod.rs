// Core modules implementing interpreter ownership, libraries, unit caching, and errors.
pub mod context;
pub mod error;
pub mod library;
pub mod lua;
pub mod unit;
pub mod value;
