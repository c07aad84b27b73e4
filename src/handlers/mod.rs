pub mod config;
pub mod session;
pub mod view;

pub use self::config::*;
pub use self::session::*;
pub use self::view::*;
