//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `build`   | `Build`            |
//! | `resolve` | `Resolve`          |
//! | `cache`   | `Status`, `Clean`  |
//! | `config`  | `Config`           |

pub mod build;
pub mod cache;
pub mod config;
pub mod resolve;

pub use build::{BuildOptions, cmd_build};
pub use cache::{cmd_clean, cmd_status};
pub use config::cmd_config;
pub use resolve::cmd_resolve;
