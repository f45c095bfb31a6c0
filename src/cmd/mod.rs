//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `config`   | `Config`         |
//! | `simulate` | `Simulate`       |

pub mod config;
pub mod simulate;

pub use config::cmd_config;
pub use simulate::cmd_simulate;
