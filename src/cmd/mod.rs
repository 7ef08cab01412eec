//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                              |
//! |----------|-----------------------------------------------|
//! | `init`   | `Init`                                        |
//! | `serve`  | `Serve`                                       |
//! | `leads`  | `Leads` (`list`, `add`, `move`, `delete`)     |
//! | `config` | `Config`                                      |

pub mod config;
pub mod init;
pub mod leads;
pub mod serve;

pub use config::cmd_config;
pub use init::cmd_init;
pub use leads::cmd_leads;
pub use serve::cmd_serve;
