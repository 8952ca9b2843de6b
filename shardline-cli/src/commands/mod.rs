pub mod cluster;
pub mod health;
pub mod reroute;

pub use cluster::{
    run_add_node, run_create_index, run_delete_index, run_failed, run_init, run_remove_node,
    run_settings, run_started, run_state,
};
pub use health::run_health;
pub use reroute::run_reroute;

use anyhow::Result;
use serde::Serialize;

/// Print a value as pretty JSON on stdout
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
