//! Motion bridge binary entry point.
//!
//! All setup and lifecycle management lives in the library crate
//! (`motion_bridge_lib::run`).

fn main() -> anyhow::Result<()> {
    motion_bridge_lib::run()
}
