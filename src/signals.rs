use std::sync::Arc;

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};

use crate::registry::Registry;

/// What should we do when the user stops
/// this program?
pub fn handle_shutdown(registry: Arc<Registry>, rt_handle: tokio::runtime::Handle) {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("No signals :(. This really should never happen");

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            log::info!("shutdown signal received, offboarding everything");
            rt_handle.block_on(registry.shutdown_all());
            std::process::exit(0);
        }
    });
}
