use std::sync::Arc;

mod cache;
mod cli;
mod config_file;
mod container;
mod nrpe;
mod protocol;
mod registry;
mod relay;
mod signals;
#[cfg(test)]
mod testutil;

use config_file::{AgentConfigFile, ServiceKind};
use container::Container;
use nrpe::NrpeService;
use registry::{Entity, Registry};
use relay::CarbonRelay;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = AgentConfigFile::try_init()?;
    let registry = Arc::new(Registry::new(config.cache_ttl()));

    // Start every provider process first; onboarding follows once the
    // sockets have had their dial-retry window to come up.
    for entry in config.container.iter().filter(|c| c.enabled) {
        let container = Arc::new(Container::new(
            &entry.name,
            entry.command.clone(),
            &config.socket_dir,
        )?);
        registry.register(Entity::Container(container))?;
    }
    for entry in config.container.iter().filter(|c| c.enabled) {
        if let Err(e) = registry.onboard(&entry.name).await {
            log::error!("could not onboard container '{}': {e}", entry.name);
        }
    }

    for entry in config.service.iter().filter(|s| s.enabled) {
        match entry.kind {
            ServiceKind::Nrpe => {
                let service = Arc::new(NrpeService::new(
                    &entry.name,
                    &entry.interface,
                    entry.port,
                    Arc::downgrade(&registry),
                ));
                registry.register(Entity::Service(service))?;
                registry.onboard(&entry.name).await?;
            }
            ServiceKind::Carbon => {
                let relay = CarbonRelay::new(
                    &entry.name,
                    entry.dial_on.clone(),
                    entry.last_run_threshold(),
                    Arc::clone(&registry),
                );
                let interval = entry.relay_interval();
                tokio::spawn(async move { relay.run(interval).await });
            }
        }
    }

    signals::handle_shutdown(Arc::clone(&registry), tokio::runtime::Handle::current());

    std::future::pending::<()>().await;
    Ok(())
}
