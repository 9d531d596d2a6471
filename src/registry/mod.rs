use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;

use crate::cache::ResponseCache;
use crate::container::{Container, ContainerError};
use crate::nrpe::NrpeService;
use crate::protocol::{Request, Response};
use crate::registry::supervisor::{ServiceToken, Supervisor};

pub mod supervisor;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("'{0}' is already registered")]
    DuplicateRegistration(String),
    #[error("container '{0}' has no checks to publish")]
    NoInventory(String),
    #[error("check '{check}' is already registered by container '{owner}'")]
    DuplicateCheck { check: String, owner: String },
    #[error("no check named '{0}'")]
    UnknownCheck(String),
    #[error("'{0}' is not registered")]
    NotFound(String),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// The two kinds of supervised entities: check containers, which publish an
/// inventory, and plain network services, which only need their serve loop
/// kept alive.
#[derive(Clone)]
pub enum Entity {
    Container(Arc<Container>),
    Service(Arc<NrpeService>),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Entity::Container(c) => c.name(),
            Entity::Service(s) => s.name(),
        }
    }
}

/// Owns the check-name routing table and every supervised entity. All
/// mutating operations serialize on internal mutexes; none are held across
/// await points.
pub struct Registry {
    supervisor: Supervisor,
    entities: Mutex<HashMap<String, (Entity, ServiceToken)>>,
    routes: Mutex<HashMap<String, Arc<Container>>>,
    cache: Arc<ResponseCache>,
    last_run: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            supervisor: Supervisor::new(),
            entities: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            cache: Arc::new(ResponseCache::new(cache_ttl)),
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> Arc<ResponseCache> {
        Arc::clone(&self.cache)
    }

    /// Puts the entity's serve loop under supervision. Does not bootstrap;
    /// that happens at onboarding, once the process had a chance to start.
    pub fn register(&self, entity: Entity) -> Result<ServiceToken, RegistryError> {
        let name = entity.name().to_string();
        let mut entities = self.entities.lock().expect("registry mutex poisoned");
        if entities.contains_key(&name) {
            return Err(RegistryError::DuplicateRegistration(name));
        }

        let token = match &entity {
            Entity::Container(container) => {
                let container = Arc::clone(container);
                self.supervisor.add(&name, move || {
                    let container = Arc::clone(&container);
                    async move {
                        container.process().serve().await?;
                        Ok(())
                    }
                    .boxed()
                })
            }
            Entity::Service(service) => {
                let service = Arc::clone(service);
                self.supervisor.add(&name, move || {
                    let service = Arc::clone(&service);
                    async move {
                        service.serve().await?;
                        Ok(())
                    }
                    .boxed()
                })
            }
        };

        log::info!("[registry] registered '{name}'");
        entities.insert(name, (entity, token));
        Ok(token)
    }

    /// Bootstraps a registered entity and, for containers, publishes its
    /// checks into the routing table. A check-name collision with another
    /// container rejects the whole inventory and leaves the existing
    /// registration intact.
    pub async fn onboard(&self, name: &str) -> Result<(), RegistryError> {
        let entity = {
            let entities = self.entities.lock().expect("registry mutex poisoned");
            entities
                .get(name)
                .map(|(entity, _)| entity.clone())
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
        };

        let container = match entity {
            Entity::Service(service) => {
                service.bootstrap();
                return Ok(());
            }
            Entity::Container(container) => container,
        };

        container.bootstrap().await?;
        let inventory = container.inventory().await;
        if inventory.is_empty() {
            return Err(RegistryError::NoInventory(name.to_string()));
        }

        let mut routes = self.routes.lock().expect("registry mutex poisoned");
        for check in &inventory {
            if let Some(owner) = routes.get(check)
                && owner.name() != container.name()
            {
                return Err(RegistryError::DuplicateCheck {
                    check: check.clone(),
                    owner: owner.name().to_string(),
                });
            }
        }
        for check in inventory {
            log::info!("[registry] container '{name}' publishes check '{check}'");
            routes.insert(check, Arc::clone(&container));
        }
        Ok(())
    }

    /// Removes an entity: containers are shut down and their checks
    /// unpublished; services only leave the tree. The supervisor token is
    /// released last.
    pub async fn offboard(&self, name: &str) -> Result<(), RegistryError> {
        let (entity, token) = {
            let mut entities = self.entities.lock().expect("registry mutex poisoned");
            entities
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
        };

        if let Entity::Container(container) = &entity {
            container.shutdown().await;
            let mut routes = self.routes.lock().expect("registry mutex poisoned");
            routes.retain(|_, owner| owner.name() != container.name());
        }

        self.supervisor.remove(token);
        log::info!("[registry] offboarded '{name}'");
        Ok(())
    }

    /// Routes a check execution to its owning container and caches the
    /// response. Container errors propagate unchanged; no response is
    /// synthesized here.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Vec<String>,
    ) -> Result<Response, RegistryError> {
        let container = {
            let routes = self.routes.lock().expect("registry mutex poisoned");
            routes
                .get(command)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownCheck(command.to_string()))?
        };

        log::debug!(
            "[registry] executing '{command}' on container '{}'",
            container.name()
        );
        let request = Request::new(command, arguments);
        let response = container.execute(&request).await?;

        self.cache.store(command, response.clone());
        self.last_run
            .lock()
            .expect("registry mutex poisoned")
            .insert(command.to_string(), Instant::now());
        Ok(response)
    }

    /// Names of published checks that have not executed successfully within
    /// `threshold` (or never ran at all).
    pub fn stale_checks(&self, threshold: Duration) -> Vec<String> {
        let routes = self.routes.lock().expect("registry mutex poisoned");
        let last_run = self.last_run.lock().expect("registry mutex poisoned");
        let mut stale: Vec<String> = routes
            .keys()
            .filter(|check| {
                last_run
                    .get(*check)
                    .is_none_or(|ran| ran.elapsed() > threshold)
            })
            .cloned()
            .collect();
        stale.sort();
        stale
    }

    /// Offboards everything; used on shutdown.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = {
            let entities = self.entities.lock().expect("registry mutex poisoned");
            entities.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.offboard(&name).await {
                log::warn!("[registry] error offboarding '{name}': {e}");
            }
        }
        self.supervisor.shutdown();
    }
}
