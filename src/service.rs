//! Services this handle has asked the broker to route to it.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Registration state of a named service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// `service.add` was sent and the broker has not answered yet.
    Pending,
    Active,
    /// The broker refused the registration.
    Failed,
}

/// Registry update applied when the broker answers a service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServiceHook {
    Register(String),
    Unregister(String),
}

#[derive(Debug, Default)]
pub(crate) struct ServiceRegistry {
    services: HashMap<String, ServiceState>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).copied()
    }

    pub(crate) fn check_register(&self, name: &str) -> Result<()> {
        match self.state(name) {
            Some(ServiceState::Pending | ServiceState::Active) => {
                Err(Error::ServiceExists(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn check_unregister(&self, name: &str) -> Result<()> {
        match self.state(name) {
            Some(ServiceState::Active) => Ok(()),
            _ => Err(Error::NotFound(format!("service {name}"))),
        }
    }

    pub(crate) fn mark_pending(&mut self, name: &str) {
        self.services.insert(name.to_owned(), ServiceState::Pending);
    }

    /// Applies the broker's answer to a registration or removal.
    pub(crate) fn apply(&mut self, hook: ServiceHook, ok: bool) {
        match (hook, ok) {
            (ServiceHook::Register(name), true) => {
                tracing::debug!(service = %name, "service registered");
                self.services.insert(name, ServiceState::Active);
            }
            (ServiceHook::Register(name), false) => {
                tracing::warn!(service = %name, "service registration refused");
                self.services.insert(name, ServiceState::Failed);
            }
            (ServiceHook::Unregister(name), true) => {
                tracing::debug!(service = %name, "service unregistered");
                self.services.remove(&name);
            }
            (ServiceHook::Unregister(name), false) => {
                tracing::warn!(service = %name, "service removal refused");
            }
        }
    }

    /// Forgets every service, e.g. when the connection goes away.
    pub(crate) fn clear(&mut self) {
        self.services.clear();
    }
}
