//! Service lifecycle driven from the command line
//!
//! The state machine lives here and talks to the OS through
//! [`ServiceManagerApi`]. Every wait is a bounded polling loop.

use super::{ServiceSpec, ServiceState};
use crate::config::BridgeConfig;
use crate::error::ServiceError;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Operations the controller needs from the service manager
///
/// `query` reports [`ServiceState::NotInstalled`] for an absent service,
/// `delete` fails with [`ServiceError::NotInstalled`] and `create` with
/// [`ServiceError::AlreadyExists`].
pub trait ServiceManagerApi {
    /// Holder of the service database lock, `None` when unlocked
    fn lock_owner(&self) -> Result<Option<String>, ServiceError>;
    fn query(&self, name: &str) -> Result<ServiceState, ServiceError>;
    fn create(&self, spec: &ServiceSpec) -> Result<(), ServiceError>;
    fn delete(&self, name: &str) -> Result<(), ServiceError>;
    fn start(&self, name: &str) -> Result<(), ServiceError>;
    fn stop(&self, name: &str) -> Result<(), ServiceError>;
    fn install_event_source(&self, name: &str) -> Result<(), ServiceError>;
    fn remove_event_source(&self, name: &str) -> Result<(), ServiceError>;
}

impl<M: ServiceManagerApi + ?Sized> ServiceManagerApi for Box<M> {
    fn lock_owner(&self) -> Result<Option<String>, ServiceError> {
        (**self).lock_owner()
    }

    fn query(&self, name: &str) -> Result<ServiceState, ServiceError> {
        (**self).query(name)
    }

    fn create(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        (**self).create(spec)
    }

    fn delete(&self, name: &str) -> Result<(), ServiceError> {
        (**self).delete(name)
    }

    fn start(&self, name: &str) -> Result<(), ServiceError> {
        (**self).start(name)
    }

    fn stop(&self, name: &str) -> Result<(), ServiceError> {
        (**self).stop(name)
    }

    fn install_event_source(&self, name: &str) -> Result<(), ServiceError> {
        (**self).install_event_source(name)
    }

    fn remove_event_source(&self, name: &str) -> Result<(), ServiceError> {
        (**self).remove_event_source(name)
    }
}

/// Installs, starts, stops and removes the bridge service
pub struct ServiceController<M> {
    manager: M,
    poll_interval: Duration,
    state_timeout: Duration,
}

impl<M: ServiceManagerApi> ServiceController<M> {
    pub fn new(manager: M, config: &BridgeConfig) -> Self {
        Self {
            manager,
            poll_interval: config.poll_interval(),
            state_timeout: config.state_timeout(),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn status(&self, name: &str) -> Result<ServiceState, ServiceError> {
        self.manager.query(name)
    }

    /// Register the service and its event log source
    ///
    /// The registration is removed again if the event source cannot be
    /// created.
    pub fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        if self.manager.query(&spec.name)? != ServiceState::NotInstalled {
            return Err(ServiceError::AlreadyExists(spec.name.clone()));
        }

        info!("Installing service {}", spec.name);
        self.manager.create(spec)?;

        if let Err(e) = self.manager.install_event_source(&spec.name) {
            warn!("Event log source setup failed, removing service: {}", e);
            if let Err(rollback) = self.manager.delete(&spec.name) {
                warn!("Failed to remove service {}: {}", spec.name, rollback);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Remove any previous registration, install and start
    pub fn setup(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        self.uninstall(&spec.name)?;
        self.install(spec)?;
        self.start(&spec.name)
    }

    pub fn start(&self, name: &str) -> Result<(), ServiceError> {
        self.check_lock()?;

        match self.manager.query(name)? {
            ServiceState::NotInstalled => Err(ServiceError::NotInstalled(name.to_string())),
            ServiceState::Running => {
                debug!("Service {} already running", name);
                Ok(())
            }
            ServiceState::StartPending => self.wait_for(name, ServiceState::Running),
            ServiceState::Stopped | ServiceState::StopPending => {
                info!("Starting service {}", name);
                self.manager.start(name)?;
                self.wait_for(name, ServiceState::Running)
            }
        }
    }

    /// Stop the service, absent or stopped counts as done
    pub fn stop(&self, name: &str) -> Result<(), ServiceError> {
        self.check_lock()?;

        match self.manager.query(name)? {
            ServiceState::NotInstalled | ServiceState::Stopped => Ok(()),
            ServiceState::StopPending => self.wait_for(name, ServiceState::Stopped),
            state @ (ServiceState::Running | ServiceState::StartPending) => {
                // A starting service does not accept controls yet
                if state == ServiceState::StartPending {
                    self.wait_for(name, ServiceState::Running)?;
                }

                info!("Stopping service {}", name);
                self.manager.stop(name)?;
                self.wait_for(name, ServiceState::Stopped)
            }
        }
    }

    /// Stop and delete the service together with its event log source
    ///
    /// Removing a service that is not installed succeeds. A source left
    /// behind without its service is removed as well.
    pub fn uninstall(&self, name: &str) -> Result<(), ServiceError> {
        self.stop(name)?;

        match self.manager.delete(name) {
            Ok(()) => info!("Removed service {}", name),
            Err(ServiceError::NotInstalled(_)) => debug!("Service {} not installed", name),
            Err(e) => return Err(e),
        }

        self.manager.remove_event_source(name)
    }

    fn check_lock(&self) -> Result<(), ServiceError> {
        match self.manager.lock_owner()? {
            Some(owner) => Err(ServiceError::ManagerLocked { owner }),
            None => Ok(()),
        }
    }

    fn wait_for(&self, name: &str, expected: ServiceState) -> Result<(), ServiceError> {
        let deadline = Instant::now() + self.state_timeout;
        let mut state = self.manager.query(name)?;

        while state != expected {
            if Instant::now() >= deadline {
                return Err(ServiceError::Timeout {
                    name: name.to_string(),
                    expected,
                    last: state,
                });
            }
            thread::sleep(self.poll_interval);
            state = self.manager.query(name)?;
        }

        Ok(())
    }
}
