//! Link-local service advertisement.
//!
//! The host publishes one DNS-SD record so headsets on the same link can
//! find it without manual configuration. Advertisement failure is not
//! fatal; a client that already knows the endpoint can still connect.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::net::IpAddr;
use std::sync::Mutex;
use thiserror::Error;

/// Service type clients browse for.
pub const SERVICE_TYPE: &str = "_apple-foveated-streaming._tcp.local.";
/// TXT key carrying the application bundle identifier.
pub const TXT_APPLICATION_IDENTIFIER: &str = "Application-Identifier";

#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub instance: String,
    pub service_type: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<(String, String)>,
}

impl ServiceRegistration {
    pub fn new(instance: String, port: u16, addresses: Vec<IpAddr>, bundle_id: &str) -> Self {
        Self {
            instance,
            service_type: SERVICE_TYPE.to_string(),
            port,
            addresses,
            txt: vec![(TXT_APPLICATION_IDENTIFIER.to_string(), bundle_id.to_string())],
        }
    }
}

#[derive(Debug, Error)]
pub enum AdvertiseError {
    #[error("mdns daemon unavailable: {0}")]
    Daemon(String),
    #[error("failed to publish record: {0}")]
    Publish(String),
}

pub trait ServiceAdvertiser: Send + Sync {
    fn advertise(&self, registration: &ServiceRegistration) -> Result<(), AdvertiseError>;
    fn close(&self);
}

/// The instance name defaults to the local hostname, matching what the
/// client shows in its target picker.
pub fn local_instance_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "pier-host".to_string())
}

struct Registered {
    daemon: ServiceDaemon,
    fullname: String,
}

pub struct MdnsAdvertiser {
    registered: Mutex<Option<Registered>>,
}

impl MdnsAdvertiser {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(None),
        }
    }
}

impl Default for MdnsAdvertiser {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn advertise(&self, registration: &ServiceRegistration) -> Result<(), AdvertiseError> {
        let daemon =
            ServiceDaemon::new().map_err(|err| AdvertiseError::Daemon(err.to_string()))?;

        let host = format!("{}.local.", registration.instance);
        let properties: Vec<(&str, &str)> = registration
            .txt
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        // An unspecified bind address means "all interfaces"; let the
        // daemon enumerate them instead of publishing 0.0.0.0.
        let concrete: Vec<IpAddr> = registration
            .addresses
            .iter()
            .copied()
            .filter(|addr| !addr.is_unspecified())
            .collect();
        let mut info = ServiceInfo::new(
            &registration.service_type,
            &registration.instance,
            &host,
            &concrete[..],
            registration.port,
            &properties[..],
        )
        .map_err(|err| AdvertiseError::Publish(err.to_string()))?;
        if concrete.is_empty() {
            info = info.enable_addr_auto();
        }
        let fullname = info.get_fullname().to_string();

        daemon
            .register(info)
            .map_err(|err| AdvertiseError::Publish(err.to_string()))?;

        tracing::info!(
            instance = %registration.instance,
            service_type = %registration.service_type,
            port = registration.port,
            "published service record"
        );

        let mut guard = self.registered.lock().expect("advertiser lock poisoned");
        *guard = Some(Registered { daemon, fullname });
        Ok(())
    }

    fn close(&self) {
        let taken = self
            .registered
            .lock()
            .expect("advertiser lock poisoned")
            .take();
        if let Some(registered) = taken {
            if let Err(err) = registered.daemon.unregister(&registered.fullname) {
                tracing::debug!(error = %err, "unregister on close failed");
            }
            let _ = registered.daemon.shutdown();
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.close();
    }
}
