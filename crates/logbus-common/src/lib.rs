// Shared types used across the logbus crates.
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so subscriber identity never depends on object identity.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(SubscriberId);
    id_type!(ConnectionId);
}

const UNKNOWN_APPLICATION: &str = "<unknown source application>";

/// Process-level details stamped onto every published log event.
///
/// Built once at startup and handed to the components that need it; there is
/// no process-wide mutable instance.
///
/// ```
/// use logbus_common::LoggingParameters;
///
/// let params = LoggingParameters::new("billing").with_destination("hub.internal");
/// assert_eq!(params.application_name, "billing");
/// assert_eq!(params.destination.as_deref(), Some("hub.internal"));
/// assert_eq!(params.pid, std::process::id() as i32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingParameters {
    pub application_name: String,
    pub pid: i32,
    pub source_host: String,
    pub source_address: String,
    pub destination: Option<String>,
}

impl LoggingParameters {
    pub fn new(application_name: impl Into<String>) -> Self {
        let host = local_host_name();
        Self {
            application_name: application_name.into(),
            pid: std::process::id() as i32,
            source_address: host.clone(),
            source_host: host,
            destination: None,
        }
    }

    /// Read `LOGBUS_APPLICATION`, `LOGBUS_SOURCE_ADDRESS` and the host name from the environment.
    pub fn detect() -> Self {
        let application = std::env::var("LOGBUS_APPLICATION")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_APPLICATION.to_string());
        let mut params = Self::new(application);
        if let Ok(address) = std::env::var("LOGBUS_SOURCE_ADDRESS")
            && !address.trim().is_empty()
        {
            params.source_address = address;
        }
        params
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_source_host(mut self, host: impl Into<String>) -> Self {
        self.source_host = host.into();
        self
    }
}

impl Default for LoggingParameters {
    fn default() -> Self {
        Self::new(UNKNOWN_APPLICATION)
    }
}

fn local_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ids::SubscriberId;
    use std::str::FromStr;

    #[test]
    fn subscriber_id_round_trips_through_display() {
        let id = SubscriberId::new();
        let parsed = SubscriberId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn subscriber_id_rejects_garbage() {
        let err = SubscriberId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(value) if value == "not-a-uuid"));
    }

    #[test]
    fn default_parameters_use_current_process() {
        let params = LoggingParameters::default();
        assert_eq!(params.application_name, UNKNOWN_APPLICATION);
        assert_eq!(params.pid, std::process::id() as i32);
        assert!(params.destination.is_none());
    }

    #[test]
    #[serial_test::serial]
    fn detect_reads_application_from_env() {
        struct EnvGuard;

        impl Drop for EnvGuard {
            fn drop(&mut self) {
                unsafe {
                    std::env::remove_var("LOGBUS_APPLICATION");
                    std::env::remove_var("LOGBUS_SOURCE_ADDRESS");
                }
            }
        }

        let _env_guard = EnvGuard;
        unsafe {
            std::env::set_var("LOGBUS_APPLICATION", "orders");
            std::env::set_var("LOGBUS_SOURCE_ADDRESS", "10.0.0.7");
        }
        let params = LoggingParameters::detect();
        assert_eq!(params.application_name, "orders");
        assert_eq!(params.source_address, "10.0.0.7");
    }

    #[test]
    #[serial_test::serial]
    fn detect_falls_back_when_env_is_blank() {
        unsafe {
            std::env::set_var("LOGBUS_APPLICATION", "  ");
        }
        let params = LoggingParameters::detect();
        unsafe {
            std::env::remove_var("LOGBUS_APPLICATION");
        }
        assert_eq!(params.application_name, UNKNOWN_APPLICATION);
    }
}
