use std::fmt;

use super::BrokerError;
use crate::config::ConfigError;

/// The operation an entity id is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    RequestGeneration,
    ResponseTranslation,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::RequestGeneration => f.write_str("request generation"),
            Purpose::ResponseTranslation => f.write_str("response translation"),
        }
    }
}

/// The validated set of service entity ids the broker may act for.
///
/// Non-empty, ordered by configuration, and free of duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdScope {
    configured_ids: Vec<String>,
}

impl EntityIdScope {
    /// Build the scope from the two mutually exclusive configuration sources.
    ///
    /// A blank single id and an empty list both count as not configured.
    pub fn from_config(
        single: Option<&str>,
        list: Option<&[String]>,
    ) -> Result<Self, ConfigError> {
        let single = single.filter(|id| !id.trim().is_empty());
        let list = list.filter(|ids| !ids.is_empty());

        match (single, list) {
            (Some(_), Some(_)) => Err(ConfigError::EntityIdConfiguration(
                "service_entity_id and service_entity_ids are mutually exclusive".into(),
            )),
            (None, None) => Err(ConfigError::EntityIdConfiguration(
                "one of service_entity_id or service_entity_ids must be configured".into(),
            )),
            (Some(id), None) => Ok(Self {
                configured_ids: vec![id.to_string()],
            }),
            (None, Some(ids)) => Self::from_list(ids),
        }
    }

    fn from_list(ids: &[String]) -> Result<Self, ConfigError> {
        let mut configured_ids: Vec<String> = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            if id.trim().is_empty() {
                return Err(ConfigError::EntityIdConfiguration(format!(
                    "service_entity_ids[{index}] is blank"
                )));
            }
            if configured_ids.contains(id) {
                tracing::warn!(entity_id = %id, "Ignoring duplicate entry in service_entity_ids");
                continue;
            }
            configured_ids.push(id.clone());
        }
        Ok(Self { configured_ids })
    }

    pub fn configured_ids(&self) -> &[String] {
        &self.configured_ids
    }

    /// Resolve the entity id to use for one call.
    ///
    /// A provided id must be a member of the scope. Without one, the sole
    /// configured id is used; a scope of several ids requires the caller to
    /// choose.
    pub fn resolve(&self, provided: Option<&str>, purpose: Purpose) -> Result<String, BrokerError> {
        match provided {
            Some(id) if self.configured_ids.iter().any(|configured| configured == id) => {
                tracing::info!(entity_id = %id, %purpose, "Using explicitly provided entity id");
                Ok(id.to_string())
            }
            Some(id) => {
                tracing::warn!(entity_id = %id, %purpose, "Rejected entity id outside configured scope");
                Err(BrokerError::InvalidEntityId(format!(
                    "'{id}' is not a configured service entity id"
                )))
            }
            None => match self.configured_ids.as_slice() {
                [only] => {
                    tracing::info!(entity_id = %only, %purpose, "Using default entity id");
                    Ok(only.clone())
                }
                _ => Err(BrokerError::InvalidEntityId(
                    "an explicit entity id is required when several are configured".into(),
                )),
            },
        }
    }
}
