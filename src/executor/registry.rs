//! Mapping from (search category, service) to an executor.

use thiserror::Error;

use crate::config::service_for_host;
use crate::search::{SearchCategory, SearchResult};

use super::{Executor, MarketplaceSite, ReservationSite, TransferKind};

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No executor for category {category} and service {service:?}")]
    Unsupported {
        category: SearchCategory,
        service: Option<String>,
    },
}

/// Resolves executors.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorRegistry {
    allow_generic_fallback: bool,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self {
            allow_generic_fallback: true,
        }
    }
}

impl ExecutorRegistry {
    pub fn new(allow_generic_fallback: bool) -> Self {
        Self {
            allow_generic_fallback,
        }
    }

    pub fn resolve(&self, category: SearchCategory, service: Option<&str>) -> Result<Executor, RegistryError> {
        let executor = match (category, service) {
            (SearchCategory::Product, Some("amazon")) => Some(Executor::Marketplace(MarketplaceSite::Amazon)),
            (SearchCategory::Product, Some("rakuten")) => Some(Executor::Marketplace(MarketplaceSite::Rakuten)),
            (SearchCategory::Train, Some("ex_reservation") | None) => {
                Some(Executor::Reservation(ReservationSite::SmartEx))
            }
            (SearchCategory::Bus, Some("willer") | None) => Some(Executor::Reservation(ReservationSite::Willer)),
            (_, Some("bank_simulation")) => Some(Executor::Transfer(TransferKind::Simulation)),
            _ => None,
        };

        match executor {
            Some(executor) => Ok(executor),
            None if self.allow_generic_fallback => {
                tracing::debug!(%category, service = ?service, "falling back to generic executor");
                Ok(Executor::Generic)
            }
            None => Err(RegistryError::Unsupported {
                category,
                service: service.map(str::to_string),
            }),
        }
    }
}

/// Service a search result belongs to: the `service` detail if the search
/// provider set one, otherwise the service owning the URL host.
pub fn infer_service(result: &SearchResult) -> Option<String> {
    if let Some(service) = result.detail_str("service") {
        return Some(service.to_string());
    }
    result
        .host()
        .as_deref()
        .and_then(service_for_host)
        .map(str::to_string)
}
