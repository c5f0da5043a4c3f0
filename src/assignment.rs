use crate::errors::AppError;
use crate::models::counter::Counter;
use crate::store::Catalog;

/// Pick the counter a new token for `service_id` is routed to.
///
/// An explicit counter must exist and support the service (it may be closed;
/// the token then waits in its queue). Otherwise the lowest-numbered open
/// counter supporting the service wins.
pub async fn resolve_counter(
    catalog: &dyn Catalog,
    service_id: &str,
    explicit_counter_id: Option<i32>,
) -> Result<Counter, AppError> {
    if let Some(counter_id) = explicit_counter_id {
        let counter = catalog
            .get_counter(counter_id)
            .await
            .map_err(AppError::Catalog)?
            .ok_or(AppError::CounterNotFound(counter_id))?;
        if !counter.supports(service_id) {
            return Err(AppError::CapabilityMismatch {
                counter_id,
                service_id: service_id.to_string(),
            });
        }
        return Ok(counter);
    }

    let counters = catalog.list_counters().await.map_err(AppError::Catalog)?;
    select_counter(&counters, service_id)
        .cloned()
        .ok_or_else(|| AppError::NoAvailableCounter(service_id.to_string()))
}

/// First open counter supporting `service_id`, by ascending id regardless of
/// input order.
pub fn select_counter<'a>(counters: &'a [Counter], service_id: &str) -> Option<&'a Counter> {
    counters
        .iter()
        .filter(|c| c.is_open && c.supports(service_id))
        .min_by_key(|c| c.counter_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCatalog;

    fn counter(id: i32, services: &[&str], open: bool) -> Counter {
        Counter {
            counter_id: id,
            name: format!("Counter {}", id),
            supported_service_ids: services.iter().map(|s| s.to_string()).collect(),
            is_open: open,
            operator_name: None,
        }
    }

    #[test]
    fn test_select_lowest_open_supporting() {
        let counters = vec![
            counter(3, &["DEP"], true),
            counter(1, &["DEP"], false),
            counter(2, &["DEP", "WDL"], true),
        ];
        assert_eq!(select_counter(&counters, "DEP").unwrap().counter_id, 2);
        assert_eq!(select_counter(&counters, "WDL").unwrap().counter_id, 2);
        assert!(select_counter(&counters, "LOAN").is_none());
    }

    #[tokio::test]
    async fn test_explicit_counter_must_support_service() {
        let catalog = MemoryCatalog::new().with_counter(1, "Counter 1", &["DEP"], true);
        let err = resolve_counter(&catalog, "WDL", Some(1)).await.unwrap_err();
        assert!(matches!(err, AppError::CapabilityMismatch { counter_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_explicit_missing_counter() {
        let catalog = MemoryCatalog::new();
        let err = resolve_counter(&catalog, "DEP", Some(9)).await.unwrap_err();
        assert!(matches!(err, AppError::CounterNotFound(9)));
    }

    #[tokio::test]
    async fn test_explicit_closed_counter_is_accepted() {
        let catalog = MemoryCatalog::new().with_counter(4, "Counter 4", &["DEP"], false);
        let counter = resolve_counter(&catalog, "DEP", Some(4)).await.unwrap();
        assert_eq!(counter.counter_id, 4);
    }

    #[tokio::test]
    async fn test_no_open_counter() {
        let catalog = MemoryCatalog::new().with_counter(1, "Counter 1", &["WDL"], false);
        let err = resolve_counter(&catalog, "WDL", None).await.unwrap_err();
        assert!(matches!(err, AppError::NoAvailableCounter(ref s) if s == "WDL"));
    }
}
