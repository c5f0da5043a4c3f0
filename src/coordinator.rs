use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Local, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::assignment;
use crate::errors::AppError;
use crate::events::{Audience, Broadcaster, QueueAction, QueueEvent};
use crate::ids::TokenIdGenerator;
use crate::models::counter::Counter;
use crate::models::service::Service;
use crate::models::token::{
    CalledToken, NewToken, StatusChange, TokenFilter, TokenRecord, TokenSummary,
};
use crate::saga::Saga;
use crate::store::{MalformedEntry, Stores};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTokenRequest {
    pub service_id: Option<String>,
    /// Service display name (or id), matched case-insensitively.
    pub service: Option<String>,
    pub counter_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Called(CalledToken),
    /// The counter's queue was empty; nothing was changed.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkipOutcome {
    pub token: TokenRecord,
    /// Set when the ledger was updated but the queue entry could not be removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterView {
    #[serde(flatten)]
    pub counter: Counter,
    pub queue: Vec<TokenSummary>,
    pub current: Option<TokenRecord>,
}

/// Drives tokens through `pending → called → {served | skipped}` across the
/// ledger and the fast queue.
pub struct Coordinator {
    stores: Stores,
    ids: TokenIdGenerator,
    events: Arc<dyn Broadcaster>,
}

impl Coordinator {
    pub fn new(stores: Stores, events: Arc<dyn Broadcaster>) -> Self {
        let ids = TokenIdGenerator::new(stores.fast.clone(), stores.connection.clone());
        Self {
            stores,
            ids,
            events,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Issue a token for a service and queue it at the resolved counter.
    pub async fn create_token(&self, req: CreateTokenRequest) -> Result<TokenSummary, AppError> {
        let service = self.resolve_service(&req).await?;
        let counter = assignment::resolve_counter(
            self.stores.catalog.as_ref(),
            &service.service_id,
            req.counter_id,
        )
        .await?;

        let _gate = self.stores.queue_gate.read().await;
        self.ensure_connected()?;

        let issued = self.ids.issue(&service.service_id, Local::now()).await;
        // stamped after the sequence is drawn so arrival order follows it
        let new_token = NewToken {
            token_id: issued.token_id,
            display_number: issued.display_number,
            service_id: service.service_id.clone(),
            assigned_counter_id: counter.counter_id,
            generation_timestamp: Utc::now(),
        };

        let ledger = self.stores.ledger.clone();
        let mut saga = Saga::new("create_token");
        let record = saga
            .step(
                "ledger_insert",
                async {
                    self.stores
                        .ledger
                        .insert_token(&new_token)
                        .await
                        .map_err(AppError::Ledger)
                },
                move |record: &TokenRecord| {
                    let token_id = record.token_id.clone();
                    async move {
                        ledger
                            .delete_token(&token_id)
                            .await
                            .map(|_| ())
                            .map_err(AppError::Ledger)
                    }
                    .boxed()
                },
            )
            .await?;

        let summary = TokenSummary::from_record(&record, &service.name, &counter.name);
        saga.finish("enqueue", async {
            self.stores
                .fast
                .push(counter.counter_id, &summary)
                .await
                .map_err(AppError::QueueUnavailable)
        })
        .await?;

        tracing::info!(
            token_id = %summary.token_id,
            display_number = %summary.display_number,
            counter_id = counter.counter_id,
            degraded_id = issued.counter.degraded,
            "token created"
        );

        self.events.publish(
            Audience::Admin,
            &QueueEvent::TokenGenerated {
                token: summary.clone(),
                timestamp: Utc::now(),
            },
        );

        Ok(summary)
    }

    /// Dequeue the head of a counter's queue and mark it called.
    pub async fn call_next(&self, counter_id: i32) -> Result<CallOutcome, AppError> {
        let counter = self.open_counter(counter_id).await?;

        let _gate = self.stores.queue_gate.read().await;
        self.ensure_connected()?;

        let fast = self.stores.fast.clone();
        let mut saga = Saga::new("call_next");
        let head = saga
            .step(
                "dequeue",
                async {
                    self.stores
                        .fast
                        .pop(counter_id)
                        .await
                        .map_err(|e| dequeue_error(counter_id, e))
                },
                move |head: &Option<TokenSummary>| {
                    let head = head.clone();
                    async move {
                        match head {
                            Some(entry) => fast
                                .push_front(counter_id, &entry)
                                .await
                                .map_err(AppError::QueueUnavailable),
                            None => Ok(()),
                        }
                    }
                    .boxed()
                },
            )
            .await?;

        let Some(entry) = head else {
            saga.commit();
            tracing::debug!(counter_id, "no tokens in queue");
            return Ok(CallOutcome::Empty);
        };

        let change = StatusChange::Call {
            counter_id,
            at: Utc::now(),
        };
        let updated = saga
            .finish("ledger_mark_called", async {
                self.stores
                    .ledger
                    .apply(&entry.token_id, &change)
                    .await
                    .map_err(AppError::Ledger)
            })
            .await?;

        let Some(record) = updated else {
            return Err(self.orphaned_entry(counter_id, &entry).await);
        };

        let called = CalledToken {
            summary: TokenSummary {
                counter_id,
                counter_name: counter.name.clone(),
                ..entry
            },
            status: record.status,
            called_timestamp: record.called_timestamp.unwrap_or_else(|| change.at()),
        };

        tracing::info!(token_id = %record.token_id, counter_id, "token called");
        self.announce_called(&counter, &called);

        Ok(CallOutcome::Called(called))
    }

    /// `called → served`. No queue interaction.
    pub async fn serve(&self, token_id: &str) -> Result<TokenRecord, AppError> {
        let record = self
            .transition(token_id, StatusChange::Serve { at: Utc::now() })
            .await?;

        tracing::info!(token_id = %record.token_id, counter_id = record.assigned_counter_id, "token served");
        self.events.publish(
            Audience::Admin,
            &QueueEvent::QueueUpdate {
                counter_id: record.assigned_counter_id,
                token_id: record.token_id.clone(),
                action: QueueAction::Served,
            },
        );

        Ok(record)
    }

    /// `pending | called → skipped`, then drop the token from its counter's queue.
    ///
    /// The ledger is authoritative: when the queue entry cannot be removed the
    /// skip still stands and the outcome carries a warning. The next resync
    /// rebuilds the queue without it.
    pub async fn skip(&self, token_id: &str) -> Result<SkipOutcome, AppError> {
        let _gate = self.stores.queue_gate.read().await;

        let record = self
            .transition(token_id, StatusChange::Skip { at: Utc::now() })
            .await?;
        let counter_id = record.assigned_counter_id;

        let warning = if !self.stores.connection.is_connected() {
            tracing::error!(token_id, counter_id, "fast store disconnected; skipped token left in queue");
            Some(format!(
                "token skipped, but counter {} queue could not be updated; it will be rebuilt on reconnect",
                counter_id
            ))
        } else {
            match self.stores.fast.remove(counter_id, &record.token_id).await {
                Ok(removed) => {
                    tracing::debug!(token_id, counter_id, removed, "removed skipped token from queue");
                    None
                }
                Err(e) => {
                    tracing::error!(token_id, counter_id, error = %e, "failed to remove skipped token from queue");
                    Some(format!(
                        "token skipped, but counter {} queue could not be updated: {:#}",
                        counter_id, e
                    ))
                }
            }
        };

        tracing::info!(token_id, counter_id, skip_count = record.skip_count, "token skipped");
        self.events.publish(
            Audience::Admin,
            &QueueEvent::QueueUpdate {
                counter_id,
                token_id: record.token_id.clone(),
                action: QueueAction::Skipped,
            },
        );

        Ok(SkipOutcome {
            token: record,
            warning,
        })
    }

    /// Re-announce a skipped or called token at an open counter.
    pub async fn recall(&self, token_id: &str, counter_id: i32) -> Result<CalledToken, AppError> {
        let counter = self.open_counter(counter_id).await?;

        let record = self
            .transition(
                token_id,
                StatusChange::Recall {
                    counter_id,
                    at: Utc::now(),
                },
            )
            .await?;

        let service_name = match self.stores.catalog.get_service(&record.service_id).await {
            Ok(Some(service)) => service.name,
            Ok(None) => record.service_id.clone(),
            Err(e) => {
                tracing::warn!(service_id = %record.service_id, error = %e, "service lookup failed");
                record.service_id.clone()
            }
        };

        let called = CalledToken {
            summary: TokenSummary::from_record(&record, &service_name, &counter.name),
            status: record.status,
            called_timestamp: record.called_timestamp.unwrap_or(record.updated_at),
        };

        tracing::info!(token_id, counter_id, "token recalled");
        self.announce_called(&counter, &called);

        Ok(called)
    }

    pub async fn get_token(&self, token_id: &str) -> Result<TokenRecord, AppError> {
        let token_id = require_token_id(token_id)?;
        self.stores
            .ledger
            .get_token(token_id)
            .await
            .map_err(AppError::Ledger)?
            .ok_or_else(|| AppError::TokenNotFound(token_id.to_string()))
    }

    pub async fn list_tokens(&self, mut filter: TokenFilter) -> Result<Vec<TokenRecord>, AppError> {
        if filter.limit <= 0 {
            filter.limit = TokenFilter::DEFAULT_LIMIT;
        }
        filter.limit = filter.limit.min(TokenFilter::MAX_LIMIT);
        self.stores
            .ledger
            .list_tokens(&filter)
            .await
            .map_err(AppError::Ledger)
    }

    /// Every counter with its waiting queue and the token it is serving.
    pub async fn counters_overview(&self) -> Result<Vec<CounterView>, AppError> {
        let counters = self
            .stores
            .catalog
            .list_counters()
            .await
            .map_err(AppError::Catalog)?;

        let connected = self.stores.connection.is_connected();
        let mut views = Vec::with_capacity(counters.len());
        for counter in counters {
            let queue = if connected {
                match self.stores.fast.entries(counter.counter_id).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!(counter_id = counter.counter_id, error = %e, "could not read queue");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            let current = self
                .stores
                .ledger
                .current_called(counter.counter_id)
                .await
                .map_err(AppError::Ledger)?;
            views.push(CounterView {
                counter,
                queue,
                current,
            });
        }
        Ok(views)
    }

    /// Services offered at the kiosk.
    pub async fn active_services(&self) -> Result<Vec<Service>, AppError> {
        let services = self
            .stores
            .catalog
            .list_services()
            .await
            .map_err(AppError::Catalog)?;
        Ok(services.into_iter().filter(|s| s.is_active).collect())
    }

    async fn resolve_service(&self, req: &CreateTokenRequest) -> Result<Service, AppError> {
        let service_id = non_blank(req.service_id.as_deref());
        let name = non_blank(req.service.as_deref());

        let service = match (service_id, name) {
            (Some(id), _) => self
                .stores
                .catalog
                .get_service(id)
                .await
                .map_err(AppError::Catalog)?
                .ok_or_else(|| AppError::ServiceNotFound(id.to_string()))?,
            (None, Some(name)) => self
                .stores
                .catalog
                .list_services()
                .await
                .map_err(AppError::Catalog)?
                .into_iter()
                .filter(|s| s.identified_by(name))
                // an active match wins over an inactive one with the same name
                .max_by_key(|s| s.is_active)
                .ok_or_else(|| AppError::ServiceNotFound(name.to_string()))?,
            (None, None) => {
                return Err(AppError::Validation(
                    "one of service_id or service is required".into(),
                ))
            }
        };

        if !service.is_active {
            return Err(AppError::ServiceInactive(service.service_id));
        }
        Ok(service)
    }

    async fn open_counter(&self, counter_id: i32) -> Result<Counter, AppError> {
        let counter = self
            .stores
            .catalog
            .get_counter(counter_id)
            .await
            .map_err(AppError::Catalog)?
            .ok_or(AppError::CounterNotFound(counter_id))?;
        if !counter.is_open {
            return Err(AppError::CounterClosed(counter_id));
        }
        Ok(counter)
    }

    fn ensure_connected(&self) -> Result<(), AppError> {
        if self.stores.connection.is_connected() {
            Ok(())
        } else {
            Err(AppError::QueueUnavailable(anyhow!("fast store is disconnected")))
        }
    }

    /// Apply a conditional ledger change, classifying a refusal as
    /// `TokenNotFound` or `InvalidTransition`.
    async fn transition(&self, token_id: &str, change: StatusChange) -> Result<TokenRecord, AppError> {
        let token_id = require_token_id(token_id)?;
        let ledger = &self.stores.ledger;

        if let Some(record) = ledger.apply(token_id, &change).await.map_err(AppError::Ledger)? {
            return Ok(record);
        }

        match ledger.get_token(token_id).await.map_err(AppError::Ledger)? {
            None => Err(AppError::TokenNotFound(token_id.to_string())),
            Some(current) => Err(AppError::InvalidTransition {
                token_id: token_id.to_string(),
                from: current.status,
                to: change.target(),
            }),
        }
    }

    /// A popped queue entry the ledger would not mark called. The entry is
    /// dropped rather than restored.
    async fn orphaned_entry(&self, counter_id: i32, entry: &TokenSummary) -> AppError {
        let detail = match self.stores.ledger.get_token(&entry.token_id).await {
            Ok(None) => "queued but missing from the ledger".to_string(),
            Ok(Some(record)) => format!("queued but ledger status is {}", record.status),
            Err(e) => format!("queued but ledger lookup failed: {:#}", e),
        };
        tracing::error!(
            token_id = %entry.token_id,
            counter_id,
            detail = %detail,
            "queue entry does not match ledger, discarding it"
        );
        AppError::DataInconsistency {
            token_id: entry.token_id.clone(),
            detail,
        }
    }

    fn announce_called(&self, counter: &Counter, called: &CalledToken) {
        let now = Utc::now();
        self.events.publish(
            Audience::Kiosk,
            &QueueEvent::TokenCalled {
                counter_id: counter.counter_id,
                counter_name: counter.name.clone(),
                token: called.clone(),
                timestamp: now,
            },
        );
        self.events.publish(
            Audience::Admin,
            &QueueEvent::QueueUpdate {
                counter_id: counter.counter_id,
                token_id: called.summary.token_id.clone(),
                action: QueueAction::Called,
            },
        );
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn require_token_id(token_id: &str) -> Result<&str, AppError> {
    let token_id = token_id.trim();
    if token_id.is_empty() {
        return Err(AppError::Validation("token id is required".into()));
    }
    Ok(token_id)
}

/// A popped entry that cannot be decoded is already gone from the queue, so
/// it is reported like an orphan rather than as an outage.
fn dequeue_error(counter_id: i32, e: anyhow::Error) -> AppError {
    match e.downcast::<MalformedEntry>() {
        Ok(bad) => {
            tracing::error!(
                counter_id,
                raw = %bad.raw,
                "undecodable queue entry popped, discarding it"
            );
            AppError::DataInconsistency {
                token_id: String::new(),
                detail: bad.to_string(),
            }
        }
        Err(e) => AppError::QueueUnavailable(e),
    }
}
