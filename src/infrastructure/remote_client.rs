use crate::domain::availability::WeeklyHours;
use crate::domain::models::{AvailabilityConfig, BlockedSlot, SlotKey, SlotOrigin, format_iso_date};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::slot_mapper::{
    RemoteBlockedSlot, RemoteWeeklyHours, decode_blocked_slots, decode_date_override,
    decode_weekly_hours, encode_availability_request, encode_block_request,
    encode_unblock_request,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use std::collections::BTreeSet;
use url::Url;

/// Remote persistence for availability and blocked slots, scoped by owner.
#[async_trait]
pub trait AvailabilityRemote: Send + Sync {
    async fn fetch_general_availability(&self, owner_id: &str) -> Result<WeeklyHours, InfraError>;

    /// `Ok(None)` when no override exists for `date`.
    async fn fetch_date_availability(
        &self,
        owner_id: &str,
        date: NaiveDate,
    ) -> Result<Option<BTreeSet<u8>>, InfraError>;

    async fn save_availability(
        &self,
        owner_id: &str,
        config: &AvailabilityConfig,
    ) -> Result<(), InfraError>;

    async fn fetch_blocked_slots(
        &self,
        owner_id: &str,
        date: Option<NaiveDate>,
    ) -> Result<Vec<BlockedSlot>, InfraError>;

    async fn block_slot(
        &self,
        owner_id: &str,
        date: NaiveDate,
        hour: u8,
        recurring: bool,
    ) -> Result<BlockedSlot, InfraError>;

    async fn unblock_slot(&self, owner_id: &str, date: NaiveDate, hour: u8) -> Result<(), InfraError>;

    async fn unblock_by_id(&self, id: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestAvailabilityRemote {
    client: Client,
    base_url: Url,
}

#[derive(Debug, serde::Deserialize)]
struct CreatedResource {
    #[serde(default, alias = "_id")]
    id: Option<String>,
}

impl ReqwestAvailabilityRemote {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::invalid_input(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            "empty response body".to_string()
        } else {
            format!("body={body}")
        };
        InfraError::Remote {
            status: status.as_u16(),
            message,
        }
    }

    fn network_error(action: &str, error: reqwest::Error) -> InfraError {
        InfraError::NetworkUnavailable(format!("network error while {action}: {error}"))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("remote base URL cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn owner_endpoint(&self, owner_id: &str, tail: &[&str]) -> Result<Url, InfraError> {
        Self::ensure_non_empty(owner_id, "owner id")?;
        let mut segments = vec!["owners", owner_id.trim()];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    async fn read_body(response: reqwest::Response, action: &str) -> Result<(StatusCode, String), InfraError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| Self::network_error(&format!("reading {action} response"), error))?;
        Ok((status, body))
    }
}

#[async_trait]
impl AvailabilityRemote for ReqwestAvailabilityRemote {
    async fn fetch_general_availability(&self, owner_id: &str) -> Result<WeeklyHours, InfraError> {
        let endpoint = self.owner_endpoint(owner_id, &["availability"])?;
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|error| Self::network_error("fetching availability", error))?;
        let (status, body) = Self::read_body(response, "availability").await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(WeeklyHours::new());
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(WeeklyHours::new());
        }

        let parsed: RemoteWeeklyHours = serde_json::from_str(&body)?;
        Ok(decode_weekly_hours(&parsed))
    }

    async fn fetch_date_availability(
        &self,
        owner_id: &str,
        date: NaiveDate,
    ) -> Result<Option<BTreeSet<u8>>, InfraError> {
        let endpoint = self.owner_endpoint(owner_id, &["availability"])?;
        let response = self
            .client
            .get(endpoint)
            .query(&[("date", format_iso_date(date))])
            .send()
            .await
            .map_err(|error| Self::network_error("fetching date availability", error))?;
        let (status, body) = Self::read_body(response, "date availability").await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }

        let parsed: RemoteWeeklyHours = serde_json::from_str(&body)?;
        Ok(decode_date_override(&parsed, date))
    }

    async fn save_availability(
        &self,
        owner_id: &str,
        config: &AvailabilityConfig,
    ) -> Result<(), InfraError> {
        let endpoint = self.owner_endpoint(owner_id, &["availability"])?;
        let response = self
            .client
            .post(endpoint)
            .json(&encode_availability_request(config))
            .send()
            .await
            .map_err(|error| Self::network_error("saving availability", error))?;
        let (status, body) = Self::read_body(response, "save availability").await?;

        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn fetch_blocked_slots(
        &self,
        owner_id: &str,
        date: Option<NaiveDate>,
    ) -> Result<Vec<BlockedSlot>, InfraError> {
        let endpoint = self.owner_endpoint(owner_id, &["blocked-slots"])?;
        let mut request = self.client.get(endpoint);
        if let Some(date) = date {
            request = request.query(&[("date", format_iso_date(date))]);
        }
        let response = request
            .send()
            .await
            .map_err(|error| Self::network_error("fetching blocked slots", error))?;
        let (status, body) = Self::read_body(response, "blocked slots").await?;

        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let parsed: Vec<RemoteBlockedSlot> = serde_json::from_str(&body)?;
        let (slots, skipped) = decode_blocked_slots(&parsed);
        if skipped > 0 {
            tracing::warn!(owner_id, skipped, "remote returned malformed blocked slots");
        }
        Ok(slots)
    }

    async fn block_slot(
        &self,
        owner_id: &str,
        date: NaiveDate,
        hour: u8,
        recurring: bool,
    ) -> Result<BlockedSlot, InfraError> {
        let endpoint = self.owner_endpoint(owner_id, &["blocked-slots", "block"])?;
        let response = self
            .client
            .post(endpoint)
            .json(&encode_block_request(date, hour, recurring))
            .send()
            .await
            .map_err(|error| Self::network_error("blocking slot", error))?;
        let (status, body) = Self::read_body(response, "block slot").await?;

        if status == StatusCode::CONFLICT {
            return Err(InfraError::conflict(SlotKey::new(date, hour)));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        let created: CreatedResource = serde_json::from_str(&body)?;
        let id = created
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                InfraError::Remote {
                    status: status.as_u16(),
                    message: "block response did not include id".to_string(),
                }
            })?;
        // Server assigns only the id.
        Ok(BlockedSlot::new(id, date, hour, recurring, SlotOrigin::ServerConfirmed))
    }

    async fn unblock_slot(&self, owner_id: &str, date: NaiveDate, hour: u8) -> Result<(), InfraError> {
        let endpoint = self.owner_endpoint(owner_id, &["blocked-slots", "unblock"])?;
        let response = self
            .client
            .post(endpoint)
            .json(&encode_unblock_request(date, hour))
            .send()
            .await
            .map_err(|error| Self::network_error("unblocking slot", error))?;
        let (status, body) = Self::read_body(response, "unblock slot").await?;

        if status == StatusCode::NOT_FOUND {
            return Err(InfraError::not_found(SlotKey::new(date, hour).to_string()));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn unblock_by_id(&self, id: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(id, "blocked slot id")?;
        let endpoint = self.endpoint(&["blocked-slots", id.trim(), "unblock"])?;
        let response = self
            .client
            .post(endpoint)
            .send()
            .await
            .map_err(|error| Self::network_error("unblocking slot by id", error))?;
        let (status, body) = Self::read_body(response, "unblock by id").await?;

        if status == StatusCode::NOT_FOUND {
            return Err(InfraError::not_found(format!("id {}", id.trim())));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }
}
