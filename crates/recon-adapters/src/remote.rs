use async_trait::async_trait;
use chrono::{Months, NaiveDate, Utc};
use recon_core::{RawRow, RawValue};
use recon_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::{AdapterError, FeedBatch, RawPayload, RowSource};

/// Remote column name to booking field name. Columns not listed here are
/// discarded.
pub fn booking_column_renames() -> &'static [(&'static str, &'static str)] {
    &[
        ("rva", "file"),
        ("estadoope", "status"),
        ("monedalocal", "currency"),
        ("Fec_in", "date_in"),
        ("Fec_out", "date_out"),
        ("fec_sal", "departure_date"),
        ("fec_vencop", "supplier_payment_date"),
        ("Descrip", "passenger"),
        ("saldo", "amount"),
        ("nombre", "provider"),
        ("ciudad", "airport_code"),
    ]
}

#[derive(Debug, Clone)]
pub struct RemoteFeedConfig {
    pub url: String,
    /// Session cookie from an authenticated login.
    pub cookie: Option<String>,
    pub page_size: usize,
    /// Width of the booking-date window starting today.
    pub window_months: u32,
}

pub struct RemoteBookingSource {
    feed_id: String,
    config: RemoteFeedConfig,
    http: HttpFetcher,
}

impl RemoteBookingSource {
    pub fn new(feed_id: impl Into<String>, config: RemoteFeedConfig, http: HttpFetcher) -> Self {
        Self {
            feed_id: feed_id.into(),
            config,
            http,
        }
    }

    pub fn page_request(&self, skip: usize, today: NaiveDate) -> JsonValue {
        let until = today
            .checked_add_months(Months::new(self.config.window_months))
            .unwrap_or(NaiveDate::MAX);
        json!({
            "Take": self.config.page_size,
            "Skip": skip,
            "EqualityFilter": {},
            "cod_oper": null,
            "cod_vdor": null,
            "tiposaldo": "",
            "tipocc": null,
            "moneda": "",
            "estadoRva": "",
            "fec_Compdesde": today.format("%Y/%m/%d").to_string(),
            "fec_CompHasta": until.format("%Y/%m/%d").to_string(),
        })
    }
}

/// Projects one remote entity onto booking columns.
fn entity_to_row(entity: &JsonValue) -> RawRow {
    booking_column_renames()
        .iter()
        .map(|(remote, field)| {
            let value = entity.get(*remote).cloned().map(RawValue::from).unwrap_or_default();
            (*field, value)
        })
        .collect()
}

fn page_entities(page: &JsonValue) -> &[JsonValue] {
    page.get("Entities")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[async_trait]
impl RowSource for RemoteBookingSource {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    fn describe(&self) -> String {
        format!("remote:{}", self.config.url)
    }

    async fn fetch(&self) -> Result<FeedBatch, AdapterError> {
        let fetched_at = Utc::now();
        let today = fetched_at.date_naive();
        let page_size = self.config.page_size.max(1);

        let mut rows = Vec::new();
        let mut pages = Vec::new();
        let mut skip = 0;
        loop {
            let request = self.page_request(skip, today);
            let response = self
                .http
                .post_json(&self.feed_id, &self.config.url, &request, self.config.cookie.as_deref())
                .await?;
            let entities = page_entities(&response.json);
            if entities.is_empty() {
                break;
            }
            rows.extend(entities.iter().map(entity_to_row));
            info!(
                feed_id = %self.feed_id,
                page_rows = entities.len(),
                total = rows.len(),
                "fetched remote page"
            );
            pages.push(response.json);
            skip += page_size;
        }

        let bytes = serde_json::to_vec(&pages).map_err(|err| AdapterError::Malformed {
            origin: self.config.url.clone(),
            message: err.to_string(),
        })?;
        Ok(FeedBatch {
            feed_id: self.feed_id.clone(),
            fetched_at,
            origin: self.config.url.clone(),
            rows,
            raw_payload: Some(RawPayload {
                extension: "json",
                bytes,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_storage::HttpClientConfig;

    fn source() -> RemoteBookingSource {
        RemoteBookingSource::new(
            "bookings",
            RemoteFeedConfig {
                url: "http://127.0.0.1:9/List".into(),
                cookie: None,
                page_size: 500,
                window_months: 20,
            },
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
        )
    }

    #[test]
    fn page_request_carries_paging_and_date_window() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        let body = source().page_request(1000, today);
        assert_eq!(body["Take"], 500);
        assert_eq!(body["Skip"], 1000);
        assert_eq!(body["fec_Compdesde"], "2026/01/31");
        assert_eq!(body["fec_CompHasta"], "2027/09/30");
    }

    #[test]
    fn entities_are_renamed_and_projected() {
        let entity = json!({
            "rva": "AB1234",
            "saldo": 100.0,
            "nombre": "acme",
            "ciudad": "jfk",
            "internal": "dropped"
        });
        let row = entity_to_row(&entity);
        assert_eq!(row.get("file"), Some(&RawValue::text("AB1234")));
        assert_eq!(row.get("amount"), Some(&RawValue::Number(100.0)));
        assert_eq!(row.get("airport_code"), Some(&RawValue::text("jfk")));
        assert_eq!(row.get("status"), Some(&RawValue::Null));
        assert!(row.get("internal").is_none());
        assert_eq!(row.len(), booking_column_renames().len());
    }

    #[test]
    fn missing_entities_read_as_last_page() {
        assert!(page_entities(&json!({"TotalCount": 0})).is_empty());
        assert_eq!(page_entities(&json!({"Entities": [{"rva": "X"}]})).len(), 1);
    }
}
