use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, header};
use serde_json::json;
use tracing::{debug, warn};

use super::models::{
    AdminLogEntry, AdminMessage, GrantRequest, NewAdminMessage, RawAdminMessage,
    SubscriptionRecord, SubscriptionStatus, parse_rows,
};
use super::{StoreError, SubscriptionStore};
use crate::config::TrackerConfig;

const ADMIN_LOGS_TABLE: &str = "admin_logs";
const ADMIN_MESSAGES_TABLE: &str = "admin_messages";

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// PostgREST client for the hosted subscription table.
#[derive(Clone)]
pub struct RestSubscriptionStore {
    client: Client,
    base_url: String,
    api_key: String,
    bearer: String,
    table: String,
}

impl RestSubscriptionStore {
    pub fn new(config: &TrackerConfig) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &TrackerConfig) -> Self {
        Self {
            client,
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            api_key: config.supabase_key.clone(),
            bearer: config.bearer_token().to_string(),
            table: config.subscriptions_table.clone(),
        }
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.bearer))
            .header(header::ACCEPT, "application/json")
    }

    pub(crate) fn fetch_active_request(&self, user_id: &str, now: DateTime<Utc>) -> RequestBuilder {
        self.request(Method::GET, &self.table).query(&[
            ("select", "*".to_string()),
            ("user_id", format!("eq.{user_id}")),
            ("status", format!("eq.{}", SubscriptionStatus::Active.as_str())),
            ("end_time", format!("gt.{}", ts(now))),
            ("order", "end_time.desc".to_string()),
            ("limit", "1".to_string()),
        ])
    }

    fn by_id_request(&self, method: Method, subscription_id: &str) -> RequestBuilder {
        self.request(method, &self.table)
            .query(&[("id", format!("eq.{subscription_id}"))])
    }

    pub(crate) fn count_active_request(&self, now: DateTime<Utc>) -> RequestBuilder {
        self.request(Method::GET, &self.table)
            .query(&[
                ("select", "id".to_string()),
                ("status", format!("eq.{}", SubscriptionStatus::Active.as_str())),
                ("end_time", format!("gt.{}", ts(now))),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact")
    }

    pub(crate) fn unread_messages_request(&self, user_id: &str) -> RequestBuilder {
        self.request(Method::GET, ADMIN_MESSAGES_TABLE).query(&[
            ("select", "*".to_string()),
            ("is_read", "eq.false".to_string()),
            (
                "or",
                format!(
                    "(receiver_id.eq.{},receiver_id.is.null)",
                    quote_filter_value(user_id)
                ),
            ),
            ("order", "created_at.desc".to_string()),
        ])
    }

    /// Sends the request and returns the body of a 2xx response.
    async fn send_checked(&self, builder: RequestBuilder) -> Result<(String, header::HeaderMap), StoreError> {
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), body = %body, "Subscription store returned an error.");
            return Err(StoreError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok((body, headers))
    }

    async fn fetch_rows(&self, builder: RequestBuilder) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let (body, _) = self.send_checked(builder).await?;
        parse_rows(&body)
    }

    async fn single_row(
        &self,
        builder: RequestBuilder,
        subscription_id: &str,
    ) -> Result<SubscriptionRecord, StoreError> {
        self.fetch_rows(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("subscription {subscription_id}")))
    }
}

/// Double-quotes a value for use inside a PostgREST logical filter such as
/// `or=(...)`, where `,` `.` `(` and `)` are otherwise syntax.
pub(crate) fn quote_filter_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Extracts the total from a `Content-Range` header such as `0-0/42` or `*/0`.
pub(crate) fn parse_content_range_total(value: &str) -> Result<u64, StoreError> {
    value
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            StoreError::MalformedResponse(format!("unexpected Content-Range header '{value}'"))
        })
}

#[async_trait]
impl SubscriptionStore for RestSubscriptionStore {
    async fn fetch_active(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let rows = self.fetch_rows(self.fetch_active_request(user_id, now)).await?;
        debug!(user_id = %user_id, rows = rows.len(), "Fetched active subscription rows.");
        Ok(rows.into_iter().next())
    }

    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let builder = self
            .request(Method::GET, &self.table)
            .query(&[("select", "*"), ("order", "end_time.desc")]);
        self.fetch_rows(builder).await
    }

    async fn grant(
        &self,
        request: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        if request.user_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("user_id must not be empty".to_string()));
        }
        let mut body = json!({
            "user_id": request.user_id,
            "start_time": ts(now),
            "end_time": ts(now + request.duration),
            "status": SubscriptionStatus::Active.as_str(),
            "activated_by_admin": request.activated_by_admin,
        });
        if let Some(plan_type) = &request.plan_type {
            body["plan_type"] = json!(plan_type);
        }
        let builder = self
            .request(Method::POST, &self.table)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&body);
        self.fetch_rows(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::MalformedResponse("grant returned no row".to_string()))
    }

    async fn extend(
        &self,
        subscription_id: &str,
        by: Duration,
    ) -> Result<SubscriptionRecord, StoreError> {
        // Read-modify-write; concurrent admin edits are last-write-wins.
        let current = self
            .single_row(
                self.by_id_request(Method::GET, subscription_id)
                    .query(&[("select", "*")]),
                subscription_id,
            )
            .await?;
        let builder = self
            .by_id_request(Method::PATCH, subscription_id)
            .header("Prefer", "return=representation")
            .json(&json!({
                "end_time": ts(current.end_time + by),
                "status": SubscriptionStatus::Active.as_str(),
            }));
        self.single_row(builder, subscription_id).await
    }

    async fn cancel(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let builder = self
            .by_id_request(Method::PATCH, subscription_id)
            .header("Prefer", "return=representation")
            .json(&json!({
                "status": SubscriptionStatus::Expired.as_str(),
                "end_time": ts(now),
            }));
        self.single_row(builder, subscription_id).await
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let (_, headers) = self.send_checked(self.count_active_request(now)).await?;
        let range = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                StoreError::MalformedResponse("count response has no Content-Range".to_string())
            })?;
        parse_content_range_total(range)
    }

    async fn record_admin_action(&self, entry: &AdminLogEntry) -> Result<(), StoreError> {
        let builder = self
            .request(Method::POST, ADMIN_LOGS_TABLE)
            .header("Prefer", "return=minimal")
            .json(entry);
        self.send_checked(builder).await?;
        Ok(())
    }

    async fn insert_message(&self, message: &NewAdminMessage) -> Result<AdminMessage, StoreError> {
        let builder = self
            .request(Method::POST, ADMIN_MESSAGES_TABLE)
            .header("Prefer", "return=representation")
            .json(&json!({
                "sender_id": message.sender_id,
                "receiver_id": message.receiver_id,
                "message": message.message,
                "is_read": false,
            }));
        let (body, _) = self.send_checked(builder).await?;
        let rows: Vec<RawAdminMessage> = serde_json::from_str(&body).map_err(|e| {
            StoreError::MalformedResponse(format!("expected an array of admin messages: {e}"))
        })?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::MalformedResponse("insert returned no message".to_string()))?
            .validate()
    }

    async fn unread_messages(&self, user_id: &str) -> Result<Vec<AdminMessage>, StoreError> {
        let (body, _) = self.send_checked(self.unread_messages_request(user_id)).await?;
        let rows: Vec<RawAdminMessage> = serde_json::from_str(&body).map_err(|e| {
            StoreError::MalformedResponse(format!("expected an array of admin messages: {e}"))
        })?;
        rows.into_iter().map(RawAdminMessage::validate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> RestSubscriptionStore {
        let config = TrackerConfig {
            supabase_url: "https://abc.supabase.co/".to_string(),
            supabase_key: "anon-key".to_string(),
            access_token: Some("user-jwt".to_string()),
            ..TrackerConfig::default()
        };
        RestSubscriptionStore::with_client(Client::new(), &config)
    }

    fn query_pairs(request: &reqwest::Request) -> Vec<(String, String)> {
        request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_fetch_active_request_filters_and_orders() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let request = store().fetch_active_request("u-1", now).build().unwrap();

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.url().path(), "/rest/v1/vip_subscriptions");
        let pairs = query_pairs(&request);
        assert!(pairs.contains(&("user_id".into(), "eq.u-1".into())));
        assert!(pairs.contains(&("status".into(), "eq.active".into())));
        assert!(pairs.contains(&("end_time".into(), "gt.2025-01-01T12:00:00.000Z".into())));
        assert!(pairs.contains(&("order".into(), "end_time.desc".into())));
        assert!(pairs.contains(&("limit".into(), "1".into())));

        let headers = request.headers();
        assert_eq!(headers["apikey"], "anon-key");
        assert_eq!(headers[header::AUTHORIZATION], "Bearer user-jwt");
    }

    #[test]
    fn test_count_request_asks_for_exact_count() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let request = store().count_active_request(now).build().unwrap();
        assert_eq!(request.headers()["Prefer"], "count=exact");
    }

    #[test]
    fn test_unread_messages_request_includes_broadcasts() {
        let request = store().unread_messages_request("u-1").build().unwrap();
        assert_eq!(request.url().path(), "/rest/v1/admin_messages");
        let pairs = query_pairs(&request);
        assert!(pairs.contains(&("or".into(), "(receiver_id.eq.\"u-1\",receiver_id.is.null)".into())));
    }

    #[test]
    fn test_unread_messages_request_quotes_filter_syntax_in_user_id() {
        let request = store()
            .unread_messages_request("x),receiver_id.neq.(y")
            .build()
            .unwrap();
        let pairs = query_pairs(&request);
        assert!(pairs.contains(&(
            "or".into(),
            "(receiver_id.eq.\"x),receiver_id.neq.(y\",receiver_id.is.null)".into()
        )));
    }

    #[test]
    fn test_quote_filter_value_escapes_quotes_and_backslashes() {
        assert_eq!(quote_filter_value("plain"), "\"plain\"");
        assert_eq!(quote_filter_value(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-0/42").unwrap(), 42);
        assert_eq!(parse_content_range_total("*/0").unwrap(), 0);
        assert!(parse_content_range_total("0-0/*").is_err());
    }
}
