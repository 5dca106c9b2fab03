//! In-memory ERP for tests and local development.
//!
//! Stores records per model, stamps `id`/`write_date` the way the real ERP
//! does, evaluates search domains, and supports failure injection and call
//! counting so resilience paths can be exercised deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use ordersync_purchasing::{ErpRecord, LINE_MODEL, ORDER_MODEL, fields, format_erp_datetime};

use super::{ConnectionStatus, ErpClient, ErpError, FieldMetadata, SearchDomain, SearchOptions};

#[derive(Debug, Default)]
struct State {
    models: HashMap<String, BTreeMap<i64, ErpRecord>>,
    next_id: i64,
    last_write: Option<DateTime<Utc>>,
    injected: VecDeque<ErpError>,
    create_failures: HashMap<String, VecDeque<(usize, ErpError)>>,
    status: Option<ConnectionStatus>,
    reject_credentials: bool,
}

impl State {
    /// Strictly increasing write stamp, even for back-to-back writes.
    fn stamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_write {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_write = Some(now);
        format_erp_datetime(now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryErpClient {
    state: Mutex<State>,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl InMemoryErpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every remote call, to widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `times` remote calls with `error`.
    pub fn fail_next(&self, times: usize, error: ErpError) {
        if let Ok(mut state) = self.state.lock() {
            state.injected.extend(std::iter::repeat_n(error, times));
        }
    }

    /// Let `successes` more creates on `model` through, then fail the next
    /// one with `error`. Other models and call kinds are unaffected.
    pub fn fail_create_after(&self, model: &str, successes: usize, error: ErpError) {
        if let Ok(mut state) = self.state.lock() {
            state
                .create_failures
                .entry(model.to_string())
                .or_default()
                .push_back((successes, error));
        }
    }

    pub fn set_connection_status(&self, status: ConnectionStatus) {
        if let Ok(mut state) = self.state.lock() {
            state.status = Some(status);
        }
    }

    pub fn reject_credentials(&self, reject: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.reject_credentials = reject;
        }
    }

    /// Remote calls attempted so far (including injected failures).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seed a record without going through the client API.
    pub fn insert(&self, model: &str, mut values: ErpRecord) -> i64 {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        state.next_id += 1;
        let id = state.next_id;
        let stamp = state.stamp();
        values.insert("id".into(), json!(id));
        values.entry(fields::WRITE_DATE).or_insert(json!(stamp));
        state.models.entry(model.to_string()).or_default().insert(id, values);
        id
    }

    /// Simulate an edit made directly in the ERP.
    pub fn modify(&self, model: &str, id: i64, values: ErpRecord) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let stamp = state.stamp();
        match state.models.get_mut(model).and_then(|m| m.get_mut(&id)) {
            Some(record) => {
                record.extend(values);
                record.insert(fields::WRITE_DATE.into(), json!(stamp));
                true
            }
            None => false,
        }
    }

    pub fn record(&self, model: &str, id: i64) -> Option<ErpRecord> {
        let state = self.state.lock().ok()?;
        state.models.get(model)?.get(&id).cloned()
    }

    pub fn count(&self, model: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.models.get(model).map_or(0, |m| m.len()))
            .unwrap_or(0)
    }

    async fn begin(&self) -> Result<(), ErpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock()?;
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }
        if state.status == Some(ConnectionStatus::Disconnected) {
            return Err(ErpError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, ErpError> {
        self.state
            .lock()
            .map_err(|_| ErpError::Protocol("in-memory ERP state poisoned".into()))
    }

    fn matching(
        state: &State,
        model: &str,
        domain: &SearchDomain,
        options: &SearchOptions,
    ) -> Vec<ErpRecord> {
        let Some(records) = state.models.get(model) else {
            return Vec::new();
        };
        let mut found: Vec<ErpRecord> = records
            .values()
            .filter(|r| domain.matches(r))
            .cloned()
            .collect();

        if let Some(order) = options.order.as_deref() {
            let mut parts = order.split_whitespace();
            let field = parts.next().unwrap_or("id").to_string();
            let descending = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
            found.sort_by(|a, b| {
                let ord = sort_key(a.get(&field)).cmp(&sort_key(b.get(&field)));
                if descending { ord.reverse() } else { ord }
            });
        }

        found
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

fn sort_key(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => format!("{:020.6}", n.as_f64().unwrap_or_default()),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn project(record: &ErpRecord, fields: Option<&[&str]>) -> ErpRecord {
    match fields {
        None => record.clone(),
        Some(fields) => record
            .iter()
            .filter(|(k, _)| k.as_str() == "id" || fields.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn meta(field_type: &str, label: &str, required: bool, relation: Option<&str>) -> FieldMetadata {
    FieldMetadata {
        field_type: field_type.to_string(),
        label: label.to_string(),
        required,
        readonly: false,
        relation: relation.map(str::to_string),
    }
}

fn known_fields(model: &str) -> BTreeMap<String, FieldMetadata> {
    let table: Vec<(&str, FieldMetadata)> = match model {
        ORDER_MODEL => vec![
            (fields::NAME, meta("char", "Order Reference", true, None)),
            (fields::PARTNER_ID, meta("many2one", "Vendor", true, Some("res.partner"))),
            (fields::DATE_ORDER, meta("datetime", "Order Deadline", true, None)),
            (fields::DATE_PLANNED, meta("datetime", "Expected Arrival", false, None)),
            (fields::STATE, meta("selection", "Status", false, None)),
            (fields::AMOUNT_UNTAXED, meta("monetary", "Untaxed Amount", false, None)),
            (fields::AMOUNT_TAX, meta("monetary", "Taxes", false, None)),
            (fields::AMOUNT_TOTAL, meta("monetary", "Total", false, None)),
            (fields::ORDER_LINE, meta("one2many", "Order Lines", false, Some(LINE_MODEL))),
            (fields::WRITE_DATE, meta("datetime", "Last Updated on", false, None)),
        ],
        LINE_MODEL => vec![
            (fields::ORDER_ID, meta("many2one", "Order Reference", true, Some(ORDER_MODEL))),
            (fields::PRODUCT_ID, meta("many2one", "Product", false, Some("product.product"))),
            (fields::PRODUCT_QTY, meta("float", "Quantity", true, None)),
            (fields::PRICE_UNIT, meta("float", "Unit Price", true, None)),
        ],
        _ => Vec::new(),
    };
    table.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[async_trait]
impl ErpClient for InMemoryErpClient {
    async fn create(&self, model: &str, mut values: ErpRecord) -> Result<i64, ErpError> {
        self.begin().await?;
        let mut state = self.lock()?;
        if let Some(queue) = state.create_failures.get_mut(model) {
            match queue.front_mut() {
                Some((0, _)) => {
                    if let Some((_, err)) = queue.pop_front() {
                        return Err(err);
                    }
                }
                Some((remaining, _)) => *remaining -= 1,
                None => {}
            }
        }
        state.next_id += 1;
        let id = state.next_id;
        let stamp = state.stamp();
        values.insert("id".into(), json!(id));
        values.insert(fields::WRITE_DATE.into(), json!(stamp));

        // Keep the parent's one2many in step with line creation.
        if model == LINE_MODEL {
            if let Some(order_id) = values.get(fields::ORDER_ID).and_then(Value::as_i64) {
                if let Some(order) = state
                    .models
                    .get_mut(ORDER_MODEL)
                    .and_then(|m| m.get_mut(&order_id))
                {
                    let lines = order
                        .entry(fields::ORDER_LINE)
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(ids) = lines {
                        ids.push(json!(id));
                    }
                }
            }
        }

        state.models.entry(model.to_string()).or_default().insert(id, values);
        tracing::debug!(model, id, "erp record created");
        Ok(id)
    }

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<ErpRecord>, ErpError> {
        self.begin().await?;
        let state = self.lock()?;
        let records = state.models.get(model);
        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| records.is_none_or(|m| !m.contains_key(id)))
            .collect();
        if !missing.is_empty() {
            return Err(ErpError::not_found(model, missing));
        }
        Ok(ids
            .iter()
            .filter_map(|id| records.and_then(|m| m.get(id)))
            .map(|r| project(r, fields))
            .collect())
    }

    async fn write(&self, model: &str, ids: &[i64], values: ErpRecord) -> Result<bool, ErpError> {
        self.begin().await?;
        let mut state = self.lock()?;
        let stamp = state.stamp();
        let records = state
            .models
            .get_mut(model)
            .ok_or_else(|| ErpError::not_found(model, ids.to_vec()))?;
        let missing: Vec<i64> = ids.iter().copied().filter(|id| !records.contains_key(id)).collect();
        if !missing.is_empty() {
            return Err(ErpError::not_found(model, missing));
        }
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                record.extend(values.clone());
                record.insert("id".into(), json!(id));
                record.insert(fields::WRITE_DATE.into(), json!(stamp));
            }
        }
        Ok(true)
    }

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, ErpError> {
        self.begin().await?;
        let mut state = self.lock()?;
        let records = state
            .models
            .get_mut(model)
            .ok_or_else(|| ErpError::not_found(model, ids.to_vec()))?;
        let mut removed = false;
        for id in ids {
            removed |= records.remove(id).is_some();
        }
        Ok(removed)
    }

    async fn search(
        &self,
        model: &str,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<i64>, ErpError> {
        self.begin().await?;
        let state = self.lock()?;
        Ok(Self::matching(&state, model, domain, &options)
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .collect())
    }

    async fn search_read(
        &self,
        model: &str,
        domain: &SearchDomain,
        fields: Option<&[&str]>,
        options: SearchOptions,
    ) -> Result<Vec<ErpRecord>, ErpError> {
        self.begin().await?;
        let state = self.lock()?;
        Ok(Self::matching(&state, model, domain, &options)
            .iter()
            .map(|r| project(r, fields))
            .collect())
    }

    async fn search_count(&self, model: &str, domain: &SearchDomain) -> Result<usize, ErpError> {
        self.begin().await?;
        let state = self.lock()?;
        Ok(Self::matching(&state, model, domain, &SearchOptions::default()).len())
    }

    async fn fields_get(
        &self,
        model: &str,
        fields: Option<&[&str]>,
    ) -> Result<BTreeMap<String, FieldMetadata>, ErpError> {
        self.begin().await?;
        let all = known_fields(model);
        if all.is_empty() {
            return Err(ErpError::Validation(format!("unknown model `{model}`")));
        }
        Ok(match fields {
            None => all,
            Some(wanted) => all
                .into_iter()
                .filter(|(k, _)| wanted.contains(&k.as_str()))
                .collect(),
        })
    }

    async fn connection_status(&self) -> ConnectionStatus {
        self.state
            .lock()
            .map(|s| s.status.unwrap_or(ConnectionStatus::Connected))
            .unwrap_or(ConnectionStatus::Error)
    }

    async fn authenticate(&self) -> Result<(), ErpError> {
        self.begin().await?;
        if self.lock()?.reject_credentials {
            return Err(ErpError::Authentication("invalid credentials".into()));
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), ErpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::DomainOperator;

    fn values(v: Value) -> ErpRecord {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_stamps_id_and_write_date() {
        let erp = InMemoryErpClient::new();
        let id = erp
            .create(ORDER_MODEL, values(json!({ "name": "PO-1", "state": "draft" })))
            .await
            .unwrap();
        let record = erp.record(ORDER_MODEL, id).unwrap();
        assert_eq!(record["id"], json!(id));
        assert!(record.contains_key(fields::WRITE_DATE));
    }

    #[tokio::test]
    async fn line_creation_updates_parent_one2many() {
        let erp = InMemoryErpClient::new();
        let order = erp.create(ORDER_MODEL, values(json!({ "name": "PO-1" }))).await.unwrap();
        let line = erp
            .create(LINE_MODEL, values(json!({ "order_id": order, "product_id": 3 })))
            .await
            .unwrap();
        assert_eq!(erp.record(ORDER_MODEL, order).unwrap()[fields::ORDER_LINE], json!([line]));
    }

    #[tokio::test]
    async fn search_read_honours_domain_order_and_paging() {
        let erp = InMemoryErpClient::new();
        for (name, state) in [("PO-1", "draft"), ("PO-2", "purchase"), ("PO-3", "purchase")] {
            erp.insert(ORDER_MODEL, values(json!({ "name": name, "state": state })));
        }
        let domain = SearchDomain::new().filter("state", DomainOperator::Eq, json!("purchase"));
        let options = SearchOptions {
            limit: Some(1),
            offset: 0,
            order: Some("name desc".into()),
        };
        let found = erp
            .search_read(ORDER_MODEL, &domain, Some(&["name"]), options)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], json!("PO-3"));
        assert!(!found[0].contains_key("state"));
        assert_eq!(erp.search_count(ORDER_MODEL, &domain).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn read_of_missing_ids_is_not_found() {
        let erp = InMemoryErpClient::new();
        let err = erp.read(ORDER_MODEL, &[99], None).await.unwrap_err();
        assert_eq!(err, ErpError::not_found(ORDER_MODEL, vec![99]));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let erp = InMemoryErpClient::new();
        erp.fail_next(1, ErpError::Timeout(Duration::from_secs(5)));
        assert!(erp.authenticate().await.is_err());
        assert!(erp.authenticate().await.is_ok());
        assert_eq!(erp.call_count(), 2);
    }

    #[tokio::test]
    async fn modify_advances_write_date() {
        let erp = InMemoryErpClient::new();
        let id = erp.insert(ORDER_MODEL, values(json!({ "name": "PO-1" })));
        let before = erp.record(ORDER_MODEL, id).unwrap()[fields::WRITE_DATE].clone();
        assert!(erp.modify(ORDER_MODEL, id, values(json!({ "state": "sent" }))));
        let after = erp.record(ORDER_MODEL, id).unwrap()[fields::WRITE_DATE].clone();
        assert!(after.as_str().unwrap() > before.as_str().unwrap());
    }
}
