//! Mapping between local purchase orders and ERP records.
//!
//! The ERP exposes `purchase.order` and `purchase.order.line` models as loose
//! JSON maps. Many-to-one fields may arrive as a bare id, a string, or an
//! `[id, display_name]` pair; `false` stands for "unset".

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use ordersync_core::{DomainError, Money, RemoteId, TaxRate};

use crate::order::{OrderItem, PurchaseOrder, PurchaseOrderStatus};

pub const ORDER_MODEL: &str = "purchase.order";
pub const LINE_MODEL: &str = "purchase.order.line";

/// Field names on the ERP models.
pub mod fields {
    pub const NAME: &str = "name";
    pub const PARTNER_ID: &str = "partner_id";
    pub const DATE_ORDER: &str = "date_order";
    pub const DATE_PLANNED: &str = "date_planned";
    pub const STATE: &str = "state";
    pub const AMOUNT_UNTAXED: &str = "amount_untaxed";
    pub const AMOUNT_TAX: &str = "amount_tax";
    pub const AMOUNT_TOTAL: &str = "amount_total";
    pub const ORDER_LINE: &str = "order_line";
    pub const WRITE_DATE: &str = "write_date";

    pub const ORDER_ID: &str = "order_id";
    pub const PRODUCT_ID: &str = "product_id";
    pub const PRODUCT_QTY: &str = "product_qty";
    pub const PRICE_UNIT: &str = "price_unit";

    pub const ORDER_FIELDS: &[&str] = &[
        NAME,
        PARTNER_ID,
        DATE_ORDER,
        DATE_PLANNED,
        STATE,
        AMOUNT_UNTAXED,
        AMOUNT_TAX,
        AMOUNT_TOTAL,
        ORDER_LINE,
        WRITE_DATE,
    ];

    pub const LINE_FIELDS: &[&str] = &[ORDER_ID, PRODUCT_ID, PRODUCT_QTY, PRICE_UNIT];
}

/// A raw ERP record.
pub type ErpRecord = Map<String, Value>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl RecordError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrderLine {
    pub remote_id: RemoteId,
    pub product_ref: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl RemoteOrderLine {
    pub fn from_record(record: &ErpRecord) -> Result<Self, RecordError> {
        let remote_id = record_id(record)?;
        let product_ref = reference(record.get(fields::PRODUCT_ID))
            .ok_or(RecordError::MissingField(fields::PRODUCT_ID))?;

        let qty = record
            .get(fields::PRODUCT_QTY)
            .and_then(Value::as_f64)
            .ok_or(RecordError::MissingField(fields::PRODUCT_QTY))?;
        if qty <= 0.0 || qty.fract() != 0.0 || qty > f64::from(u32::MAX) {
            return Err(RecordError::invalid(
                fields::PRODUCT_QTY,
                format!("expected a positive whole quantity, got {qty}"),
            ));
        }

        Ok(Self {
            remote_id,
            product_ref,
            quantity: qty as u32,
            unit_price: amount(record, fields::PRICE_UNIT)?,
        })
    }
}

/// Typed view of a remote `purchase.order` record.
///
/// `lines` is empty until the line records are fetched separately;
/// `line_ids` always mirrors the header's `order_line` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub remote_id: RemoteId,
    pub name: String,
    pub partner_ref: Option<String>,
    pub date_order: Option<DateTime<Utc>>,
    pub date_planned: Option<NaiveDate>,
    pub state: String,
    pub amount_untaxed: Money,
    pub amount_tax: Money,
    pub amount_total: Money,
    pub line_ids: Vec<RemoteId>,
    pub lines: Vec<RemoteOrderLine>,
    pub write_date: Option<DateTime<Utc>>,
}

impl RemoteOrder {
    pub fn from_record(record: &ErpRecord) -> Result<Self, RecordError> {
        let remote_id = record_id(record)?;
        let name = record
            .get(fields::NAME)
            .and_then(Value::as_str)
            .ok_or(RecordError::MissingField(fields::NAME))?
            .to_string();
        let state = record
            .get(fields::STATE)
            .and_then(Value::as_str)
            .unwrap_or(PurchaseOrderStatus::Draft.erp_state())
            .to_string();

        let line_ids = match record.get(fields::ORDER_LINE) {
            None | Some(Value::Bool(false)) | Some(Value::Null) => Vec::new(),
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|v| {
                    v.as_i64()
                        .and_then(|id| RemoteId::new(id).ok())
                        .ok_or_else(|| RecordError::invalid(fields::ORDER_LINE, "expected line ids"))
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(RecordError::invalid(fields::ORDER_LINE, "expected a list")),
        };

        Ok(Self {
            remote_id,
            name,
            partner_ref: reference(record.get(fields::PARTNER_ID)),
            date_order: datetime_field(record, fields::DATE_ORDER)?,
            date_planned: datetime_field(record, fields::DATE_PLANNED)?.map(|dt| dt.date_naive()),
            state,
            amount_untaxed: amount(record, fields::AMOUNT_UNTAXED)?,
            amount_tax: amount(record, fields::AMOUNT_TAX)?,
            amount_total: amount(record, fields::AMOUNT_TOTAL)?,
            line_ids,
            lines: Vec::new(),
            write_date: datetime_field(record, fields::WRITE_DATE)?,
        })
    }

    pub fn with_lines(mut self, lines: Vec<RemoteOrderLine>) -> Self {
        self.lines = lines;
        self
    }

    /// Line ids referenced by the header whose records were not fetched.
    pub fn unexpanded_line_ids(&self) -> Vec<RemoteId> {
        self.line_ids
            .iter()
            .copied()
            .filter(|id| !self.lines.iter().any(|l| l.remote_id == *id))
            .collect()
    }

    pub fn status(&self) -> Option<PurchaseOrderStatus> {
        PurchaseOrderStatus::from_erp_state(&self.state)
    }
}

impl PurchaseOrder {
    /// Build a local order mirroring a remote one. The result is already in
    /// sync with `remote`.
    pub fn from_remote(remote: &RemoteOrder) -> Result<Self, DomainError> {
        let supplier = remote
            .partner_ref
            .clone()
            .ok_or_else(|| DomainError::validation("remote order has no partner"))?;
        let items = remote
            .lines
            .iter()
            .map(|l| OrderItem::new(l.product_ref.clone(), l.quantity, l.unit_price))
            .collect::<Result<Vec<_>, _>>()?;

        let mut order = PurchaseOrder::new(
            remote.name.clone(),
            supplier,
            items,
            implied_tax_rate(remote.amount_untaxed, remote.amount_tax),
        )?;
        order.status = remote.status().unwrap_or(PurchaseOrderStatus::Draft);
        order.requested_delivery_date = remote.date_planned;
        // Remote totals are authoritative; local rounding may differ by a cent.
        order.subtotal = remote.amount_untaxed;
        order.tax = remote.amount_tax;
        order.total = remote.amount_total;
        if let Some(created) = remote.date_order {
            order.created_at = created;
        }
        order.mark_synced(remote.remote_id, Utc::now());
        Ok(order)
    }

    /// Overwrite every field shared with the ERP by the remote's values.
    ///
    /// Lines are only replaced when the remote's lines were fetched. Counts as
    /// a local mutation (the version is bumped).
    pub fn adopt_remote(&mut self, remote: &RemoteOrder) -> Result<(), DomainError> {
        if let Some(partner) = &remote.partner_ref {
            self.supplier_ref = partner.clone();
        }
        if let Some(status) = remote.status() {
            self.status = status;
        }
        if remote.date_planned.is_some() {
            self.requested_delivery_date = remote.date_planned;
        }
        if remote.unexpanded_line_ids().is_empty() {
            self.items = remote
                .lines
                .iter()
                .map(|l| OrderItem::new(l.product_ref.clone(), l.quantity, l.unit_price))
                .collect::<Result<Vec<_>, _>>()?;
            self.recalculate_totals()?;
        }
        self.tax_rate = implied_tax_rate(remote.amount_untaxed, remote.amount_tax);
        self.subtotal = remote.amount_untaxed;
        self.tax = remote.amount_tax;
        self.total = remote.amount_total;
        self.remote_id = Some(remote.remote_id);
        self.touch();
        Ok(())
    }
}

/// Header values to send on create/write.
pub fn order_values(order: &PurchaseOrder) -> ErpRecord {
    let mut values = Map::new();
    values.insert(fields::NAME.into(), json!(order.order_number));
    values.insert(fields::PARTNER_ID.into(), reference_value(&order.supplier_ref));
    values.insert(fields::STATE.into(), json!(order.status.erp_state()));
    values.insert(
        fields::DATE_ORDER.into(),
        json!(format_erp_datetime(order.created_at)),
    );
    values.insert(
        fields::DATE_PLANNED.into(),
        match order.requested_delivery_date {
            Some(d) => json!(d.format("%Y-%m-%d").to_string()),
            None => Value::Bool(false),
        },
    );
    values.insert(fields::AMOUNT_UNTAXED.into(), json!(order.subtotal.to_decimal()));
    values.insert(fields::AMOUNT_TAX.into(), json!(order.tax.to_decimal()));
    values.insert(fields::AMOUNT_TOTAL.into(), json!(order.total.to_decimal()));
    values
}

/// Values for one `purchase.order.line` record.
pub fn line_values(order_remote_id: RemoteId, item: &OrderItem) -> ErpRecord {
    let mut values = Map::new();
    values.insert(fields::ORDER_ID.into(), json!(order_remote_id.get()));
    values.insert(fields::PRODUCT_ID.into(), reference_value(&item.product_ref));
    values.insert(fields::PRODUCT_QTY.into(), json!(f64::from(item.quantity)));
    values.insert(fields::PRICE_UNIT.into(), json!(item.unit_price.to_decimal()));
    values
}

pub fn format_erp_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339, the ERP's `YYYY-MM-DD HH:MM:SS` form and bare dates.
pub fn parse_erp_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

fn implied_tax_rate(untaxed: Money, tax: Money) -> TaxRate {
    if untaxed.cents() == 0 {
        return TaxRate::default();
    }
    let bps = (tax.cents() as f64 * 10_000.0 / untaxed.cents() as f64).round() as u32;
    TaxRate::from_basis_points(bps).unwrap_or_default()
}

fn record_id(record: &ErpRecord) -> Result<RemoteId, RecordError> {
    let raw = record
        .get("id")
        .and_then(Value::as_i64)
        .ok_or(RecordError::MissingField("id"))?;
    RemoteId::new(raw).map_err(|e| RecordError::invalid("id", e.to_string()))
}

/// Resolve a many-to-one value to a reference string.
fn reference(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(pair) => reference(pair.first()),
        _ => None,
    }
}

fn reference_value(reference: &str) -> Value {
    match reference.parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(reference),
    }
}

fn amount(record: &ErpRecord, field: &'static str) -> Result<Money, RecordError> {
    match record.get(field) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(Money::ZERO),
        Some(v) => {
            let raw = v
                .as_f64()
                .ok_or_else(|| RecordError::invalid(field, "expected a number"))?;
            Money::from_decimal(raw).map_err(|e| RecordError::invalid(field, e.to_string()))
        }
    }
}

fn datetime_field(
    record: &ErpRecord,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    match record.get(field) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::String(raw)) => parse_erp_datetime(raw)
            .map(Some)
            .ok_or_else(|| RecordError::invalid(field, format!("unrecognised datetime `{raw}`"))),
        Some(_) => Err(RecordError::invalid(field, "expected a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ErpRecord {
        json!({
            "id": 42,
            "name": "PO-0001",
            "partner_id": [7, "Acme Supplies"],
            "date_order": "2026-03-01 09:30:00",
            "date_planned": "2026-03-15 00:00:00",
            "state": "purchase",
            "amount_untaxed": 500.0,
            "amount_tax": 50.0,
            "amount_total": 550.0,
            "order_line": [101, 102],
            "write_date": "2026-03-02T10:00:00.000000Z"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn line(id: i64, product: Value, qty: f64, price: f64) -> ErpRecord {
        json!({ "id": id, "order_id": [42, "PO-0001"], "product_id": product, "product_qty": qty, "price_unit": price })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn parses_header_fields() {
        let remote = RemoteOrder::from_record(&header()).unwrap();
        assert_eq!(remote.remote_id.get(), 42);
        assert_eq!(remote.partner_ref.as_deref(), Some("7"));
        assert_eq!(remote.amount_total, Money::from_cents(55_000));
        assert_eq!(remote.date_planned, NaiveDate::from_ymd_opt(2026, 3, 15));
        assert_eq!(remote.status(), Some(PurchaseOrderStatus::Approved));
        assert_eq!(remote.line_ids.len(), 2);
        assert_eq!(remote.unexpanded_line_ids().len(), 2);
    }

    #[test]
    fn false_means_unset() {
        let mut record = header();
        record.insert(fields::DATE_PLANNED.into(), Value::Bool(false));
        record.insert(fields::PARTNER_ID.into(), Value::Bool(false));
        let remote = RemoteOrder::from_record(&record).unwrap();
        assert_eq!(remote.date_planned, None);
        assert_eq!(remote.partner_ref, None);
    }

    #[test]
    fn missing_name_is_reported() {
        let mut record = header();
        record.remove(fields::NAME);
        let err = RemoteOrder::from_record(&record).unwrap_err();
        assert_eq!(err, RecordError::MissingField("name"));
    }

    #[test]
    fn fractional_quantity_is_rejected() {
        let err = RemoteOrderLine::from_record(&line(1, json!(3), 1.5, 10.0)).unwrap_err();
        assert!(matches!(err, RecordError::InvalidField { field: "product_qty", .. }));
    }

    #[test]
    fn import_mirrors_remote_order() {
        let remote = RemoteOrder::from_record(&header()).unwrap().with_lines(vec![
            RemoteOrderLine::from_record(&line(101, json!("SKU-1"), 10.0, 30.0)).unwrap(),
            RemoteOrderLine::from_record(&line(102, json!([9, "Widget"]), 4.0, 50.0)).unwrap(),
        ]);

        let order = PurchaseOrder::from_remote(&remote).unwrap();

        assert_eq!(order.order_number, "PO-0001");
        assert_eq!(order.supplier_ref, "7");
        assert_eq!(order.items[1].product_ref, "9");
        assert_eq!(order.total.to_string(), "550.00");
        assert_eq!(order.tax_rate.basis_points(), 1_000);
        assert_eq!(order.status, PurchaseOrderStatus::Approved);
        assert_eq!(order.remote_id, Some(remote.remote_id));
        assert_eq!(order.sync_status, ordersync_core::SyncStatus::Synced);
    }

    #[test]
    fn adopting_remote_replaces_shared_fields_and_bumps_version() {
        let item = OrderItem::new("SKU-1", 20, Money::from_cents(3_000)).unwrap();
        let mut order = PurchaseOrder::new("PO-0001", "7", vec![item], TaxRate::default()).unwrap();
        let remote = RemoteOrder::from_record(&header()).unwrap().with_lines(vec![
            RemoteOrderLine::from_record(&line(101, json!("SKU-1"), 10.0, 30.0)).unwrap(),
            RemoteOrderLine::from_record(&line(102, json!(9), 4.0, 50.0)).unwrap(),
        ]);

        order.adopt_remote(&remote).unwrap();

        assert_eq!(order.version, 2);
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].quantity, 10);
        assert_eq!(order.total, Money::from_cents(55_000));
        assert_eq!(order.status, PurchaseOrderStatus::Approved);
        assert_eq!(order.requested_delivery_date, NaiveDate::from_ymd_opt(2026, 3, 15));
    }

    #[test]
    fn adopting_unexpanded_remote_keeps_local_lines() {
        let item = OrderItem::new("SKU-1", 20, Money::from_cents(3_000)).unwrap();
        let mut order = PurchaseOrder::new("PO-0001", "7", vec![item], TaxRate::default()).unwrap();
        let remote = RemoteOrder::from_record(&header()).unwrap();

        order.adopt_remote(&remote).unwrap();

        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].quantity, 20);
    }

    #[test]
    fn outgoing_values_use_erp_vocabulary() {
        let item = OrderItem::new("12", 2, Money::from_cents(1_050)).unwrap();
        let order = PurchaseOrder::new(
            "PO-9",
            "SUP-1",
            vec![item.clone()],
            TaxRate::from_basis_points(0).unwrap(),
        )
        .unwrap();

        let values = order_values(&order);
        assert_eq!(values[fields::STATE], json!("draft"));
        assert_eq!(values[fields::PARTNER_ID], json!("SUP-1"));
        assert_eq!(values[fields::DATE_PLANNED], json!(false));
        assert_eq!(values[fields::AMOUNT_TOTAL], json!(21.0));

        let line = line_values(RemoteId::new(5).unwrap(), &item);
        assert_eq!(line[fields::PRODUCT_ID], json!(12));
        assert_eq!(line[fields::ORDER_ID], json!(5));
    }

    #[test]
    fn write_date_round_trips_through_erp_format() {
        let at = parse_erp_datetime("2026-03-02T10:00:00.123456Z").unwrap();
        assert_eq!(format_erp_datetime(at), "2026-03-02T10:00:00.123456Z");
    }
}
