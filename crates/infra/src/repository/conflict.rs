//! Field-level comparison of a local order against its remote counterpart.
//!
//! Detection is a pure function of its inputs: the same local order, remote
//! order and baseline always produce the same [`ConflictSet`], with conflicts
//! ordered by field name.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use ordersync_core::ConflictType;
use ordersync_purchasing::{OrderItem, PurchaseOrder, RemoteOrder, RemoteOrderLine, fields};

/// One mismatched field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub conflict_type: ConflictType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictSet {
    pub has_conflicts: bool,
    pub conflicts: Vec<Conflict>,
    /// Non-fatal anomalies; they never block a sync.
    pub warnings: Vec<String>,
}

impl ConflictSet {
    /// Most severe classification among the conflicts.
    pub fn conflict_type(&self) -> Option<ConflictType> {
        self.conflicts.iter().map(|c| c.conflict_type).max()
    }

    pub fn fields(&self) -> Vec<String> {
        self.conflicts.iter().map(|c| c.field.clone()).collect()
    }
}

/// What both sides looked like at the last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBaseline {
    pub local_version: u64,
    pub remote_write_date: Option<DateTime<Utc>>,
}

impl SyncBaseline {
    pub fn local_changed(&self, local: &PurchaseOrder) -> bool {
        local.version > self.local_version
    }

    pub fn remote_changed(&self, remote: &RemoteOrder) -> bool {
        match (remote.write_date, self.remote_write_date) {
            (Some(current), Some(baseline)) => current > baseline,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Classify a divergence.
///
/// Without a baseline there is no history to compare against, so any
/// difference is a plain data mismatch.
pub fn classify(
    local: &PurchaseOrder,
    remote: &RemoteOrder,
    baseline: Option<&SyncBaseline>,
) -> ConflictType {
    let Some(baseline) = baseline else {
        return ConflictType::DataMismatch;
    };
    match (baseline.local_changed(local), baseline.remote_changed(remote)) {
        (true, true) => ConflictType::ConcurrentModification,
        (false, true) => ConflictType::VersionConflict,
        _ => ConflictType::DataMismatch,
    }
}

pub fn detect(
    local: &PurchaseOrder,
    remote: &RemoteOrder,
    baseline: Option<&SyncBaseline>,
) -> ConflictSet {
    let conflict_type = classify(local, remote, baseline);
    let mut diffs: BTreeMap<String, (Value, Value)> = BTreeMap::new();
    let mut warnings = Vec::new();

    let local_partner = json!(local.supplier_ref);
    let remote_partner = remote.partner_ref.as_ref().map_or(Value::Null, |p| json!(p));
    if local_partner != remote_partner {
        diffs.insert(fields::PARTNER_ID.to_string(), (local_partner, remote_partner));
    }

    if remote.status() != Some(local.status) {
        diffs.insert(
            fields::STATE.to_string(),
            (json!(local.status.erp_state()), json!(remote.state)),
        );
    }

    for (field, l, r) in [
        (fields::AMOUNT_UNTAXED, local.subtotal, remote.amount_untaxed),
        (fields::AMOUNT_TAX, local.tax, remote.amount_tax),
        (fields::AMOUNT_TOTAL, local.total, remote.amount_total),
    ] {
        if l != r {
            diffs.insert(field.to_string(), (json!(l.to_string()), json!(r.to_string())));
        }
    }

    match (local.requested_delivery_date, remote.date_planned) {
        (None, Some(date)) => warnings.push(format!(
            "{} is set remotely ({date}) but absent locally",
            fields::DATE_PLANNED
        )),
        (l, r) if l != r => {
            diffs.insert(
                fields::DATE_PLANNED.to_string(),
                (date_value(l), date_value(r)),
            );
        }
        _ => {}
    }

    let unexpanded = remote.unexpanded_line_ids();
    if unexpanded.is_empty() {
        compare_lines(local, remote, &mut diffs, &mut warnings);
    } else {
        warnings.push(format!(
            "{} remote line reference(s) were not expanded; lines not compared",
            unexpanded.len()
        ));
    }

    let conflicts: Vec<Conflict> = diffs
        .into_iter()
        .map(|(field, (local_value, remote_value))| Conflict {
            field,
            local_value,
            remote_value,
            conflict_type,
        })
        .collect();

    ConflictSet {
        has_conflicts: !conflicts.is_empty(),
        conflicts,
        warnings,
    }
}

fn compare_lines(
    local: &PurchaseOrder,
    remote: &RemoteOrder,
    diffs: &mut BTreeMap<String, (Value, Value)>,
    warnings: &mut Vec<String>,
) {
    let mut local_lines: BTreeMap<&str, &OrderItem> = BTreeMap::new();
    for item in &local.items {
        if local_lines.insert(item.product_ref.as_str(), item).is_some() {
            warnings.push(format!("duplicate local line for product {}", item.product_ref));
        }
    }
    let mut remote_lines: BTreeMap<&str, &RemoteOrderLine> = BTreeMap::new();
    for line in &remote.lines {
        if remote_lines.insert(line.product_ref.as_str(), line).is_some() {
            warnings.push(format!("duplicate remote line for product {}", line.product_ref));
        }
    }

    let products: std::collections::BTreeSet<&str> =
        local_lines.keys().chain(remote_lines.keys()).copied().collect();
    for product in products {
        match (local_lines.get(product), remote_lines.get(product)) {
            (Some(l), Some(r)) => {
                if l.quantity != r.quantity {
                    diffs.insert(
                        format!("lines[{product}].quantity"),
                        (json!(l.quantity), json!(r.quantity)),
                    );
                }
                if l.unit_price != r.unit_price {
                    diffs.insert(
                        format!("lines[{product}].unit_price"),
                        (json!(l.unit_price.to_string()), json!(r.unit_price.to_string())),
                    );
                }
            }
            (Some(l), None) => {
                diffs.insert(
                    format!("lines[{product}]"),
                    (line_value(l.quantity, l.unit_price), Value::Null),
                );
            }
            (None, Some(r)) => {
                diffs.insert(
                    format!("lines[{product}]"),
                    (Value::Null, line_value(r.quantity, r.unit_price)),
                );
            }
            (None, None) => {}
        }
    }
}

fn line_value(quantity: u32, unit_price: ordersync_core::Money) -> Value {
    json!({ "quantity": quantity, "unit_price": unit_price.to_string() })
}

fn date_value(date: Option<chrono::NaiveDate>) -> Value {
    date.map_or(Value::Null, |d| json!(d.format("%Y-%m-%d").to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordersync_core::{Money, RemoteId, TaxRate};
    use ordersync_purchasing::PurchaseOrderStatus;
    use proptest::prelude::*;

    fn ten_percent() -> TaxRate {
        TaxRate::from_basis_points(1_000).unwrap()
    }

    fn local_order(qty: u32) -> PurchaseOrder {
        let items = vec![OrderItem::new("SKU-1", qty, Money::from_cents(5_000)).unwrap()];
        PurchaseOrder::new("PO-1", "7", items, ten_percent()).unwrap()
    }

    fn remote_for(order: &PurchaseOrder, at: DateTime<Utc>) -> RemoteOrder {
        let lines: Vec<RemoteOrderLine> = order
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| RemoteOrderLine {
                remote_id: RemoteId::new(100 + i as i64).unwrap(),
                product_ref: item.product_ref.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        RemoteOrder {
            remote_id: RemoteId::new(1).unwrap(),
            name: order.order_number.clone(),
            partner_ref: Some(order.supplier_ref.clone()),
            date_order: Some(order.created_at),
            date_planned: order.requested_delivery_date,
            state: order.status.erp_state().to_string(),
            amount_untaxed: order.subtotal,
            amount_tax: order.tax,
            amount_total: order.total,
            line_ids: lines.iter().map(|l| l.remote_id).collect(),
            lines,
            write_date: Some(at),
        }
    }

    fn baseline_for(order: &PurchaseOrder, at: DateTime<Utc>) -> SyncBaseline {
        SyncBaseline {
            local_version: order.version,
            remote_write_date: Some(at),
        }
    }

    #[test]
    fn identical_sides_have_no_conflicts() {
        let at = Utc::now();
        let local = local_order(10);
        let remote = remote_for(&local, at);
        let set = detect(&local, &remote, Some(&baseline_for(&local, at)));
        assert!(!set.has_conflicts);
        assert!(set.warnings.is_empty());
    }

    #[test]
    fn local_quantity_edit_is_a_data_mismatch() {
        let at = Utc::now();
        let mut local = local_order(10);
        let remote = remote_for(&local, at);
        let baseline = baseline_for(&local, at);

        let item_id = local.items[0].id;
        local.set_item_quantity(item_id, 20).unwrap();

        let set = detect(&local, &remote, Some(&baseline));
        assert!(set.has_conflicts);
        assert_eq!(set.conflict_type(), Some(ConflictType::DataMismatch));
        let qty = set
            .conflicts
            .iter()
            .find(|c| c.field == "lines[SKU-1].quantity")
            .unwrap();
        assert_eq!(qty.local_value, json!(20));
        assert_eq!(qty.remote_value, json!(10));
        assert!(set.fields().contains(&fields::AMOUNT_TOTAL.to_string()));
    }

    #[test]
    fn remote_only_change_is_a_version_conflict() {
        let at = Utc::now();
        let local = local_order(10);
        let mut remote = remote_for(&local, at);
        let baseline = baseline_for(&local, at);
        remote.state = "purchase".into();
        remote.write_date = Some(at + chrono::Duration::seconds(5));

        let set = detect(&local, &remote, Some(&baseline));
        assert_eq!(set.fields(), vec![fields::STATE.to_string()]);
        assert_eq!(set.conflict_type(), Some(ConflictType::VersionConflict));
    }

    #[test]
    fn edits_on_both_sides_are_concurrent() {
        let at = Utc::now();
        let mut local = local_order(10);
        let mut remote = remote_for(&local, at);
        let baseline = baseline_for(&local, at);
        local.submit().unwrap();
        remote.partner_ref = Some("8".into());
        remote.write_date = Some(at + chrono::Duration::seconds(1));

        let set = detect(&local, &remote, Some(&baseline));
        assert_eq!(set.conflict_type(), Some(ConflictType::ConcurrentModification));
        assert_eq!(
            set.fields(),
            vec![fields::PARTNER_ID.to_string(), fields::STATE.to_string()]
        );
    }

    #[test]
    fn anomalies_are_warnings() {
        let at = Utc::now();
        let local = local_order(10);
        let mut remote = remote_for(&local, at);
        remote.date_planned = chrono::NaiveDate::from_ymd_opt(2026, 5, 1);
        remote.line_ids.push(RemoteId::new(999).unwrap());

        let set = detect(&local, &remote, None);
        assert!(!set.has_conflicts);
        assert_eq!(set.warnings.len(), 2);
    }

    #[test]
    fn missing_lines_are_reported_per_product() {
        let at = Utc::now();
        let mut local = local_order(10);
        let remote = remote_for(&local, at);
        local
            .add_item(OrderItem::new("SKU-2", 1, Money::from_cents(100)).unwrap())
            .unwrap();

        let set = detect(&local, &remote, None);
        let line = set.conflicts.iter().find(|c| c.field == "lines[SKU-2]").unwrap();
        assert_eq!(line.remote_value, Value::Null);
        assert_eq!(line.local_value["quantity"], json!(1));
    }

    #[test]
    fn status_mapping_is_not_a_conflict() {
        let at = Utc::now();
        let mut local = local_order(10);
        local.status = PurchaseOrderStatus::Submitted;
        let mut remote = remote_for(&local, at);
        remote.state = "to approve".into();
        assert!(!detect(&local, &remote, None).has_conflicts);
    }

    proptest! {
        #[test]
        fn detection_is_deterministic(
            local_qty in 1u32..50,
            remote_qty in 1u32..50,
            remote_price in 1u64..10_000,
            bump_remote in any::<bool>(),
        ) {
            let at = Utc::now();
            let local = local_order(local_qty);
            let mut remote = remote_for(&local, at);
            remote.lines[0].quantity = remote_qty;
            remote.lines[0].unit_price = Money::from_cents(remote_price);
            if bump_remote {
                remote.write_date = Some(at + chrono::Duration::seconds(1));
            }
            let baseline = baseline_for(&local, at);

            let first = detect(&local, &remote, Some(&baseline));
            let second = detect(&local, &remote, Some(&baseline));
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.has_conflicts, !first.conflicts.is_empty());
        }
    }
}
