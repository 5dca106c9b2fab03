use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use ordersync_core::{
    DomainError, Money, OrderId, OrderItemId, RemoteId, SyncStatus, TaxRate, Versioned,
};

/// Purchase order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseOrderStatus {
    Draft,
    Submitted,
    Approved,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    /// State string used by the remote ERP for this status.
    pub fn erp_state(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Submitted => "sent",
            PurchaseOrderStatus::Approved => "purchase",
            PurchaseOrderStatus::Received => "done",
            PurchaseOrderStatus::Cancelled => "cancel",
        }
    }

    pub fn from_erp_state(state: &str) -> Option<Self> {
        match state {
            "draft" => Some(PurchaseOrderStatus::Draft),
            "sent" | "to approve" => Some(PurchaseOrderStatus::Submitted),
            "purchase" => Some(PurchaseOrderStatus::Approved),
            "done" => Some(PurchaseOrderStatus::Received),
            "cancel" => Some(PurchaseOrderStatus::Cancelled),
            _ => None,
        }
    }

    fn is_editable(self) -> bool {
        matches!(self, PurchaseOrderStatus::Draft | PurchaseOrderStatus::Submitted)
    }
}

/// Purchase order line. Owned by its order; no lifecycle of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub product_ref: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_total: Money,
}

impl OrderItem {
    pub fn new(
        product_ref: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Result<Self, DomainError> {
        let product_ref = product_ref.into();
        if product_ref.trim().is_empty() {
            return Err(DomainError::validation("product reference is required"));
        }
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        let line_total = unit_price
            .checked_mul(quantity)
            .ok_or_else(|| DomainError::validation("line total overflows"))?;

        Ok(Self {
            id: OrderItemId::new(),
            product_ref,
            quantity,
            unit_price,
            line_total,
        })
    }

    fn recompute(&mut self) -> Result<(), DomainError> {
        self.line_total = self
            .unit_price
            .checked_mul(self.quantity)
            .ok_or_else(|| DomainError::validation("line total overflows"))?;
        Ok(())
    }
}

/// Approval metadata recorded when an order is approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// A locally-owned purchase order.
///
/// Order-management code mutates it through the methods below, each of which
/// bumps `version`. The sync pipeline only touches `remote_id`,
/// `last_synced_at` and `sync_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: OrderId,
    pub order_number: String,
    pub supplier_ref: String,
    pub items: Vec<OrderItem>,
    pub tax_rate: TaxRate,
    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,
    pub status: PurchaseOrderStatus,
    pub approval: Option<Approval>,
    pub requested_delivery_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,

    pub sync_status: SyncStatus,
    pub remote_id: Option<RemoteId>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Versioned for PurchaseOrder {
    fn version(&self) -> u64 {
        self.version
    }
}

impl PurchaseOrder {
    pub fn new(
        order_number: impl Into<String>,
        supplier_ref: impl Into<String>,
        items: Vec<OrderItem>,
        tax_rate: TaxRate,
    ) -> Result<Self, DomainError> {
        let order_number = order_number.into();
        let supplier_ref = supplier_ref.into();
        if order_number.trim().is_empty() {
            return Err(DomainError::validation("order number is required"));
        }
        if supplier_ref.trim().is_empty() {
            return Err(DomainError::validation("supplier reference is required"));
        }

        let now = Utc::now();
        let mut order = Self {
            id: OrderId::new(),
            order_number,
            supplier_ref,
            items,
            tax_rate,
            subtotal: Money::ZERO,
            tax: Money::ZERO,
            total: Money::ZERO,
            status: PurchaseOrderStatus::Draft,
            approval: None,
            requested_delivery_date: None,
            created_at: now,
            updated_at: now,
            version: 1,
            sync_status: SyncStatus::NotSynced,
            remote_id: None,
            last_synced_at: None,
        };
        order.recalculate_totals()?;
        Ok(order)
    }

    /// Recompute line totals, subtotal, tax and total from the items.
    pub fn recalculate_totals(&mut self) -> Result<(), DomainError> {
        let mut subtotal = Money::ZERO;
        for item in &mut self.items {
            item.recompute()?;
            subtotal = subtotal
                .checked_add(item.line_total)
                .ok_or_else(|| DomainError::validation("subtotal overflows"))?;
        }
        let tax = self.tax_rate.apply(subtotal);
        self.subtotal = subtotal;
        self.tax = tax;
        self.total = subtotal
            .checked_add(tax)
            .ok_or_else(|| DomainError::validation("total overflows"))?;
        Ok(())
    }

    pub fn item(&self, item_id: OrderItemId) -> Option<&OrderItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn add_item(&mut self, item: OrderItem) -> Result<(), DomainError> {
        self.ensure_editable()?;
        self.items.push(item);
        self.recalculate_totals()?;
        self.touch();
        Ok(())
    }

    pub fn set_item_quantity(
        &mut self,
        item_id: OrderItemId,
        quantity: u32,
    ) -> Result<(), DomainError> {
        self.ensure_editable()?;
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        let item = self
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(DomainError::not_found)?;
        item.quantity = quantity;
        self.recalculate_totals()?;
        self.touch();
        Ok(())
    }

    pub fn remove_item(&mut self, item_id: OrderItemId) -> Result<(), DomainError> {
        self.ensure_editable()?;
        let before = self.items.len();
        self.items.retain(|i| i.id != item_id);
        if self.items.len() == before {
            return Err(DomainError::not_found());
        }
        self.recalculate_totals()?;
        self.touch();
        Ok(())
    }

    pub fn set_requested_delivery_date(&mut self, date: Option<NaiveDate>) {
        self.requested_delivery_date = date;
        self.touch();
    }

    pub fn submit(&mut self) -> Result<(), DomainError> {
        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invariant("only draft purchase orders can be submitted"));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation(
                "cannot submit purchase order without lines",
            ));
        }
        self.status = PurchaseOrderStatus::Submitted;
        self.touch();
        Ok(())
    }

    pub fn approve(
        &mut self,
        approved_by: impl Into<String>,
        notes: Option<String>,
    ) -> Result<(), DomainError> {
        if !self.status.is_editable() {
            return Err(DomainError::invariant(
                "only draft or submitted purchase orders can be approved",
            ));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation(
                "cannot approve purchase order without lines",
            ));
        }
        self.status = PurchaseOrderStatus::Approved;
        self.approval = Some(Approval {
            approved_by: approved_by.into(),
            approved_at: Utc::now(),
            notes,
        });
        self.touch();
        Ok(())
    }

    pub fn receive(&mut self) -> Result<(), DomainError> {
        if self.status != PurchaseOrderStatus::Approved {
            return Err(DomainError::invariant(
                "cannot receive goods before purchase order is approved",
            ));
        }
        self.status = PurchaseOrderStatus::Received;
        self.touch();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), DomainError> {
        if matches!(
            self.status,
            PurchaseOrderStatus::Received | PurchaseOrderStatus::Cancelled
        ) {
            return Err(DomainError::invariant(
                "received or cancelled purchase orders cannot be cancelled",
            ));
        }
        self.status = PurchaseOrderStatus::Cancelled;
        self.touch();
        Ok(())
    }

    /// Record a local mutation: bump the version and, if the order was in
    /// sync, flag it for the next sync pass.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
        if self.sync_status == SyncStatus::Synced {
            self.sync_status = SyncStatus::PendingSync;
        }
    }

    pub fn mark_synced(&mut self, remote_id: RemoteId, at: DateTime<Utc>) {
        self.remote_id = Some(remote_id);
        self.last_synced_at = Some(at);
        self.sync_status = SyncStatus::Synced;
    }

    fn ensure_editable(&self) -> Result<(), DomainError> {
        if !self.status.is_editable() {
            return Err(DomainError::invariant(
                "cannot modify purchase order once approved, received or cancelled",
            ));
        }
        Ok(())
    }
}
