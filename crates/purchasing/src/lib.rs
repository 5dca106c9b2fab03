//! Purchase order model and its mapping to the remote ERP's records.

pub mod order;
pub mod remote;

pub use order::{Approval, OrderItem, PurchaseOrder, PurchaseOrderStatus};
pub use remote::{
    ErpRecord, LINE_MODEL, ORDER_MODEL, RecordError, RemoteOrder, RemoteOrderLine, fields,
    format_erp_datetime, line_values, order_values, parse_erp_datetime,
};
