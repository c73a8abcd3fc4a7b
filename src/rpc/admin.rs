//! Operator-facing admin surface: lets a human or a script force an
//! immediate reconciler pass instead of waiting for the next interval tick.

use std::sync::Arc;

use rocket::serde::json::{json, Json, Value};
use rocket::{post, State};

use crate::reconciler::Reconciler;

#[post("/v1/admin/reconcile")]
pub fn force_reconcile(reconciler: &State<Arc<Reconciler>>) -> Json<Value> {
    reconciler.trigger_scan();
    Json(json!({ "status": "triggered" }))
}
