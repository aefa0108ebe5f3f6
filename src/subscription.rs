use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{self, Backend};
use crate::models::{BillingRecord, CreateSubscription, Plan, Records, SubscriptionStatus};

#[derive(Deserialize)]
#[serde(untagged)]
enum Plans {
    Wrapped { plans: Records<Plan> },
    Bare(Records<Plan>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BillingHistory {
    Wrapped {
        #[serde(alias = "invoices", alias = "history")]
        billing_history: Records<BillingRecord>,
    },
    Bare(Records<BillingRecord>),
}

pub struct SubscriptionService {
    backend: Arc<dyn Backend>,
}

impl SubscriptionService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn plans(&self) -> Result<Vec<Plan>> {
        let value = self
            .backend
            .fetch_resource(Method::GET, "/api/subscription/plans", None)
            .context("subscription: load plans")?;
        let Records(plans) = match api::decode(value).context("subscription: decode plans")? {
            Plans::Wrapped { plans } => plans,
            Plans::Bare(plans) => plans,
        };
        Ok(plans)
    }

    pub fn status(&self) -> Result<SubscriptionStatus> {
        let value = self
            .backend
            .fetch_resource(Method::GET, "/api/subscription/status", None)
            .context("subscription: load status")?;
        if value.is_null() {
            return Ok(SubscriptionStatus::default());
        }
        let value = match value {
            Value::Object(mut map) if map.contains_key("subscription") => {
                map.remove("subscription").unwrap_or(Value::Null)
            }
            other => other,
        };
        if value.is_null() {
            return Ok(SubscriptionStatus {
                status: "none".into(),
                ..SubscriptionStatus::default()
            });
        }
        api::decode(value).context("subscription: decode status")
    }

    pub fn create(&self, plan_id: &str) -> Result<Value> {
        if plan_id.trim().is_empty() {
            bail!("subscription: plan id required");
        }
        let body = serde_json::to_value(CreateSubscription {
            plan_id: plan_id.trim().to_string(),
        })
        .context("subscription: encode request")?;
        self.backend
            .fetch_resource(Method::POST, "/api/subscription/create", Some(&body))
            .context("subscription: create")
    }

    pub fn cancel(&self) -> Result<Value> {
        self.backend
            .fetch_resource(Method::POST, "/api/subscription/cancel", None)
            .context("subscription: cancel")
    }

    pub fn billing_history(&self) -> Result<Vec<BillingRecord>> {
        let value = self
            .backend
            .fetch_resource(Method::GET, "/api/subscription/billing-history", None)
            .context("subscription: load billing history")?;
        let Records(records) = match api::decode(value).context("subscription: decode billing history")? {
            BillingHistory::Wrapped { billing_history } => billing_history,
            BillingHistory::Bare(records) => records,
        };
        Ok(records)
    }
}
