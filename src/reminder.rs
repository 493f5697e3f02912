//! Scheduled scan for items nearing their deadline.
//!
//! Windows are aligned to calendar days so an item does not drift in and out
//! of scope as the trigger fires several times a day. An owner is only ever
//! marked as notified after a device actually accepted the message.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::Instrument;

use crate::{
    dispatch::DispatchEngine,
    model::{DueItem, PushPayload, ThrottleEntry},
    push::{DeliveryOptions, Urgency},
    store::{DueItemSource, SubscriptionStore, ThrottleLedger},
};

const REMINDER_TITLE: &str = "Library reminder";
const ITEM_URL_PREFIX: &str = "/library";
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Longest lookahead a pass accepts.
pub const MAX_LOOKAHEAD_DAYS: u32 = 366;

#[derive(Debug, thiserror::Error)]
#[error("lookahead must be at most {} days, got {0}", MAX_LOOKAHEAD_DAYS)]
pub struct LookaheadTooLong(pub u32);

pub fn checked_lookahead(days: u32) -> Result<u32, LookaheadTooLong> {
    if days > MAX_LOOKAHEAD_DAYS {
        return Err(LookaheadTooLong(days));
    }
    Ok(days)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// `[start of today, end of today + lookahead_days]` in the given offset.
/// Lookaheads past [`MAX_LOOKAHEAD_DAYS`] are clamped.
pub fn scan_window(now: DateTime<Utc>, offset: &FixedOffset, lookahead_days: u32) -> ScanWindow {
    let lookahead_days = lookahead_days.min(MAX_LOOKAHEAD_DAYS);
    let local_midnight = now
        .with_timezone(offset)
        .date_naive()
        .and_time(NaiveTime::MIN);
    let start = Utc.from_utc_datetime(
        &(local_midnight - Duration::seconds(offset.local_minus_utc().into())),
    );
    let end = start + Duration::days(i64::from(lookahead_days) + 1) - Duration::milliseconds(1);

    ScanWindow { start, end }
}

/// Whole days from the start of the window to the deadline, rounded up.
pub fn days_left(deadline: DateTime<Utc>, window_start: DateTime<Utc>) -> i64 {
    let ms = (deadline - window_start).num_milliseconds();
    if ms > 0 {
        (ms + MS_PER_DAY - 1) / MS_PER_DAY
    } else {
        // Truncation rounds negative values toward zero, which is the ceiling.
        ms / MS_PER_DAY
    }
}

pub fn reminder_body(label: &str, days_left: i64) -> String {
    match days_left {
        d if d <= 0 => format!("Your book \"{}\" is due today. Please return it.", label),
        1 => format!("You have 1 day left to return \"{}\".", label),
        d => format!("You have {} days left to return \"{}\".", d, label),
    }
}

pub fn should_notify(
    entry: Option<&ThrottleEntry>,
    now: DateTime<Utc>,
    throttle_interval: Duration,
    force: bool,
) -> bool {
    match entry {
        _ if force => true,
        None => true,
        Some(entry) => now - entry.last_notified_at >= throttle_interval,
    }
}

pub fn reminder_payload(item: &DueItem, owner_id: &str, days_left: i64) -> PushPayload {
    PushPayload {
        title: REMINDER_TITLE.to_string(),
        body: reminder_body(&item.label, days_left),
        url: format!("{}/{}", ITEM_URL_PREFIX, item.id),
        meta: Some(json!({ "subjectId": item.id, "daysLeft": days_left })),
        tag: Some(format!("due-{}-{}", owner_id, item.id)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PassOptions {
    pub now: DateTime<Utc>,
    pub lookahead_days: u32,
    pub throttle_interval: Duration,
    pub force: bool,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Sent,
    Skipped,
    Error,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_left: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ItemResult {
    fn skipped(item_id: &str, days_left: Option<i64>, reason: impl Into<String>) -> Self {
        ItemResult {
            item_id: item_id.to_string(),
            status: ItemStatus::Skipped,
            days_left,
            sent_count: None,
            reason: Some(reason.into()),
        }
    }

    fn error(item_id: &str, days_left: Option<i64>, reason: impl Into<String>) -> Self {
        ItemResult {
            item_id: item_id.to_string(),
            status: ItemStatus::Error,
            days_left,
            sent_count: None,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of one pass. `notified` counts items, not endpoints: one per
/// (owner, subject) pair that reached at least one device.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PassReport {
    pub checked: usize,
    pub notified: usize,
    pub results: Vec<ItemResult>,
}

pub struct ReminderScanner {
    engine: Arc<DispatchEngine>,
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn ThrottleLedger>,
    items: Arc<dyn DueItemSource>,
    offset: FixedOffset,
    ttl: u32,
}

impl ReminderScanner {
    pub fn new(
        engine: Arc<DispatchEngine>,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn ThrottleLedger>,
        items: Arc<dyn DueItemSource>,
        offset: FixedOffset,
        ttl: u32,
    ) -> Self {
        ReminderScanner {
            engine,
            subscriptions,
            ledger,
            items,
            offset,
            ttl,
        }
    }

    pub async fn run_due_reminder_pass(&self, options: PassOptions) -> Result<PassReport> {
        checked_lookahead(options.lookahead_days)?;
        let window = scan_window(options.now, &self.offset, options.lookahead_days);
        let span = tracing::info_span!(
            "reminder_pass",
            window_start = %window.start,
            window_end = %window.end,
            force = options.force
        );

        async move {
            let due = self.items.find_due(window.start, window.end).await?;
            tracing::info!(count = due.len(), "Found due items.");

            let mut results = Vec::with_capacity(due.len());
            for item in &due {
                results.push(self.process_item(item, window, &options).await);
            }

            let notified = results
                .iter()
                .filter(|r| r.status == ItemStatus::Sent)
                .count();
            tracing::info!(checked = due.len(), notified, "Reminder pass finished.");

            Ok(PassReport {
                checked: due.len(),
                notified,
                results,
            })
        }
        .instrument(span)
        .await
    }

    /// Immediate reminder for a freshly created item. Follows the same window
    /// and throttle rules as a scheduled pass, without `force`.
    pub async fn notify_item(
        &self,
        item: &DueItem,
        now: DateTime<Utc>,
        lookahead_days: u32,
        throttle_interval: Duration,
    ) -> ItemResult {
        let window = scan_window(now, &self.offset, lookahead_days);
        if item.deadline < window.start || item.deadline > window.end {
            return ItemResult::skipped(&item.id, None, "outside reminder window");
        }

        let options = PassOptions {
            now,
            lookahead_days,
            throttle_interval,
            force: false,
        };
        self.process_item(item, window, &options).await
    }

    async fn process_item(
        &self,
        item: &DueItem,
        window: ScanWindow,
        options: &PassOptions,
    ) -> ItemResult {
        let owner_id = match item.owner_id.as_deref() {
            Some(owner) => owner,
            None => return ItemResult::skipped(&item.id, None, "missing owner"),
        };
        let span = tracing::info_span!("item", item_id = %item.id, %owner_id);

        async move {
            let days_left = days_left(item.deadline, window.start);

            match self.try_notify(item, owner_id, days_left, options).await {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!(?error, "Could not process due item.");
                    ItemResult::error(&item.id, Some(days_left), error.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_notify(
        &self,
        item: &DueItem,
        owner_id: &str,
        days_left: i64,
        options: &PassOptions,
    ) -> Result<ItemResult> {
        let entry = self.ledger.get(owner_id, &item.id).await?;
        if !should_notify(entry.as_ref(), options.now, options.throttle_interval, options.force) {
            let reason = match &entry {
                Some(entry) => format!(
                    "throttled (lastNotifiedAt={})",
                    entry.last_notified_at.to_rfc3339()
                ),
                None => "throttled".to_string(),
            };
            tracing::info!(%reason, "Skipping reminder.");
            return Ok(ItemResult::skipped(&item.id, Some(days_left), reason));
        }

        let subscriptions: Vec<_> = self
            .subscriptions
            .find_by_user(owner_id)
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect();
        if subscriptions.is_empty() {
            tracing::info!("Owner has no live subscriptions; not recording a reminder.");
            return Ok(ItemResult::skipped(&item.id, Some(days_left), "no devices found"));
        }

        let payload = reminder_payload(item, owner_id, days_left);
        let delivery = DeliveryOptions {
            ttl: self.ttl,
            urgency: Urgency::High,
        };
        let report = self
            .engine
            .dispatch_with(subscriptions, &payload, &delivery)
            .await;

        if report.sent_count == 0 {
            tracing::info!("No device accepted the reminder; not recording it.");
            return Ok(ItemResult::skipped(
                &item.id,
                Some(days_left),
                "no devices accepted (sentCount=0)",
            ));
        }

        self.ledger.record(owner_id, &item.id, options.now).await?;

        Ok(ItemResult {
            item_id: item.id.clone(),
            status: ItemStatus::Sent,
            days_left: Some(days_left),
            sent_count: Some(report.sent_count),
            reason: None,
        })
    }
}
