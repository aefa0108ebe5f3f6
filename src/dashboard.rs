use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use crate::models::{Connection, ConnectionStatus, Platform, PostStatus, ScheduledPost};

pub fn group_by_date(posts: &[ScheduledPost]) -> BTreeMap<NaiveDate, Vec<&ScheduledPost>> {
    let mut days: BTreeMap<NaiveDate, Vec<&ScheduledPost>> = BTreeMap::new();
    for post in posts {
        days.entry(post.scheduled_date).or_default().push(post);
    }
    for day in days.values_mut() {
        day.sort_by_key(|p| (p.scheduled_at, p.platform));
    }
    days
}

// half-open: [from, from + days)
pub fn upcoming(posts: &[ScheduledPost], from: NaiveDate, days: u64) -> Vec<&ScheduledPost> {
    let until = from.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX);
    let mut selected: Vec<&ScheduledPost> = posts
        .iter()
        .filter(|p| p.scheduled_date >= from && p.scheduled_date < until)
        .filter(|p| matches!(p.status, PostStatus::Draft | PostStatus::Scheduled))
        .collect();
    selected.sort_by_key(|p| (p.scheduled_date, p.scheduled_at));
    selected
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSummary {
    pub platform: Platform,
    pub connected: bool,
    pub status: Option<ConnectionStatus>,
    pub accounts: Vec<String>,
    pub scheduled: usize,
    pub published: usize,
    pub failed: usize,
}

pub fn platform_summaries(connections: &[Connection], posts: &[ScheduledPost]) -> Vec<PlatformSummary> {
    Platform::ALL
        .iter()
        .map(|&platform| {
            let linked: Vec<&Connection> = connections
                .iter()
                .filter(|c| c.platform() == platform)
                .collect();
            let status = linked
                .iter()
                .find(|c| c.is_active())
                .or_else(|| linked.first())
                .map(|c| c.info().status);
            let count = |status: PostStatus| {
                posts
                    .iter()
                    .filter(|p| p.platform == platform && p.status == status)
                    .count()
            };
            PlatformSummary {
                platform,
                connected: linked.iter().any(|c| c.is_active()),
                status,
                accounts: linked.iter().map(|c| c.info().display_name.clone()).collect(),
                scheduled: count(PostStatus::Scheduled),
                published: count(PostStatus::Published),
                failed: count(PostStatus::Failed),
            }
        })
        .collect()
}
