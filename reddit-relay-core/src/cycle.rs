//! One fetch-filter-enqueue pass for a single rule.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::approval::ApprovalGateway;
use crate::contract::{DedupStore, SourceClient};
use crate::error::CycleError;
use crate::lifecycle::LifecycleManager;
use crate::model::{PostId, Rule};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub skipped_text: usize,
    pub duplicates: usize,
    pub submitted: Vec<PostId>,
}

pub struct CycleRunner {
    source: Arc<dyn SourceClient>,
    dedup: Arc<dyn DedupStore>,
    lifecycle: Arc<LifecycleManager>,
    gateway: Arc<ApprovalGateway>,
}

impl CycleRunner {
    pub fn new(
        source: Arc<dyn SourceClient>,
        dedup: Arc<dyn DedupStore>,
        lifecycle: Arc<LifecycleManager>,
        gateway: Arc<ApprovalGateway>,
    ) -> Self {
        CycleRunner {
            source,
            dedup,
            lifecycle,
            gateway,
        }
    }

    /// Fetch up to `rule.max_items` candidates, drop text posts and anything already
    /// seen for this rule, and hand the rest to the approval gateway.
    ///
    /// Fetch and dedup-store failures abort the cycle. Items processed before the
    /// failure keep their records.
    pub async fn run(&self, rule: &Rule) -> Result<CycleReport, CycleError> {
        let items = self.source.fetch_candidates(rule).await?;
        let mut report = CycleReport {
            fetched: items.len(),
            ..CycleReport::default()
        };
        debug!(rule_id = rule.id, fetched = report.fetched, "[CYCLE] Candidates fetched");

        let seen_at = Utc::now();
        for item in items.into_iter().take(rule.max_items as usize) {
            if !item.media_type.is_media() {
                report.skipped_text += 1;
                continue;
            }
            if !self.dedup.is_new(rule.id, &item.id, seen_at).await? {
                report.duplicates += 1;
                continue;
            }
            let Some(post) = self.lifecycle.discover(rule, item, seen_at).await? else {
                report.duplicates += 1;
                continue;
            };
            let post = self.gateway.present(rule, post).await?;
            report.submitted.push(post.id);
        }

        info!(
            rule_id = rule.id,
            subreddit = %rule.subreddit,
            fetched = report.fetched,
            duplicates = report.duplicates,
            skipped_text = report.skipped_text,
            submitted = report.submitted.len(),
            "[CYCLE] Cycle complete"
        );
        Ok(report)
    }
}
