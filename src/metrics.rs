#![forbid(unsafe_code)]
//! Optional per-group instrumentation.
//!
//! When `Options::enable_metrics` is set the group records a descriptive
//! string and duration for every query run through the facade, plus
//! per-transaction timings. Sample buffers are capped; totals are not.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

const MAX_QUERY_SAMPLES: usize = 1000;
const MAX_TRANSACTION_SAMPLES: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct QueryInfo {
    /// Human-readable form of the query, e.g. `count(Equal, 42)`.
    pub description: String,
    pub table: String,
    pub duration_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub kind: TransactionKind,
    pub duration_us: u64,
    /// For write transactions: false means rolled back.
    pub committed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub total_queries: u64,
    pub total_read_transactions: u64,
    pub total_write_transactions: u64,
    pub total_commits: u64,
    pub total_rollbacks: u64,
    queries: VecDeque<QueryInfo>,
    transactions: VecDeque<TransactionInfo>,
}

impl Metrics {
    pub fn record_query(&mut self, description: String, table: String, duration: Duration) {
        self.total_queries += 1;
        if self.queries.len() >= MAX_QUERY_SAMPLES {
            self.queries.pop_front();
        }
        self.queries.push_back(QueryInfo {
            description,
            table,
            duration_us: duration.as_micros() as u64,
        });
    }

    pub fn record_read_transaction(&mut self, duration: Duration) {
        self.total_read_transactions += 1;
        self.push_transaction(TransactionInfo {
            kind: TransactionKind::Read,
            duration_us: duration.as_micros() as u64,
            committed: true,
        });
    }

    pub fn record_write_transaction(&mut self, duration: Duration, committed: bool) {
        self.total_write_transactions += 1;
        if committed {
            self.total_commits += 1;
        } else {
            self.total_rollbacks += 1;
        }
        self.push_transaction(TransactionInfo {
            kind: TransactionKind::Write,
            duration_us: duration.as_micros() as u64,
            committed,
        });
    }

    fn push_transaction(&mut self, info: TransactionInfo) {
        if self.transactions.len() >= MAX_TRANSACTION_SAMPLES {
            self.transactions.pop_front();
        }
        self.transactions.push_back(info);
    }

    pub fn recent_queries(&self) -> impl Iterator<Item = &QueryInfo> {
        self.queries.iter()
    }

    pub fn recent_transactions(&self) -> impl Iterator<Item = &TransactionInfo> {
        self.transactions.iter()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
