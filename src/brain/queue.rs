//! 有界優先度キュー
//!
//! 優先度降順、同一優先度内は挿入順（FIFO）。
//! 溢れた場合は最低優先度の最古エントリを、新規の優先度が厳密に高いときだけ追い出す。

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use super::event::CommentEvent;
use super::scorer::Priority;

/// キュー待ちのエントリ
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub event: Arc<CommentEvent>,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// 挿入順の通し番号
    pub seq: u64,
}

impl PendingEntry {
    pub fn new(event: Arc<CommentEvent>, priority: Priority, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            event,
            priority,
            enqueued_at,
            seq: 0,
        }
    }

    pub fn residency(&self, now: DateTime<Utc>) -> Duration {
        now - self.enqueued_at
    }
}

/// キュー操作のエラー
#[derive(Debug)]
pub enum QueueError {
    /// 容量いっぱい（挿入できなかったエントリを返す）
    Full(PendingEntry),
}

/// 有界優先度キュー
#[derive(Debug)]
pub struct BoundedPriorityQueue {
    buckets: BTreeMap<Priority, VecDeque<PendingEntry>>,
    len: usize,
    capacity: usize,
    next_seq: u64,
    high_water_mark: usize,
}

impl BoundedPriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            len: 0,
            capacity,
            next_seq: 0,
            high_water_mark: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 過去最大の滞留数
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// エントリを挿入する（満杯なら Full）
    pub fn insert(&mut self, mut entry: PendingEntry) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::Full(entry));
        }
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.buckets.entry(entry.priority).or_default().push_back(entry);
        self.len += 1;
        self.high_water_mark = self.high_water_mark.max(self.len);
        Ok(())
    }

    /// 最高優先度の最古エントリを取り出す
    pub fn pop_highest(&mut self) -> Option<PendingEntry> {
        let mut bucket = self.buckets.last_entry()?;
        let entry = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        if entry.is_some() {
            self.len -= 1;
        }
        entry
    }

    pub fn peek_highest(&self) -> Option<&PendingEntry> {
        self.buckets.values().next_back().and_then(|bucket| bucket.front())
    }

    pub fn lowest_priority(&self) -> Option<Priority> {
        self.buckets.keys().next().copied()
    }

    /// 新規の優先度が最低滞留より厳密に高い場合のみ、最低優先度の最古エントリを追い出す
    pub fn evict_lowest_if_lower(&mut self, new_priority: Priority) -> Option<PendingEntry> {
        let mut bucket = self.buckets.first_entry()?;
        if *bucket.key() >= new_priority {
            return None;
        }
        let evicted = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        if evicted.is_some() {
            self.len -= 1;
        }
        evicted
    }

    /// 滞留時間が上限を超えたエントリを取り除いて返す（挿入順）
    pub fn expire(&mut self, now: DateTime<Utc>, max_residency: Duration) -> Vec<PendingEntry> {
        let mut expired = Vec::new();
        for bucket in self.buckets.values_mut() {
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = bucket
                .drain(..)
                .partition(|entry| entry.residency(now) > max_residency);
            *bucket = fresh;
            expired.extend(stale);
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        self.len -= expired.len();
        expired.sort_by_key(|entry| entry.seq);
        expired
    }

    /// 全エントリを優先度順に取り出す
    pub fn drain_all(&mut self) -> Vec<PendingEntry> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(entry) = self.pop_highest() {
            drained.push(entry);
        }
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.buckets.values().rev().flat_map(|bucket| bucket.iter())
    }
}
