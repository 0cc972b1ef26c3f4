//! 重複・連投フィルタ
//!
//! 正規化テキストのハッシュ集合でグローバルな完全一致を、
//! ユーザーごとの直近 N 件との編集距離で近似一致を判定する。
//! いずれも 1 イベントあたり償却 O(1)（N と比較長は定数上限）。

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// 重複判定のポリシー
#[derive(Debug, Clone)]
pub struct DuplicatePolicy {
    /// ユーザーごとに保持する直近件数
    pub per_user_window: usize,
    /// 保持期間
    pub global_window: Duration,
    /// 近似一致とみなす類似度（0〜1）
    pub similarity_threshold: f64,
    /// 編集距離計算に使う最大文字数
    pub max_compare_len: usize,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            per_user_window: 10,
            global_window: Duration::seconds(30),
            similarity_threshold: 0.8,
            max_compare_len: 200,
        }
    }
}

#[derive(Debug, Clone)]
struct RecentText {
    normalized: String,
    skeleton: String,
    seen_at: DateTime<Utc>,
}

/// 重複フィルタ
#[derive(Debug)]
pub struct DuplicateFilter {
    policy: DuplicatePolicy,
    /// 正規化テキスト -> 最終出現時刻
    global: HashMap<String, DateTime<Utc>>,
    /// 期限切れ判定用の挿入順
    order: VecDeque<(String, DateTime<Utc>)>,
    per_user: HashMap<String, VecDeque<RecentText>>,
    checks_since_prune: usize,
}

/// 大小文字・句読点・空白を畳み込む
pub fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 空白を除き、連続する同一文字を 1 文字にまとめる（"wowww" と "wow" を同一視）
fn skeleton(normalized: &str) -> String {
    let mut out = String::with_capacity(normalized.len());
    let mut last = None;
    for c in normalized.chars().filter(|c| !c.is_whitespace()) {
        if last != Some(c) {
            out.push(c);
        }
        last = Some(c);
    }
    out
}

/// 文字数上限付きのレーベンシュタイン類似度
fn similarity(a: &str, b: &str, max_len: usize) -> f64 {
    let a: Vec<char> = a.chars().take(max_len).collect();
    let b: Vec<char> = b.chars().take(max_len).collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    1.0 - previous[b.len()] as f64 / longest as f64
}

impl DuplicateFilter {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            global: HashMap::new(),
            order: VecDeque::new(),
            per_user: HashMap::new(),
            checks_since_prune: 0,
        }
    }

    pub fn policy(&self) -> &DuplicatePolicy {
        &self.policy
    }

    /// 重複かどうかを判定し、結果に関わらずウィンドウへ登録する
    pub fn check_and_insert(&mut self, user_id: &str, text: &str, now: DateTime<Utc>) -> bool {
        self.evict_expired(now);

        let normalized = normalize(text);
        if normalized.is_empty() {
            return false;
        }
        let skeleton = skeleton(&normalized);

        let exact = self.global.contains_key(&normalized);
        let near = !exact && self.matches_user_history(user_id, &normalized, &skeleton, now);

        if exact || near {
            debug!(user_id, exact, text = %normalized, "🔁 Duplicate comment");
        }

        self.global.insert(normalized.clone(), now);
        self.order.push_back((normalized.clone(), now));

        let history = self.per_user.entry(user_id.to_string()).or_default();
        if history.len() == self.policy.per_user_window {
            history.pop_front();
        }
        history.push_back(RecentText {
            normalized,
            skeleton,
            seen_at: now,
        });

        self.maybe_prune_users(now);
        exact || near
    }

    fn matches_user_history(
        &self,
        user_id: &str,
        normalized: &str,
        skeleton: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(history) = self.per_user.get(user_id) else {
            return false;
        };
        let cutoff = now - self.policy.global_window;
        history.iter().filter(|recent| recent.seen_at >= cutoff).any(|recent| {
            recent.skeleton == skeleton
                || similarity(&recent.normalized, normalized, self.policy.max_compare_len)
                    >= self.policy.similarity_threshold
        })
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.policy.global_window;
        while let Some((text, seen_at)) = self.order.front() {
            if *seen_at >= cutoff {
                break;
            }
            // 同じテキストがより新しく登録されていれば残す
            if self.global.get(text).is_some_and(|latest| latest == seen_at) {
                self.global.remove(text);
            }
            self.order.pop_front();
        }
    }

    fn maybe_prune_users(&mut self, now: DateTime<Utc>) {
        self.checks_since_prune += 1;
        if self.checks_since_prune < 256 {
            return;
        }
        self.checks_since_prune = 0;

        let cutoff = now - self.policy.global_window;
        self.per_user.retain(|_, history| {
            while history.front().is_some_and(|recent| recent.seen_at < cutoff) {
                history.pop_front();
            }
            !history.is_empty()
        });
    }

    /// 追跡中のテキスト数
    pub fn tracked_texts(&self) -> usize {
        self.global.len()
    }

    pub fn clear(&mut self) {
        self.global.clear();
        self.order.clear();
        self.per_user.clear();
        self.checks_since_prune = 0;
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_normalize_folds_case_and_punctuation() {
        assert_eq!(normalize("  Giá   bao NHIÊU?!  "), "giá bao nhiêu");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn test_identical_text_is_duplicate() {
        let mut filter = DuplicateFilter::default();
        assert!(!filter.check_and_insert("u1", "How much?", t0()));
        assert!(filter.check_and_insert("u1", "how much", t0() + Duration::seconds(1)));
    }

    #[test]
    fn test_exact_match_is_global_across_users() {
        let mut filter = DuplicateFilter::default();
        assert!(!filter.check_and_insert("u1", "ship to hanoi?", t0()));
        assert!(filter.check_and_insert("u2", "Ship to Hanoi?", t0()));
    }

    #[test]
    fn test_near_match_only_within_same_user() {
        let mut filter = DuplicateFilter::default();
        assert!(!filter.check_and_insert("u1", "this is so beautiful", t0()));
        assert!(filter.check_and_insert("u1", "this is so beautifull", t0()));
        assert!(!filter.check_and_insert("u2", "this is so beautiful!!x", t0()));
    }

    #[test]
    fn test_repeated_letters_collapse() {
        let mut filter = DuplicateFilter::default();
        assert!(!filter.check_and_insert("u1", "wow", t0()));
        assert!(filter.check_and_insert("u1", "wowwwww", t0()));
    }

    #[test]
    fn test_window_expiry() {
        let mut filter = DuplicateFilter::default();
        assert!(!filter.check_and_insert("u1", "hello shop", t0()));
        assert_eq!(filter.tracked_texts(), 1);
        let later = t0() + Duration::seconds(31);
        assert!(!filter.check_and_insert("u2", "hello shop", later));
    }

    #[test]
    fn test_empty_text_never_duplicate() {
        let mut filter = DuplicateFilter::default();
        assert!(!filter.check_and_insert("u1", "...", t0()));
        assert!(!filter.check_and_insert("u1", "...", t0()));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("abc", "abc", 200), 1.0);
        assert_eq!(similarity("abc", "xyz", 200), 0.0);
        assert_eq!(similarity("", "", 200), 1.0);
    }
}
