//! # Notices: deduped observable events.
//!
//! A [`Notice`] records that something observable happened. Notices dedupe
//! by `(user id, type, key)`: recording an occurrence of an existing
//! notice bumps its repeat count and timestamps instead of growing the
//! set. Expired notices are dropped by [`State::prune`](crate::state::State::prune).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::types::duration_opt;
use crate::state::store::State;

/// Default time a notice is kept after its last occurrence.
pub(crate) const DEFAULT_NOTICE_EXPIRE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Warnings repeat at most once a day and are kept for 28 days.
const WARNING_REPEAT_AFTER: Duration = Duration::from_secs(24 * 3600);
const WARNING_EXPIRE_AFTER: Duration = Duration::from_secs(28 * 24 * 3600);

/// Kind of a notice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NoticeType {
    /// A change's status moved; the notice key is the change id.
    ChangeUpdate,
    /// A human-facing warning; the notice key is the message.
    Warning,
    /// Any other notice kind published by a manager or extension.
    Custom(String),
}

impl NoticeType {
    pub fn as_str(&self) -> &str {
        match self {
            NoticeType::ChangeUpdate => "change-update",
            NoticeType::Warning => "warning",
            NoticeType::Custom(s) => s,
        }
    }
}

impl From<&str> for NoticeType {
    fn from(s: &str) -> Self {
        match s {
            "change-update" => NoticeType::ChangeUpdate,
            "warning" => NoticeType::Warning,
            other => NoticeType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for NoticeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for NoticeType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NoticeType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(NoticeType::from(raw.as_str()))
    }
}

/// Dedupe key of a notice.
pub(crate) type NoticeKey = (Option<u32>, NoticeType, String);

/// A deduped observable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Notice {
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) user_id: Option<u32>,
    #[serde(rename = "type")]
    pub(crate) notice_type: NoticeType,
    pub(crate) key: String,
    pub(crate) first_occurred: DateTime<Utc>,
    pub(crate) last_occurred: DateTime<Utc>,
    pub(crate) last_repeated: DateTime<Utc>,
    pub(crate) occurrences: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) data: BTreeMap<String, String>,
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub(crate) repeat_after: Option<Duration>,
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub(crate) expire_after: Option<Duration>,
}

impl Notice {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<u32> {
        self.user_id
    }

    pub fn notice_type(&self) -> &NoticeType {
        &self.notice_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    pub fn last_occurred(&self) -> DateTime<Utc> {
        self.last_occurred
    }

    pub fn last_repeated(&self) -> DateTime<Utc> {
        self.last_repeated
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    pub(crate) fn expired(&self, now: DateTime<Utc>) -> bool {
        let expire = self.expire_after.unwrap_or(DEFAULT_NOTICE_EXPIRE);
        match chrono::Duration::from_std(expire) {
            Ok(expire) => self.last_occurred + expire < now,
            Err(_) => false,
        }
    }

    pub(crate) fn dedupe_key(&self) -> NoticeKey {
        (self.user_id, self.notice_type.clone(), self.key.clone())
    }
}

/// Optional settings for [`State::record_notice_with`].
#[derive(Debug, Clone, Default)]
pub struct NoticeOptions {
    /// Minimum interval before `last-repeated` is bumped again.
    pub repeat_after: Option<Duration>,
    /// How long the notice is kept after its last occurrence.
    pub expire_after: Option<Duration>,
}

impl State {
    /// Records an occurrence of a notice, deduping by
    /// `(user id, type, key)`. Returns the notice id.
    pub fn record_notice(
        &mut self,
        user_id: Option<u32>,
        notice_type: NoticeType,
        key: &str,
        data: BTreeMap<String, String>,
    ) -> String {
        self.record_notice_with(user_id, notice_type, key, data, NoticeOptions::default())
    }

    /// Records an occurrence of a notice with explicit repeat/expiry
    /// settings.
    pub fn record_notice_with(
        &mut self,
        user_id: Option<u32>,
        notice_type: NoticeType,
        key: &str,
        data: BTreeMap<String, String>,
        options: NoticeOptions,
    ) -> String {
        self.writing();
        let now = Utc::now();
        let dedupe: NoticeKey = (user_id, notice_type.clone(), key.to_string());

        if let Some(notice) = self.notices.get_mut(&dedupe) {
            notice.occurrences += 1;
            notice.last_occurred = now;
            let repeat_after = options.repeat_after.or(notice.repeat_after);
            let due = match repeat_after.and_then(|d| chrono::Duration::from_std(d).ok()) {
                Some(interval) => notice.last_repeated + interval <= now,
                None => true,
            };
            if due {
                notice.last_repeated = now;
            }
            if !data.is_empty() {
                notice.data = data;
            }
            notice.repeat_after = repeat_after;
            if options.expire_after.is_some() {
                notice.expire_after = options.expire_after;
            }
            let id = notice.id.clone();
            self.refresh_latest_warning_time();
            return id;
        }

        let id = self.next_notice_id();
        let notice = Notice {
            id: id.clone(),
            user_id,
            notice_type,
            key: key.to_string(),
            first_occurred: now,
            last_occurred: now,
            last_repeated: now,
            occurrences: 1,
            data,
            repeat_after: options.repeat_after,
            expire_after: options.expire_after,
        };
        self.notices.insert(dedupe, notice);
        self.refresh_latest_warning_time();
        id
    }

    /// Records a warning notice with the standard repeat and expiry
    /// windows.
    pub fn warn(&mut self, message: &str) -> String {
        self.record_notice_with(
            None,
            NoticeType::Warning,
            message,
            BTreeMap::new(),
            NoticeOptions {
                repeat_after: Some(WARNING_REPEAT_AFTER),
                expire_after: Some(WARNING_EXPIRE_AFTER),
            },
        )
    }

    /// All notices, ordered by id.
    pub fn notices(&self) -> Vec<&Notice> {
        let mut notices: Vec<&Notice> = self.notices.values().collect();
        notices.sort_by_key(|n| n.id.parse::<u64>().unwrap_or(u64::MAX));
        notices
    }

    /// All pending warnings, ordered by last-repeated time.
    pub fn warnings(&self) -> Vec<&Notice> {
        let mut warnings: Vec<&Notice> = self
            .notices
            .values()
            .filter(|n| n.notice_type == NoticeType::Warning)
            .collect();
        warnings.sort_by_key(|n| n.last_repeated);
        warnings
    }

    /// The most recent warning repeat time, cached across prunes.
    pub fn latest_warning_time(&self) -> Option<DateTime<Utc>> {
        self.latest_warning_time
    }

    pub(crate) fn refresh_latest_warning_time(&mut self) {
        self.latest_warning_time = self
            .notices
            .values()
            .filter(|n| n.notice_type == NoticeType::Warning)
            .map(|n| n.last_repeated)
            .max();
    }
}
