use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Account status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Banned,
    Restricted,
    Premium,
}

/// Lifecycle of a download record.
///
/// `pending → downloading → processing → uploading → completed`; any
/// non-terminal state may move to `failed` or `cancelled`. `completed`,
/// `failed` and `cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Processing,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Still owned by a pipeline (counts against the concurrent allowance).
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    fn phase(self) -> u8 {
        match self {
            DownloadStatus::Pending => 0,
            DownloadStatus::Downloading => 1,
            DownloadStatus::Processing => 2,
            DownloadStatus::Uploading => 3,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled => 4,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DownloadStatus::Failed | DownloadStatus::Cancelled => true,
            DownloadStatus::Completed => self == DownloadStatus::Uploading,
            _ => next.phase() > self.phase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub status: UserStatus,
    pub is_admin: bool,
    /// Stored plan name, resolved through the plan registry
    pub plan: String,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A fresh free-plan user.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            username: None,
            status: UserStatus::Active,
            is_admin: false,
            plan: "free".to_string(),
            credits: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_plan(mut self, plan: &str, credits: i64) -> Self {
        self.plan = plan.to_string();
        self.credits = credits;
        self
    }
}

/// Persistent download record; the unit of truth for both pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub status: DownloadStatus,
    /// Percentage within the current phase
    pub progress: f64,
    pub file_size: Option<u64>,
    /// Seconds
    pub duration: Option<u64>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub message_id: Option<i64>,
    /// Remote file reference returned by the transport
    pub file_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub metadata: Value,
}

/// Fields supplied when a download record is created.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewDownload {
    pub user_id: i64,
    pub url: String,
    pub quality: Option<String>,
    pub retry_count: u32,
    pub metadata: Value,
}

impl NewDownload {
    pub fn new(user_id: i64, url: impl Into<String>) -> Self {
        Self {
            user_id,
            url: url.into(),
            metadata: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn into_download(self, id: i64, created_at: DateTime<Utc>) -> Download {
        Download {
            id,
            user_id: self.user_id,
            url: self.url,
            title: None,
            status: DownloadStatus::Pending,
            progress: 0.0,
            file_size: None,
            duration: None,
            format: None,
            quality: self.quality,
            message_id: None,
            file_id: None,
            created_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: self.retry_count,
            metadata: self.metadata,
        }
    }
}

/// Partial update of a download row; `None` leaves a field untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DownloadUpdate {
    pub status: Option<DownloadStatus>,
    pub progress: Option<f64>,
    pub title: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<u64>,
    pub format: Option<String>,
    pub message_id: Option<i64>,
    pub file_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: Option<Value>,
}

impl DownloadUpdate {
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Terminal failure carrying a human-readable message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(DownloadStatus::Failed),
            error_message: Some(message.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// Applies the update to an in-memory record.
    pub fn apply(self, download: &mut Download) {
        if let Some(status) = self.status {
            download.status = status;
        }
        if let Some(progress) = self.progress {
            download.progress = progress;
        }
        if let Some(title) = self.title {
            download.title = Some(title);
        }
        if let Some(file_size) = self.file_size {
            download.file_size = Some(file_size);
        }
        if let Some(duration) = self.duration {
            download.duration = Some(duration);
        }
        if let Some(format) = self.format {
            download.format = Some(format);
        }
        if let Some(message_id) = self.message_id {
            download.message_id = Some(message_id);
        }
        if let Some(file_id) = self.file_id {
            download.file_id = Some(file_id);
        }
        if let Some(started_at) = self.started_at {
            download.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            download.completed_at = Some(completed_at);
        }
        if let Some(error_message) = self.error_message {
            download.error_message = Some(error_message);
        }
        if let Some(metadata) = self.metadata {
            merge_metadata(&mut download.metadata, metadata);
        }
    }
}

/// Top-level JSON merge patch: keys overwrite, `null` removes.
fn merge_metadata(target: &mut Value, patch: Value) {
    let Value::Object(fields) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(existing) = target {
        for (key, value) in fields {
            if value.is_null() {
                existing.remove(&key);
            } else {
                existing.insert(key, value);
            }
        }
    }
}

/// Partial update of a user row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserUpdate {
    pub plan: Option<String>,
    pub credits: Option<i64>,
    pub status: Option<UserStatus>,
}

impl UserUpdate {
    pub fn credits(credits: i64) -> Self {
        Self {
            credits: Some(credits),
            ..Default::default()
        }
    }

    pub fn apply(self, user: &mut User) {
        if let Some(plan) = self.plan {
            user.plan = plan;
        }
        if let Some(credits) = self.credits {
            user.credits = credits;
        }
        if let Some(status) = self.status {
            user.status = status;
        }
    }
}

/// Audit/analytics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_type: String,
    pub user_id: Option<i64>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(event_type: impl Into<String>, user_id: Option<i64>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            user_id,
            data,
            timestamp: Utc::now(),
        }
    }
}
