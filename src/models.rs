//! 任务数据模型
//!
//! `TaskRecord` / `TaskCollection` 只承载数据，不包含同步行为。
//! 磁盘上的未知字段通过 `extra` 原样保留，写回时不会丢失。

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 未显式指定 tag 时使用的默认分区
pub const DEFAULT_TAG: &str = "master";

/// 任务 ID
///
/// 磁盘上既可能是数字也可能是字符串。比较、哈希和排序只看规范化后的字符串，
/// 因此 `7` 与 `"7"` 是同一个任务；写回时保持读入时的 JSON 类型。
#[derive(Clone, Debug)]
pub struct TaskId {
    raw: String,
    numeric: bool,
}

impl TaskId {
    /// 字符串形式的 ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            raw: id.into(),
            numeric: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 读入时是否为 JSON 数字
    pub fn is_numeric(&self) -> bool {
        self.numeric
    }
}

impl PartialEq for TaskId {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for TaskId {}

impl Hash for TaskId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId::new(value)
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self {
            raw: value.to_string(),
            numeric: true,
        }
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.numeric {
            if let Ok(n) = self.raw.parse::<serde_json::Number>() {
                return n.serialize(serializer);
            }
        }
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Ok(TaskId::new(s.trim())),
            serde_json::Value::Number(n) => Ok(TaskId {
                raw: n.to_string(),
                numeric: true,
            }),
            other => Err(serde::de::Error::custom(format!(
                "task id must be a string or number, got {}",
                other
            ))),
        }
    }
}

/// 任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Cancelled,
    Blocked,
    Deferred,
    Review,
}

impl TaskStatus {
    /// 大小写不敏感解析，未知值回退为 `pending`
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "pending" | "todo" => TaskStatus::Pending,
            "in-progress" | "inprogress" => TaskStatus::InProgress,
            "done" | "completed" => TaskStatus::Done,
            "cancelled" | "canceled" => TaskStatus::Cancelled,
            "blocked" => TaskStatus::Blocked,
            "deferred" => TaskStatus::Deferred,
            "review" => TaskStatus::Review,
            _ => TaskStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Review => "review",
        }
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(s)) => TaskStatus::parse(&s),
            _ => TaskStatus::Pending,
        })
    }
}

/// 任务优先级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// 大小写不敏感解析，未知值回退为 `medium`
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "low" => TaskPriority::Low,
            "medium" => TaskPriority::Medium,
            "high" => TaskPriority::High,
            "critical" => TaskPriority::Critical,
            _ => TaskPriority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl Serialize for TaskPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(s)) => TaskPriority::parse(&s),
            _ => TaskPriority::Medium,
        })
    }
}

/// 解析失败的时间戳按缺失处理，不阻断整份文件的读取
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    })
}

/// 子任务
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Subtask {
    fn content_key(&self) -> (String, &str, &str, TaskStatus, &str, BTreeSet<&TaskId>) {
        (
            self.id.to_string(),
            self.title.as_str(),
            self.description.as_str(),
            self.status,
            self.details.as_str(),
            self.dependencies.iter().collect(),
        )
    }
}

/// 任务记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    /// 所属分区；磁盘上由外层结构决定，不写入任务对象本身
    #[serde(skip)]
    pub tag: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test_strategy: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    /// 未识别字段原样保留
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<TaskId>, tag: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tag: tag.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            complexity: None,
            details: String::new(),
            test_strategy: String::new(),
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// 与另一条记录相比发生变化的内容字段
    ///
    /// 依赖与子任务按集合比较，顺序不同不算变化；
    /// `updated_at`、`complexity` 与扩展字段不参与比较。
    pub fn changed_fields(&self, other: &TaskRecord) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.title != other.title {
            changed.push("title");
        }
        if self.description != other.description {
            changed.push("description");
        }
        if self.status != other.status {
            changed.push("status");
        }
        if self.priority != other.priority {
            changed.push("priority");
        }
        let deps: BTreeSet<&TaskId> = self.dependencies.iter().collect();
        let other_deps: BTreeSet<&TaskId> = other.dependencies.iter().collect();
        if deps != other_deps {
            changed.push("dependencies");
        }
        let subtasks: BTreeSet<_> = self.subtasks.iter().map(Subtask::content_key).collect();
        let other_subtasks: BTreeSet<_> = other.subtasks.iter().map(Subtask::content_key).collect();
        if subtasks != other_subtasks {
            changed.push("subtasks");
        }
        if self.details != other.details {
            changed.push("details");
        }
        if self.test_strategy != other.test_strategy {
            changed.push("testStrategy");
        }
        changed
    }

    pub fn content_eq(&self, other: &TaskRecord) -> bool {
        self.changed_fields(other).is_empty()
    }
}

/// 按 tag 分区的任务集合
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskCollection {
    tags: BTreeMap<String, Vec<TaskRecord>>,
}

impl TaskCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定 tag 构建集合，顺带回填每条记录的 `tag`
    pub fn from_tasks(tag: impl Into<String>, tasks: Vec<TaskRecord>) -> Self {
        let mut collection = Self::new();
        collection.set_tag(tag, tasks);
        collection
    }

    pub fn set_tag(&mut self, tag: impl Into<String>, mut tasks: Vec<TaskRecord>) {
        let tag = tag.into();
        for task in &mut tasks {
            task.tag = tag.clone();
        }
        self.tags.insert(tag, tasks);
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn tasks(&self, tag: &str) -> &[TaskRecord] {
        self.tags.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TaskRecord])> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn get(&self, tag: &str, id: &TaskId) -> Option<&TaskRecord> {
        self.tags.get(tag)?.iter().find(|t| &t.id == id)
    }

    /// 替换或追加一条记录（按 `task.tag` 定位分区）
    pub fn upsert(&mut self, task: TaskRecord) {
        let tasks = self.tags.entry(task.tag.clone()).or_default();
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
    }

    /// 移除一条记录；分区变空时保留空分区
    pub fn remove(&mut self, tag: &str, id: &TaskId) -> Option<TaskRecord> {
        let tasks = self.tags.get_mut(tag)?;
        let pos = tasks.iter().position(|t| &t.id == id)?;
        Some(tasks.remove(pos))
    }

    pub fn ids(&self, tag: &str) -> BTreeSet<&TaskId> {
        self.tasks(tag).iter().map(|t| &t.id).collect()
    }

    pub fn total_tasks(&self) -> usize {
        self.tags.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks() == 0
    }
}

impl Serialize for TaskCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.tags.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Vec<TaskRecord>>::deserialize(deserializer)?;
        let mut collection = TaskCollection::new();
        for (tag, tasks) in raw {
            collection.set_tag(tag, tasks);
        }
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_parsing_is_lenient() {
        assert_eq!(TaskStatus::parse("DONE"), TaskStatus::Done);
        assert_eq!(TaskStatus::parse("In_Progress"), TaskStatus::InProgress);
        assert_eq!(TaskStatus::parse("canceled"), TaskStatus::Cancelled);
        assert_eq!(TaskStatus::parse("whatever"), TaskStatus::Pending);
        assert_eq!(TaskPriority::parse("HIGH"), TaskPriority::High);
        assert_eq!(TaskPriority::parse("urgent"), TaskPriority::Medium);
    }

    #[test]
    fn test_task_id_keeps_numeric_shape() {
        let task: TaskRecord = serde_json::from_value(json!({
            "id": 7,
            "title": "Write docs",
            "status": "Review",
            "priority": null,
            "dependencies": [1, "2"],
            "customField": {"a": 1}
        }))
        .unwrap();
        assert_eq!(task.id.as_str(), "7");
        assert_eq!(task.status, TaskStatus::Review);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.extra.get("customField"), Some(&json!({"a": 1})));

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["id"], json!(7));
        assert_eq!(back["dependencies"], json!([1, "2"]));
        assert_eq!(back["customField"], json!({"a": 1}));
        assert!(back.get("tag").is_none());
    }

    #[test]
    fn test_leading_zero_id_stays_string() {
        let id = TaskId::new("007");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("007"));
    }

    #[test]
    fn test_string_id_written_back_as_string() {
        let task: TaskRecord = serde_json::from_value(json!({"id": "7", "title": "A"})).unwrap();
        assert!(!task.id.is_numeric());
        assert_eq!(serde_json::to_value(&task).unwrap()["id"], json!("7"));

        // 类型不同但值相同的 ID 指向同一个任务
        let numeric: TaskId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(numeric, task.id);
        let mut seen = std::collections::HashSet::new();
        seen.insert(numeric);
        assert!(seen.contains(&task.id));
    }

    #[test]
    fn test_changed_fields_ignores_order() {
        let mut a = TaskRecord::new(1u64, DEFAULT_TAG, "A");
        a.dependencies = vec![TaskId::from(2u64), TaskId::from(3u64)];
        let mut b = a.clone();
        b.dependencies = vec![TaskId::from(3u64), TaskId::from(2u64)];
        b.updated_at = Some(Utc::now());
        assert!(a.content_eq(&b));

        b.title = "B".into();
        b.status = TaskStatus::Done;
        assert_eq!(a.changed_fields(&b), vec!["title", "status"]);
    }

    #[test]
    fn test_collection_serde_restores_tags() {
        let collection = TaskCollection::from_tasks(
            "feature-x",
            vec![TaskRecord::new(1u64, "feature-x", "First")],
        );
        let json = serde_json::to_string(&collection).unwrap();
        let back: TaskCollection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, collection);
        assert_eq!(back.tasks("feature-x")[0].tag, "feature-x");
    }
}
