//! tasks.json 文件形态
//!
//! 历史上存在三种形态，读取时在边界处一次性规范化：
//!
//! ```text
//! [ {task}, ... ]                                  // 裸数组，tag = master
//! { "tasks": [ ... ], "metadata": {...} }          // 单集合对象，tag = master
//! { "<tag>": { "tasks": [ ... ], "metadata": ... } } // 按 tag 分区
//! ```
//!
//! 写回时统一使用按 tag 分区的形态，并保留分区块中除 `tasks` 之外的字段。

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::models::{TaskCollection, TaskRecord, DEFAULT_TAG};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TasksDocument {
    Bare(Vec<Value>),
    Single {
        tasks: Vec<Value>,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
    Tagged(Map<String, Value>),
}

/// 解析结果
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub collection: TaskCollection,
    /// 每个分区块里除 `tasks` 以外的字段（如 `metadata`）
    pub tag_metadata: BTreeMap<String, Map<String, Value>>,
}

/// 解析任意一种形态的 tasks.json
pub fn parse_document(raw: &[u8]) -> SyncResult<ParsedDocument> {
    let doc: TasksDocument = serde_json::from_slice(raw)
        .map_err(|e| SyncError::read(format!("tasks.json 不是合法的任务文档: {}", e)))?;

    let mut parsed = ParsedDocument::default();
    match doc {
        TasksDocument::Bare(tasks) => {
            let tasks = parse_tasks(DEFAULT_TAG, tasks)?;
            parsed.collection.set_tag(DEFAULT_TAG, tasks);
        }
        TasksDocument::Single { tasks, rest } => {
            let tasks = parse_tasks(DEFAULT_TAG, tasks)?;
            parsed.collection.set_tag(DEFAULT_TAG, tasks);
            if !rest.is_empty() {
                parsed.tag_metadata.insert(DEFAULT_TAG.to_string(), rest);
            }
        }
        TasksDocument::Tagged(blocks) => {
            for (tag, block) in blocks {
                let Value::Object(mut block) = block else {
                    return Err(SyncError::read(format!("分区 `{}` 不是对象", tag)));
                };
                let tasks = match block.remove("tasks") {
                    Some(Value::Array(tasks)) => tasks,
                    Some(_) => {
                        return Err(SyncError::read(format!("分区 `{}` 的 tasks 不是数组", tag)))
                    }
                    None => {
                        return Err(SyncError::read(format!("分区 `{}` 缺少 tasks 字段", tag)))
                    }
                };
                let tasks = parse_tasks(&tag, tasks)?;
                parsed.collection.set_tag(tag.clone(), tasks);
                if !block.is_empty() {
                    parsed.tag_metadata.insert(tag, block);
                }
            }
        }
    }
    Ok(parsed)
}

/// 解析单个分区的任务并按 ID 去重
///
/// 重复 ID 以最后一次出现的内容为准，位置保留在第一次出现处。
fn parse_tasks(tag: &str, raw: Vec<Value>) -> SyncResult<Vec<TaskRecord>> {
    let mut tasks: Vec<TaskRecord> = Vec::with_capacity(raw.len());
    let mut positions = HashMap::new();
    for (index, value) in raw.into_iter().enumerate() {
        let task: TaskRecord = serde_json::from_value(value).map_err(|e| {
            SyncError::read(format!("分区 `{}` 第 {} 个任务无法解析: {}", tag, index, e))
        })?;
        match positions.get(&task.id) {
            Some(&pos) => {
                warn!("[TasksFormat] 分区 `{}` 中任务 ID {} 重复，保留最后一次出现的内容", tag, task.id);
                tasks[pos] = task;
            }
            None => {
                positions.insert(task.id.clone(), tasks.len());
                tasks.push(task);
            }
        }
    }
    Ok(tasks)
}

/// 渲染为按 tag 分区的规范形态（带换行结尾的缩进 JSON）
pub fn render_document(
    collection: &TaskCollection,
    tag_metadata: &BTreeMap<String, Map<String, Value>>,
) -> SyncResult<String> {
    let mut root = Map::new();
    for (tag, tasks) in collection.iter() {
        let mut block = Map::new();
        block.insert("tasks".to_string(), serde_json::to_value(tasks)?);
        if let Some(meta) = tag_metadata.get(tag) {
            for (key, value) in meta {
                if key != "tasks" {
                    block.insert(key.clone(), value.clone());
                }
            }
        }
        root.insert(tag.to_string(), Value::Object(block));
    }
    let mut out = serde_json::to_string_pretty(&Value::Object(root))?;
    out.push('\n');
    Ok(out)
}
