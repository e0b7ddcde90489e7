use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::ScheduleState;

const METADATA_FILE: &str = "metadata.json";
const SCHEDULER_KEY: &str = "scheduler";

/// 스케줄 저장소 - `<instance_dir>/metadata.json`의 `scheduler` 키 관리
///
/// metadata.json은 다른 도구와 공유하므로 모르는 키는 그대로 보존합니다.
pub struct ScheduleStore {
    file_path: PathBuf,
}

impl ScheduleStore {
    pub fn new(instance_dir: &Path) -> Self {
        Self {
            file_path: instance_dir.join(METADATA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// 스케줄 로드 - 파일이나 키가 없으면 `None` (비활성)
    pub fn load(&self) -> Result<Option<ScheduleState>> {
        let metadata = self.read_metadata()?;
        match metadata.get(SCHEDULER_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let state = serde_json::from_value(value.clone())
                    .with_context(|| format!("Invalid scheduler entry in {}", self.file_path.display()))?;
                Ok(Some(state))
            }
        }
    }

    /// 스케줄 저장 - `None`이면 `scheduler` 키를 제거
    pub fn save(&self, state: Option<&ScheduleState>) -> Result<()> {
        let mut metadata = match self.read_metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("[Scheduler] {} is unreadable, rewriting: {}", self.file_path.display(), e);
                Map::new()
            }
        };

        match state {
            Some(state) => {
                metadata.insert(SCHEDULER_KEY.to_string(), serde_json::to_value(state)?);
            }
            None => {
                metadata.remove(SCHEDULER_KEY);
            }
        }

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&Value::Object(metadata))?;
        fs::write(&self.file_path, content)
            .with_context(|| format!("Failed to write {}", self.file_path.display()))?;
        tracing::debug!("[Scheduler] Saved schedule to {}", self.file_path.display());
        Ok(())
    }

    fn read_metadata(&self) -> Result<Map<String, Value>> {
        if !self.file_path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.file_path)?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow::anyhow!("{} is not a JSON object", self.file_path.display())),
        }
    }
}
