//! 授权库 (Authorization store)
//! 车牌白名单 + 通行日志

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::decision::{AccessDecision, GateAction};
use super::plate;
use crate::error::{GateError, Result};

/// 白名单车牌最短长度
pub const MIN_STORED_PLATE_LENGTH: usize = 5;

/// 默认保留的通行日志条数 (超出后丢弃最旧的)
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateRecord {
    pub id: u64,
    pub plate_number: String,
    pub created_at: DateTime<Local>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub plate_number: String,
    pub vehicle_type: String,
    pub action: GateAction,
    pub success: bool,
    pub timestamp: DateTime<Local>,
}

impl From<&AccessDecision> for AccessLogEntry {
    fn from(d: &AccessDecision) -> Self {
        Self {
            plate_number: d.plate_text.clone(),
            vehicle_type: d.vehicle_class.clone(),
            action: d.action,
            success: d.authorized,
            timestamp: d.timestamp,
        }
    }
}

/// 授权库接口; 处理线程与控制面可并发调用
pub trait AuthorizationStore: Send + Sync {
    fn is_authorized(&self, plate_number: &str) -> Result<bool>;

    fn record_access(&self, entry: AccessLogEntry) -> Result<()>;

    /// 按创建时间从新到旧
    fn list_plates(&self) -> Result<Vec<PlateRecord>>;

    /// 重复或格式不合法时返回 `Ok(false)`
    fn add_plate(&self, plate_number: &str) -> Result<bool>;

    fn remove_plate(&self, id: u64) -> Result<bool>;

    /// 最近的通行日志, 从新到旧
    fn recent_access_logs(&self, limit: usize) -> Result<Vec<AccessLogEntry>>;
}

// ========== JSON 文件实现 ==========

#[derive(Clone, Default, Serialize, Deserialize)]
struct StoreData {
    next_id: u64,
    plates: Vec<PlateRecord>,
    access_logs: Vec<AccessLogEntry>,
}

/// 内存表 + 可选 JSON 文件持久化 (每次修改都落盘)
///
/// 修改先作用在副本上, 落盘成功后才替换内存表; 落盘失败时内存状态不变
pub struct JsonPlateStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
    log_capacity: usize,
}

impl JsonPlateStore {
    /// 仅内存, 不落盘
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// 打开库文件; 文件不存在时从空库开始
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path) {
            Ok(json) => {
                let data: StoreData = serde_json::from_str(&json)?;
                info!("📂 授权库已加载: {} ({} 个车牌)", path.display(), data.plates.len());
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📝 授权库不存在, 新建: {}", path.display());
                StoreData::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
            log_capacity: DEFAULT_LOG_CAPACITY,
        })
    }

    /// 通行日志保留上限
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| GateError::Store("授权库锁已损坏".into()))
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn commit<T>(&self, data: &mut StoreData, change: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        if self.path.is_none() {
            return Ok(change(data));
        }
        let mut next = data.clone();
        let out = change(&mut next);
        self.persist(&next)?;
        *data = next;
        Ok(out)
    }
}

impl AuthorizationStore for JsonPlateStore {
    fn is_authorized(&self, plate_number: &str) -> Result<bool> {
        let plate_number = plate::normalize(plate_number);
        let data = self.lock()?;
        Ok(data.plates.iter().any(|p| p.plate_number == plate_number))
    }

    fn record_access(&self, entry: AccessLogEntry) -> Result<()> {
        let mut data = self.lock()?;
        info!("📝 通行日志: {} - {}", entry.plate_number, entry.action);
        let capacity = self.log_capacity;
        self.commit(&mut data, |d| {
            d.access_logs.push(entry);
            let excess = d.access_logs.len().saturating_sub(capacity);
            d.access_logs.drain(..excess);
        })
    }

    fn list_plates(&self) -> Result<Vec<PlateRecord>> {
        let data = self.lock()?;
        let mut plates = data.plates.clone();
        plates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(plates)
    }

    fn add_plate(&self, plate_number: &str) -> Result<bool> {
        let plate_number = plate::normalize(plate_number);
        if plate_number.len() < MIN_STORED_PLATE_LENGTH
            || !plate_number.chars().all(|c| c.is_ascii_alphanumeric())
        {
            warn!("⚠️ 车牌格式不合法: {:?}", plate_number);
            return Ok(false);
        }

        let mut data = self.lock()?;
        if data.plates.iter().any(|p| p.plate_number == plate_number) {
            warn!("⚠️ 车牌已存在: {}", plate_number);
            return Ok(false);
        }

        let record = self.commit(&mut data, |d| {
            d.next_id += 1;
            let record = PlateRecord {
                id: d.next_id,
                plate_number,
                created_at: Local::now(),
            };
            d.plates.push(record.clone());
            record
        })?;
        info!("➕ 车牌已添加: #{} {}", record.id, record.plate_number);
        Ok(true)
    }

    fn remove_plate(&self, id: u64) -> Result<bool> {
        let mut data = self.lock()?;
        if !data.plates.iter().any(|p| p.id == id) {
            warn!("⚠️ 未找到车牌 #{}", id);
            return Ok(false);
        }
        self.commit(&mut data, |d| d.plates.retain(|p| p.id != id))?;
        info!("🗑️ 车牌已删除: #{}", id);
        Ok(true)
    }

    fn recent_access_logs(&self, limit: usize) -> Result<Vec<AccessLogEntry>> {
        let data = self.lock()?;
        Ok(data.access_logs.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(plate: &str, action: GateAction) -> AccessLogEntry {
        AccessLogEntry {
            plate_number: plate.into(),
            vehicle_type: "truck".into(),
            action,
            success: action == GateAction::Open,
            timestamp: Local::now(),
        }
    }

    #[test]
    fn test_add_rejects_duplicates_and_malformed() {
        let store = JsonPlateStore::in_memory();
        assert!(store.add_plate(" 34abc123 ").unwrap());
        assert!(!store.add_plate("34ABC123").unwrap());
        assert!(!store.add_plate("12").unwrap());
        assert!(!store.add_plate("34 AB 12").unwrap());
        assert!(store.is_authorized("34abc123").unwrap());
        assert!(!store.is_authorized("06DEF567").unwrap());
    }

    #[test]
    fn test_list_newest_first_and_ids_never_reused() {
        let store = JsonPlateStore::in_memory();
        store.add_plate("34ABC123").unwrap();
        store.add_plate("06DEF567").unwrap();
        let plates = store.list_plates().unwrap();
        assert_eq!(plates[0].plate_number, "06DEF567");
        assert_eq!(plates[1].plate_number, "34ABC123");

        assert!(store.remove_plate(plates[0].id).unwrap());
        assert!(!store.remove_plate(plates[0].id).unwrap());
        store.add_plate("35XYZ99").unwrap();
        let ids: Vec<u64> = store.list_plates().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn test_access_logs_newest_first() {
        let store = JsonPlateStore::in_memory();
        store.record_access(entry("34ABC123", GateAction::Open)).unwrap();
        store.record_access(entry("06DEF567", GateAction::Denied)).unwrap();
        store.record_access(entry("35XYZ99", GateAction::Denied)).unwrap();

        let logs = store.recent_access_logs(2).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].plate_number, "35XYZ99");
        assert_eq!(logs[1].plate_number, "06DEF567");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("plates.json");
        {
            let store = JsonPlateStore::open(&path).unwrap();
            store.add_plate("34ABC123").unwrap();
            store.record_access(entry("34ABC123", GateAction::Open)).unwrap();
        }
        let store = JsonPlateStore::open(&path).unwrap();
        assert!(store.is_authorized("34ABC123").unwrap());
        assert_eq!(store.recent_access_logs(10).unwrap().len(), 1);
        store.add_plate("06DEF567").unwrap();
        assert_eq!(store.list_plates().unwrap()[0].id, 2);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(JsonPlateStore::open(&path), Err(GateError::Json(_))));
    }

    #[test]
    fn test_failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let path = sub.join("plates.json");
        let store = JsonPlateStore::open(&path).unwrap();

        // 目录位置被普通文件占用, 无法落盘
        fs::write(&sub, "").unwrap();
        assert!(store.add_plate("34ABC123").is_err());
        assert!(!store.is_authorized("34ABC123").unwrap());
        assert!(store.list_plates().unwrap().is_empty());

        fs::remove_file(&sub).unwrap();
        assert!(store.add_plate("34ABC123").unwrap());
        assert_eq!(store.list_plates().unwrap()[0].id, 1);

        // 临时文件位置被目录占用
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        assert!(store.remove_plate(1).is_err());
        assert!(store.is_authorized("34ABC123").unwrap());
        assert!(store.record_access(entry("34ABC123", GateAction::Open)).is_err());
        assert!(store.recent_access_logs(10).unwrap().is_empty());
    }

    #[test]
    fn test_access_logs_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        let store = JsonPlateStore::open(&path).unwrap().with_log_capacity(3);
        for plate in ["34AAA01", "34AAA02", "34AAA03", "34AAA04", "34AAA05"] {
            store.record_access(entry(plate, GateAction::Denied)).unwrap();
        }

        let plates: Vec<String> = store
            .recent_access_logs(10)
            .unwrap()
            .into_iter()
            .map(|l| l.plate_number)
            .collect();
        assert_eq!(plates, vec!["34AAA05", "34AAA04", "34AAA03"]);

        let reopened = JsonPlateStore::open(&path).unwrap();
        assert_eq!(reopened.recent_access_logs(10).unwrap().len(), 3);
    }
}
