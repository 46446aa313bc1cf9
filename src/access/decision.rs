//! 通行决策记录 + 单槽"最新结果"
//! AccessDecision is created once per permitted trigger and never mutated

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Open,
    Denied,
}

impl GateAction {
    pub fn from_authorized(authorized: bool) -> Self {
        if authorized {
            Self::Open
        } else {
            Self::Denied
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次通行决策
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub plate_text: String,
    pub vehicle_class: String,
    pub action: GateAction,
    pub authorized: bool,
    pub timestamp: DateTime<Local>,
}

impl AccessDecision {
    pub fn new(plate_text: String, vehicle_class: String, authorized: bool) -> Self {
        Self {
            plate_text,
            vehicle_class,
            action: GateAction::from_authorized(authorized),
            authorized,
            timestamp: Local::now(),
        }
    }
}

/// 最新决策单槽, 读取即清空 (每个决策只交付给一个读者)
#[derive(Clone, Default)]
pub struct LatestDecision {
    slot: Arc<Mutex<Option<AccessDecision>>>,
}

impl LatestDecision {
    pub fn new() -> Self {
        Self::default()
    }

    /// 覆盖旧值
    pub fn publish(&self, decision: AccessDecision) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(decision);
    }

    /// 原子取出并清空
    pub fn take(&self) -> Option<AccessDecision> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_take_is_consume_once() {
        let latest = LatestDecision::new();
        assert!(latest.take().is_none());

        latest.publish(AccessDecision::new("34ABC123".into(), "truck".into(), true));
        let d = latest.take().unwrap();
        assert_eq!(d.action, GateAction::Open);
        assert!(latest.take().is_none());
    }

    #[test]
    fn test_publish_overwrites_unread() {
        let latest = LatestDecision::new();
        latest.publish(AccessDecision::new("34ABC123".into(), "truck".into(), true));
        latest.publish(AccessDecision::new("06DEF567".into(), "bus".into(), false));
        let d = latest.take().unwrap();
        assert_eq!(d.plate_text, "06DEF567");
        assert_eq!(d.action, GateAction::Denied);
    }

    #[test]
    fn test_concurrent_readers_get_one_copy() {
        let latest = LatestDecision::new();
        latest.publish(AccessDecision::new("34ABC123".into(), "truck".into(), true));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latest = latest.clone();
                thread::spawn(move || latest.take().is_some())
            })
            .collect();
        let delivered = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|got| *got)
            .count();
        assert_eq!(delivered, 1);
    }

    #[test]
    fn test_action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&GateAction::Open).unwrap(), "\"open\"");
        assert_eq!(GateAction::Denied.to_string(), "denied");
    }
}
