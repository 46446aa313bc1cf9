//! 车牌文本规整与校验

use regex::Regex;

use crate::config::GateConfig;
use crate::error::{GateError, Result};

/// 土耳其车牌: 2位省份码 + 1~3位字母 + 1~4位数字
pub const TURKISH_PLATE_PATTERN: &str = "^[0-9]{2}[A-Z]{1,3}[0-9]{1,4}$";

/// 去除首尾空白并转大写
pub fn normalize(text: &str) -> String {
    text.trim().to_uppercase()
}

/// 只保留 [A-Z0-9]
pub fn clean(text: &str) -> String {
    text.to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// 车牌接受规则
#[derive(Clone, Debug)]
pub struct PlateRules {
    min_length: usize,
    format: Option<Regex>,
}

impl PlateRules {
    pub fn new(min_length: usize, enforce_format: bool) -> Result<Self> {
        let format = if enforce_format {
            Some(
                Regex::new(TURKISH_PLATE_PATTERN)
                    .map_err(|e| GateError::InvalidConfig(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self { min_length, format })
    }

    pub fn from_config(config: &GateConfig) -> Result<Self> {
        Self::new(config.min_plate_length, config.enforce_plate_format)
    }

    /// 规整后满足规则则返回车牌文本
    pub fn accept(&self, raw: &str) -> Option<String> {
        let mut plate = normalize(raw);
        if let Some(format) = &self.format {
            plate = clean(&plate);
            if !format.is_match(&plate) {
                return None;
            }
        }
        (plate.chars().count() >= self.min_length).then_some(plate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_uppercases() {
        assert_eq!(normalize("  34abc1234\n"), "34ABC1234");
        assert_eq!(clean("34 abc-1234"), "34ABC1234");
    }

    #[test]
    fn test_min_length_rule() {
        let rules = PlateRules::new(5, false).unwrap();
        assert_eq!(rules.accept("34ABC1234").as_deref(), Some("34ABC1234"));
        assert_eq!(rules.accept(" 06def5678 ").as_deref(), Some("06DEF5678"));
        assert_eq!(rules.accept("12"), None);
        assert_eq!(rules.accept("   "), None);
    }

    #[test]
    fn test_turkish_format_rule() {
        let rules = PlateRules::new(5, true).unwrap();
        assert_eq!(rules.accept("34 ABC 1234").as_deref(), Some("34ABC1234"));
        assert_eq!(rules.accept("06A12").as_deref(), Some("06A12"));
        assert_eq!(rules.accept("ABC12345"), None);
        assert_eq!(rules.accept("34ABCD123"), None);
        assert_eq!(rules.accept("34ABC12345"), None);
    }
}
