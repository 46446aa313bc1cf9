//! 车牌识别协作方 (OCR collaborator)

use std::io::Cursor;
use std::time::{Duration, Instant};

use anyhow::Context;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GateConfig;

/// OCR 结果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrReading {
    pub detected: bool,
    pub text: String,
    pub confidence: f32,
}

impl OcrReading {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            detected: true,
            text: text.into(),
            confidence,
        }
    }
}

/// 车牌识别接口: 输入车辆 ROI, 输出文本
pub trait PlateRecognizer: Send {
    fn recognize(&mut self, crop: &RgbImage) -> anyhow::Result<OcrReading>;
}

/// 通过 HTTP 调用外部 OCR 服务
///
/// 请求体为 JPEG 编码的 ROI, 响应为 `{"detected", "text", "confidence"}` JSON
pub struct HttpPlateRecognizer {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpPlateRecognizer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(config.ocr_endpoint.clone(), config.ocr_timeout())
    }
}

impl PlateRecognizer for HttpPlateRecognizer {
    fn recognize(&mut self, crop: &RgbImage) -> anyhow::Result<OcrReading> {
        let t0 = Instant::now();
        let mut jpeg = Vec::new();
        crop.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .context("ROI 编码失败")?;

        let body = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("OCR 请求失败: {}", self.endpoint))?
            .into_string()?;
        let reading: OcrReading = serde_json::from_str(&body).context("OCR 响应解析失败")?;

        debug!(
            "🔤 OCR: {:?} ({:.2}) 耗时 {:.0}ms",
            reading.text,
            reading.confidence,
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_parses_partial_json() {
        let r: OcrReading = serde_json::from_str(r#"{"detected": true, "text": "34ABC123"}"#).unwrap();
        assert!(r.detected);
        assert_eq!(r.text, "34ABC123");
        assert_eq!(r.confidence, 0.0);

        let empty: OcrReading = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, OcrReading::none());
    }

    #[test]
    fn test_unreachable_endpoint_is_an_error() {
        let mut ocr = HttpPlateRecognizer::new("http://127.0.0.1:9/ocr", Duration::from_millis(200));
        let crop = RgbImage::new(64, 64);
        assert!(ocr.recognize(&crop).is_err());
    }
}
