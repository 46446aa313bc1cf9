/// 通行决策系统 (Access System)
///
/// - Plate:       车牌文本规整与校验
/// - Ocr:         车牌识别协作方
/// - Store:       授权库 + 通行日志
/// - Coordinator: 冷却 + 裁剪 + 识别 + 决策
pub mod coordinator;
pub mod decision;
pub mod ocr;
pub mod plate;
pub mod store;

pub use coordinator::AccessCoordinator;
pub use decision::{AccessDecision, GateAction, LatestDecision};
pub use ocr::{HttpPlateRecognizer, OcrReading, PlateRecognizer};
pub use plate::PlateRules;
pub use store::{AccessLogEntry, AuthorizationStore, JsonPlateStore, PlateRecord};
